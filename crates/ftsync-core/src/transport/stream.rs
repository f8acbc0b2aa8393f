//! Framed state stream.
//!
//! Presents the forward-only byte stream the serialization engine writes to
//! (master) or reads from (standby), carried over the connection as a
//! sequence of length-prefixed frames terminated by an end-of-stream or
//! cancellation header.

use crate::config::Role;
use crate::transport::connection::{Connection, Reader, closed_by_peer};
use crate::transport::frame::{FrameKind, MAX_FRAME_SIZE, StreamFrameHeader};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use std::io::SeekFrom;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite};

/// Byte stream contract consumed by the serialization engine
#[async_trait]
pub trait StateStream: Send {
    /// Append `buf` to the stream
    async fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Read up to `buf.len()` bytes, returning how many were read
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Fill `buf` completely
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.read(&mut buf[filled..]).await?;
        }
        Ok(())
    }

    /// Reposition the stream
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Current stream offset
    fn tell(&self) -> u64;

    /// Total stream size
    fn size(&self) -> Result<u64>;

    /// Check for an out-of-band cancellation from the receiver
    async fn is_ok(&mut self) -> Result<()>;

    /// Finish the stream (`cancelled` marks an aborted save)
    async fn close(&mut self, cancelled: bool) -> Result<()>;
}

/// Cooperative stop request for a stream reader
#[derive(Debug, Clone, Default)]
pub struct StopReading(Arc<AtomicBool>);

impl StopReading {
    /// Ask the reader to stop at its next poll
    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Synchronization session state of one stream round
#[derive(Debug, Default)]
pub struct SyncSession {
    stream_offset: u64,
    pending_block_remaining: u32,
    end_of_stream: bool,
    stop_reading: StopReading,
    io_error: bool,
    cancelled: bool,
    closed: bool,
}

impl SyncSession {
    /// Fresh session state
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every counter and flag before a new round.
    ///
    /// The stop flag is replaced rather than cleared so a handle taken in a
    /// previous round cannot stop the new one.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Bytes written or read so far
    pub fn stream_offset(&self) -> u64 {
        self.stream_offset
    }

    /// Bytes left in the frame currently being read
    pub fn pending_block_remaining(&self) -> u32 {
        self.pending_block_remaining
    }

    /// Whether a terminating header was received
    pub fn end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Whether an I/O or framing error was latched
    pub fn io_error(&self) -> bool {
        self.io_error
    }

    /// Whether the stream was cancelled
    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    /// Whether a stop was requested
    pub fn stop_requested(&self) -> bool {
        self.stop_reading.is_set()
    }

    /// Handle for stopping a blocked reader from another task
    pub fn stop_handle(&self) -> StopReading {
        self.stop_reading.clone()
    }
}

/// [`StateStream`] over a [`Connection`]
pub struct FramedStream<'a, S> {
    conn: &'a Connection<S>,
    session: &'a mut SyncSession,
    role: Role,
    poll_interval: Duration,
}

impl<'a, S> FramedStream<'a, S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    /// Bind a stream to a connection and session for one round
    pub fn new(
        conn: &'a Connection<S>,
        session: &'a mut SyncSession,
        role: Role,
        poll_interval: Duration,
    ) -> Self {
        Self {
            conn,
            session,
            role,
            poll_interval,
        }
    }

    /// Session state of this round
    pub fn session(&self) -> &SyncSession {
        self.session
    }

    /// Clear a stop request so the trailing terminator can be read
    pub fn resume_reading(&mut self) {
        self.session.stop_reading.clear();
    }

    /// Discard frames until the end-of-stream or cancellation header
    pub async fn skip_to_end(&mut self) -> Result<()> {
        self.resume_reading();
        let mut scratch = vec![0u8; 64 * 1024];
        loop {
            match self.read(&mut scratch).await {
                Ok(_) => {}
                Err(Error::EndOfStream) | Err(Error::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn require_role(&self, role: Role) -> Result<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(Error::WrongRole(self.role.as_str()))
        }
    }

    fn check_latched(&self) -> Result<()> {
        if self.session.end_of_stream {
            return Err(if self.session.cancelled {
                Error::Cancelled
            } else {
                Error::EndOfStream
            });
        }
        if self.session.stop_reading.is_set() {
            return Err(Error::EndOfStream);
        }
        if self.session.io_error {
            return Err(Error::Io(std::io::Error::other(
                "stream failed on an earlier read",
            )));
        }
        Ok(())
    }

    /// Wait until bytes are buffered, re-checking the stop flag every poll
    async fn wait_readable(&mut self, reader: &mut Reader<S>) -> Result<()> {
        loop {
            let ready = match tokio::time::timeout(self.poll_interval, reader.fill_buf()).await {
                Err(_) => false,
                Ok(Ok(buf)) if buf.is_empty() => {
                    self.session.io_error = true;
                    tracing::error!("FTSync/TCP: peer closed the connection mid-stream");
                    return Err(closed_by_peer().into());
                }
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    self.session.io_error = true;
                    tracing::error!("FTSync/TCP: select error: {}", e);
                    return Err(e.into());
                }
            };
            if self.session.stop_reading.is_set() {
                return Err(Error::EndOfStream);
            }
            if ready {
                return Ok(());
            }
        }
    }

    async fn read_header(&mut self, reader: &mut Reader<S>) -> Result<()> {
        self.wait_readable(reader).await?;

        let mut raw = [0u8; StreamFrameHeader::SIZE];
        if let Err(e) = reader.read_exact(&mut raw).await {
            self.session.io_error = true;
            tracing::error!("FTSync/TCP: header read error: {}", e);
            return Err(e.into());
        }

        let header = StreamFrameHeader::decode(&raw);
        match header.kind() {
            Ok(FrameKind::Data(length)) => {
                self.session.pending_block_remaining = length;
            }
            Ok(FrameKind::EndOfStream) => {
                self.session.end_of_stream = true;
                self.session.pending_block_remaining = 0;
                return Err(Error::EndOfStream);
            }
            Ok(FrameKind::Cancelled) => {
                self.session.end_of_stream = true;
                self.session.cancelled = true;
                self.session.pending_block_remaining = 0;
                return Err(Error::Cancelled);
            }
            Err(e) => {
                self.session.io_error = true;
                tracing::error!(
                    "FTSync/TCP: invalid block: magic={:#x} length={:#x}",
                    header.magic,
                    header.length
                );
                return Err(e);
            }
        }

        if self.session.stop_reading.is_set() {
            return Err(Error::EndOfStream);
        }
        Ok(())
    }
}

#[async_trait]
impl<S> StateStream for FramedStream<'_, S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.require_role(Role::Master)?;
        if buf.is_empty() {
            return Ok(());
        }
        if self.session.closed {
            return Err(Error::protocol("write after the stream was closed"));
        }

        let max = MAX_FRAME_SIZE as usize;
        let mut frame = BytesMut::with_capacity(StreamFrameHeader::SIZE + buf.len().min(max));
        for chunk in buf.chunks(max) {
            frame.clear();
            StreamFrameHeader::data(chunk.len() as u32).encode_into(&mut frame);
            frame.extend_from_slice(chunk);

            if let Err(e) = self.conn.write_all(&frame).await {
                self.session.io_error = true;
                tracing::error!("FTSync/TCP: write error: {} (length={:#x})", e, chunk.len());
                return Err(e);
            }
            self.session.stream_offset += chunk.len() as u64;
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.require_role(Role::Standby)?;
        self.check_latched()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let conn = self.conn;
        let mut reader = conn.reader().await;

        if self.session.pending_block_remaining == 0 {
            self.read_header(&mut reader).await?;
        }

        self.wait_readable(&mut reader).await?;
        let want = buf
            .len()
            .min(self.session.pending_block_remaining as usize);
        let read = match reader.read(&mut buf[..want]).await {
            Ok(0) => {
                self.session.io_error = true;
                tracing::error!("FTSync/TCP: peer closed the connection inside a frame");
                return Err(closed_by_peer().into());
            }
            Ok(n) => n,
            Err(e) => {
                self.session.io_error = true;
                tracing::error!("FTSync/TCP: data read error: {} (length={:#x})", e, want);
                return Err(e.into());
            }
        };

        self.session.stream_offset += read as u64;
        self.session.pending_block_remaining -= read as u32;
        Ok(read)
    }

    fn seek(&mut self, _pos: SeekFrom) -> Result<u64> {
        Err(Error::NotSupported("seek on a forward-only stream"))
    }

    fn tell(&self) -> u64 {
        self.session.stream_offset
    }

    fn size(&self) -> Result<u64> {
        Err(Error::NotSupported("size of a forward-only stream"))
    }

    async fn is_ok(&mut self) -> Result<()> {
        if self.role != Role::Master {
            return Ok(());
        }
        match self.conn.has_pending_input().await {
            Ok(false) => Ok(()),
            Ok(true) => {
                tracing::warn!(
                    "FTSync/TCP: incoming data detected by is_ok, assuming it is a cancellation NACK"
                );
                self.session.cancelled = true;
                Err(Error::Cancelled)
            }
            Err(e) => {
                tracing::warn!("FTSync/TCP: is_ok poll failed: {}", e);
                self.session.io_error = true;
                Err(e)
            }
        }
    }

    async fn close(&mut self, cancelled: bool) -> Result<()> {
        if self.session.closed {
            return Ok(());
        }
        self.session.closed = true;

        match self.role {
            Role::Master => {
                let header = StreamFrameHeader::terminator(cancelled);
                if let Err(e) = self.conn.write_all(&header.encode()).await {
                    self.session.io_error = true;
                    tracing::error!("FTSync/TCP: EOF header write error: {}", e);
                    return Err(e);
                }
                if cancelled {
                    self.session.cancelled = true;
                }
            }
            Role::Standby => self.session.stop_reading.signal(),
        }
        Ok(())
    }
}
