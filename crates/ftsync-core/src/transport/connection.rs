//! Shared handle to the master/standby socket.
//!
//! The connection is reference counted: the engine task and whichever task
//! runs a state save/load hold clones of the same `Arc`. Each half sits behind
//! its own async mutex and is only locked for the duration of one operation.

use crate::Result;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};

/// Buffered read half
pub type Reader<S> = BufReader<ReadHalf<S>>;

/// A connection over a TCP socket
pub type TcpConnection = Connection<TcpStream>;

/// Bidirectional byte-stream connection between master and standby
pub struct Connection<S> {
    reader: Mutex<Reader<S>>,
    writer: Mutex<WriteHalf<S>>,
    peer: String,
}

impl Connection<TcpStream> {
    /// Wrap a connected TCP socket, disabling Nagle coalescing
    pub fn from_tcp(stream: TcpStream) -> Result<Arc<Self>> {
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Ok(Self::new(stream, peer))
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    /// Wrap any bidirectional stream
    pub fn new(stream: S, peer: impl Into<String>) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        Arc::new(Self {
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(write_half),
            peer: peer.into(),
        })
    }

    /// Peer description for logs
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Acquire the read half
    pub async fn reader(&self) -> MutexGuard<'_, Reader<S>> {
        self.reader.lock().await
    }

    /// Acquire the write half
    pub async fn writer(&self) -> MutexGuard<'_, WriteHalf<S>> {
        self.writer.lock().await
    }

    /// Write `buf` as one unit and flush it
    pub async fn write_all(&self, buf: &[u8]) -> Result<()> {
        let mut writer = self.writer().await;
        writer.write_all(buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read exactly `buf.len()` bytes
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut reader = self.reader().await;
        reader.read_exact(buf).await?;
        Ok(())
    }

    /// Non-blocking check for unread incoming bytes.
    ///
    /// Returns an error if the peer closed the connection.
    pub async fn has_pending_input(&self) -> Result<bool> {
        let mut reader = self.reader().await;
        match tokio::time::timeout(Duration::ZERO, reader.fill_buf()).await {
            Err(_) => Ok(false),
            Ok(Ok(buf)) if buf.is_empty() => Err(closed_by_peer().into()),
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Shut down the write direction; pending peer reads observe EOF
    pub async fn shutdown(&self) -> Result<()> {
        let mut writer = self.writer().await;
        writer.shutdown().await?;
        Ok(())
    }
}

pub(crate) fn closed_by_peer() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read() {
        let (a, b) = tokio::io::duplex(1024);
        let left = Connection::new(a, "left");
        let right = Connection::new(b, "right");

        left.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(right.peer(), "right");
    }

    #[tokio::test]
    async fn test_pending_input_does_not_consume() {
        let (a, b) = tokio::io::duplex(1024);
        let left = Connection::new(a, "left");
        let right = Connection::new(b, "right");

        assert!(!right.has_pending_input().await.unwrap());

        left.write_all(b"x").await.unwrap();
        assert!(right.has_pending_input().await.unwrap());

        let mut buf = [0u8; 1];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
        assert!(!right.has_pending_input().await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_input_reports_peer_close() {
        let (a, b) = tokio::io::duplex(1024);
        let left = Connection::new(a, "left");
        let right = Connection::new(b, "right");

        left.shutdown().await.unwrap();
        assert!(right.has_pending_input().await.is_err());
    }
}
