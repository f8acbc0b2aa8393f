//! Dirty-memory replication.
//!
//! A batch is a run of memory-page frames closed by an all-zero sentinel
//! header. The master streams whatever the guest memory manager reports as
//! dirty; the standby applies each range to its own guest memory and answers
//! the whole batch with a single ACK or NACK.

use crate::transport::{Connection, MAX_FRAME_SIZE, MemoryFrameHeader};
use crate::vm::GuestMemory;
use crate::{Error, Result};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Totals of one dirty-page batch
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Page ranges carried by the batch
    pub ranges: u64,
    /// Payload bytes carried by the batch
    pub bytes: u64,
    /// Ranges the standby failed to apply
    pub failed: u64,
    /// First apply failure, if any
    pub first_error: Option<Error>,
}

impl BatchReport {
    /// Whether every range was applied
    pub fn is_clean(&self) -> bool {
        self.first_error.is_none()
    }
}

/// Stream every dirty range followed by the end-of-batch sentinel.
///
/// If enumeration fails the sentinel is still sent, so the standby answers an
/// empty batch and the command channel stays aligned.
pub async fn send_dirty_pages<S>(
    conn: &Connection<S>,
    memory: &dyn GuestMemory,
) -> Result<BatchReport>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut report = BatchReport::default();
    let mut frame = BytesMut::new();

    let ranges = match memory.dirty_ranges() {
        Ok(ranges) => ranges,
        Err(e) => {
            tracing::error!("FTSync: dirty page enumeration failed: {}", e);
            MemoryFrameHeader::end_of_batch().encode_into(&mut frame);
            conn.write_all(&frame).await?;
            return Err(e);
        }
    };

    for range in ranges {
        // Ranges larger than a frame are split; the standby rejects oversized frames
        let mut phys_addr = range.phys_addr;
        for chunk in range.data.chunks(MAX_FRAME_SIZE as usize) {
            let size = chunk.len() as u32;
            frame.clear();
            MemoryFrameHeader::range(phys_addr, size).encode_into(&mut frame);
            frame.extend_from_slice(chunk);
            conn.write_all(&frame).await?;

            tracing::trace!("FTSync: sent dirty range {:#x}+{:#x}", phys_addr, size);
            report.ranges += 1;
            report.bytes += u64::from(size);
            phys_addr += u64::from(size);
        }
    }

    frame.clear();
    MemoryFrameHeader::end_of_batch().encode_into(&mut frame);
    conn.write_all(&frame).await?;

    Ok(report)
}

/// Receive a batch and apply it to guest memory.
///
/// A failed physical write does not stop the batch: the remaining frames are
/// still consumed so the connection stays framed, and the failure is returned
/// in the report. Read and framing errors are returned as `Err`.
pub async fn receive_dirty_pages<S>(
    conn: &Connection<S>,
    memory: &dyn GuestMemory,
) -> Result<BatchReport>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut report = BatchReport::default();
    let mut reader = conn.reader().await;
    let mut scratch = Vec::new();

    loop {
        let mut raw = [0u8; MemoryFrameHeader::SIZE];
        if let Err(e) = reader.read_exact(&mut raw).await {
            tracing::error!("FTSync: memory header read failed: {}", e);
            return Err(e.into());
        }

        let header = MemoryFrameHeader::decode(&raw);
        header.check_magic()?;
        if header.is_end_of_batch() {
            break;
        }
        header.validate()?;

        scratch.resize(header.range_size as usize, 0);
        if let Err(e) = reader.read_exact(&mut scratch).await {
            tracing::error!(
                "FTSync: page data read failed ({:#x} bytes): {}",
                header.range_size,
                e
            );
            return Err(e.into());
        }

        report.ranges += 1;
        report.bytes += u64::from(header.range_size);

        if let Err(e) = memory.write_physical(header.phys_addr, &scratch) {
            tracing::warn!(
                "FTSync: failed to apply range {:#x}+{:#x}: {}",
                header.phys_addr,
                header.range_size,
                e
            );
            report.failed += 1;
            report.first_error.get_or_insert(e);
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedVm;
    use crate::transport::FRAME_MAGIC;
    use std::sync::Arc;

    fn pair() -> (
        Arc<Connection<tokio::io::DuplexStream>>,
        Arc<Connection<tokio::io::DuplexStream>>,
    ) {
        let (a, b) = tokio::io::duplex(1 << 16);
        (Connection::new(a, "master"), Connection::new(b, "standby"))
    }

    #[tokio::test]
    async fn test_empty_batch_is_just_the_sentinel() {
        let (master, standby) = pair();
        let vm = SimulatedVm::new(8);

        let report = send_dirty_pages(&master, &*vm).await.unwrap();
        assert_eq!(report.ranges, 0);

        let mut raw = [0u8; MemoryFrameHeader::SIZE];
        standby.read_exact(&mut raw).await.unwrap();
        let header = MemoryFrameHeader::decode(&raw);
        assert_eq!(header.magic, FRAME_MAGIC);
        assert!(header.is_end_of_batch());
        assert_eq!(header.range_size, 0);
        assert_eq!(header.phys_addr, 0);
    }

    #[tokio::test]
    async fn test_batch_applies_ranges() {
        let (master, standby) = pair();
        let source = SimulatedVm::new(8);
        let target = SimulatedVm::new(8);

        source.guest_write(0x1000, &[0x11; 4096]).unwrap();
        source.guest_write(0x5000, &[0x55; 4096]).unwrap();

        let sent = send_dirty_pages(&master, &*source).await.unwrap();
        assert_eq!(sent.ranges, 2);
        assert_eq!(sent.bytes, 8192);

        let received = receive_dirty_pages(&standby, &*target).await.unwrap();
        assert!(received.is_clean());
        assert_eq!(received.ranges, 2);
        assert_eq!(target.physical_writes(), vec![(0x1000, 4096), (0x5000, 4096)]);
        assert_eq!(target.ram(), source.ram());
    }

    #[tokio::test]
    async fn test_apply_failure_drains_batch() {
        let (master, standby) = pair();
        let source = SimulatedVm::new(8);
        let target = SimulatedVm::new(8);

        source.guest_write(0x1000, &[1; 4096]).unwrap();
        source.guest_write(0x3000, &[3; 4096]).unwrap();
        target.fail_physical_writes_at(0x1000);

        send_dirty_pages(&master, &*source).await.unwrap();
        master.write_all(b"heartbeat\n").await.unwrap();

        let report = receive_dirty_pages(&standby, &*target).await.unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.ranges, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(target.physical_writes(), vec![(0x3000, 4096)]);

        // The stream is still aligned on the next command
        let mut line = [0u8; 10];
        standby.read_exact(&mut line).await.unwrap();
        assert_eq!(&line, b"heartbeat\n");
    }

    #[tokio::test]
    async fn test_compressed_frame_is_a_protocol_error() {
        let (master, standby) = pair();
        let target = SimulatedVm::new(8);

        let mut header = MemoryFrameHeader::range(0x1000, 4096);
        header.payload_size = 16;
        let mut frame = BytesMut::new();
        header.encode_into(&mut frame);
        frame.extend_from_slice(&[0u8; 16]);
        master.write_all(&frame).await.unwrap();

        assert!(matches!(
            receive_dirty_pages(&standby, &*target).await,
            Err(Error::Protocol(_))
        ));
        assert!(target.physical_writes().is_empty());
    }

    #[tokio::test]
    async fn test_truncated_batch_is_an_io_error() {
        let (master, standby) = pair();
        let target = SimulatedVm::new(8);

        let mut frame = BytesMut::new();
        MemoryFrameHeader::range(0x2000, 4096).encode_into(&mut frame);
        frame.extend_from_slice(&[7u8; 100]);
        master.write_all(&frame).await.unwrap();
        master.shutdown().await.unwrap();

        assert!(matches!(
            receive_dirty_pages(&standby, &*target).await,
            Err(Error::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_garbage_sentinel_is_rejected() {
        let (master, standby) = pair();
        let target = SimulatedVm::new(8);

        // Zero payload behind a bad magic must not end the batch
        let mut header = MemoryFrameHeader::end_of_batch();
        header.magic = 0xdead_beef;
        let mut frame = BytesMut::new();
        header.encode_into(&mut frame);
        master.write_all(&frame).await.unwrap();

        assert!(matches!(
            receive_dirty_pages(&standby, &*target).await,
            Err(Error::InvalidFrame {
                magic: 0xdead_beef,
                ..
            })
        ));
    }
}
