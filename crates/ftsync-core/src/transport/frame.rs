//! Wire headers of the framed state stream and of memory-page batches.
//!
//! ```text
//! stream frame:  [magic:4][length:4][payload:length]
//! memory frame:  [magic:4][range_size:4][phys_addr:8][payload_size:4][payload:payload_size]
//! ```
//!
//! All integers are little-endian.

use crate::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Magic value opening every frame header
pub const FRAME_MAGIC: u32 = 0x1947_1205;

/// Largest payload carried by a single stream frame
pub const MAX_FRAME_SIZE: u32 = 0x00ff_fff8;

/// Length value marking a clean end of stream
pub const END_OF_STREAM: u32 = 0;

/// Length value marking a cancelled stream
pub const CANCELLED: u32 = u32::MAX;

/// What a decoded stream header announces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `length` bytes of payload follow
    Data(u32),
    /// Sender finished the stream
    EndOfStream,
    /// Sender aborted the stream
    Cancelled,
}

/// Header of a plain stream frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFrameHeader {
    /// Must equal [`FRAME_MAGIC`]
    pub magic: u32,
    /// Payload length or one of the sentinels
    pub length: u32,
}

impl StreamFrameHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = 8;

    /// Header for a data frame of `length` bytes
    pub fn data(length: u32) -> Self {
        debug_assert!(length > 0 && length <= MAX_FRAME_SIZE);
        Self {
            magic: FRAME_MAGIC,
            length,
        }
    }

    /// Terminating header (`cancelled` selects the cancellation sentinel)
    pub fn terminator(cancelled: bool) -> Self {
        Self {
            magic: FRAME_MAGIC,
            length: if cancelled { CANCELLED } else { END_OF_STREAM },
        }
    }

    /// Append the encoded header to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.magic);
        buf.put_u32_le(self.length);
    }

    /// Encode to a fixed-size array
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    /// Decode from raw bytes
    pub fn decode(raw: &[u8; Self::SIZE]) -> Self {
        let mut buf = &raw[..];
        Self {
            magic: buf.get_u32_le(),
            length: buf.get_u32_le(),
        }
    }

    /// Validate the header and classify it.
    ///
    /// Sentinels are only honoured behind a valid magic; anything else that
    /// is out of range is rejected before any payload is consumed.
    pub fn kind(&self) -> Result<FrameKind> {
        if self.magic != FRAME_MAGIC {
            return Err(self.invalid());
        }
        match self.length {
            END_OF_STREAM => Ok(FrameKind::EndOfStream),
            CANCELLED => Ok(FrameKind::Cancelled),
            length if length > MAX_FRAME_SIZE => Err(self.invalid()),
            length => Ok(FrameKind::Data(length)),
        }
    }

    fn invalid(&self) -> Error {
        Error::InvalidFrame {
            magic: self.magic,
            length: self.length,
        }
    }
}

/// Header of a memory-page frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryFrameHeader {
    /// Must equal [`FRAME_MAGIC`]
    pub magic: u32,
    /// Uncompressed size of the page range
    pub range_size: u32,
    /// Guest physical address of the range
    pub phys_addr: u64,
    /// Bytes of payload following the header; 0 ends the batch
    pub payload_size: u32,
}

impl MemoryFrameHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = 20;

    /// Header announcing an uncompressed page range
    pub fn range(phys_addr: u64, range_size: u32) -> Self {
        Self {
            magic: FRAME_MAGIC,
            range_size,
            phys_addr,
            payload_size: range_size,
        }
    }

    /// End-of-batch sentinel
    pub fn end_of_batch() -> Self {
        Self {
            magic: FRAME_MAGIC,
            range_size: 0,
            phys_addr: 0,
            payload_size: 0,
        }
    }

    /// Whether this header terminates the batch
    pub fn is_end_of_batch(&self) -> bool {
        self.payload_size == 0
    }

    /// Append the encoded header to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.magic);
        buf.put_u32_le(self.range_size);
        buf.put_u64_le(self.phys_addr);
        buf.put_u32_le(self.payload_size);
    }

    /// Decode from raw bytes
    pub fn decode(raw: &[u8; Self::SIZE]) -> Self {
        let mut buf = &raw[..];
        Self {
            magic: buf.get_u32_le(),
            range_size: buf.get_u32_le(),
            phys_addr: buf.get_u64_le(),
            payload_size: buf.get_u32_le(),
        }
    }

    /// Reject headers that do not open with [`FRAME_MAGIC`], sentinel included
    pub fn check_magic(&self) -> Result<()> {
        if self.magic != FRAME_MAGIC {
            return Err(Error::InvalidFrame {
                magic: self.magic,
                length: self.payload_size,
            });
        }
        Ok(())
    }

    /// Validate a data-carrying header (uncompressed, bounded)
    pub fn validate(&self) -> Result<()> {
        self.check_magic()?;
        if self.payload_size != self.range_size {
            return Err(Error::protocol(format!(
                "compressed page payloads are not supported (range {:#x}, payload {:#x})",
                self.range_size, self.payload_size
            )));
        }
        if self.range_size > MAX_FRAME_SIZE {
            return Err(Error::InvalidFrame {
                magic: self.magic,
                length: self.range_size,
            });
        }
        Ok(())
    }
}
