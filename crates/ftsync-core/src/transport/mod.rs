//! Framed transport between master and standby

pub mod connection;
pub mod frame;
pub mod stream;

pub use connection::{Connection, TcpConnection};
pub use frame::{
    CANCELLED, END_OF_STREAM, FRAME_MAGIC, FrameKind, MAX_FRAME_SIZE, MemoryFrameHeader,
    StreamFrameHeader,
};
pub use stream::{FramedStream, StateStream, StopReading, SyncSession};
