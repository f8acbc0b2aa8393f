//! FTSync Core - Fault Tolerant VM Synchronization
//!
//! Keeps a standby VM replica synchronized with a running master VM over a
//! TCP link so the standby can take over if the master fails:
//! - Framed byte stream carrying snapshot data between the two nodes
//! - Line-based handshake and command protocol with ACK/NACK replies
//! - Dirty guest page replication between full snapshots
//! - Master worker (connect, full sync, periodic memory rounds, checkpoints)
//! - Standby listener (authenticate one master, apply what it sends)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐        ┌──────────────────────────────┐
//! │       Master (manager)       │        │      Standby (manager)       │
//! │  MasterEngine  ── sync_state │        │  StandbyServer ── cancel     │
//! └──────┬───────────────────────┘        └──────┬───────────────────────┘
//!        │ protocol / memsync                    │ protocol / memsync
//! ┌──────┴───────────────────────┐  TCP   ┌──────┴───────────────────────┐
//! │ transport (frames, stream)   │◄──────►│ transport (frames, stream)   │
//! └──────┬───────────────────────┘        └──────┬───────────────────────┘
//!        │ vm traits                             │ vm traits
//!   serializer / memory / lifecycle         serializer / memory / lifecycle
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod manager;
pub mod master;
pub mod memsync;
pub mod protocol;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod standby;
pub mod stats;
pub mod transport;
pub mod vm;

pub use config::{FtmConfig, Role};
pub use error::{Error, Result};
pub use manager::FaultTolerance;
pub use master::{MasterState, ReplicationMode};
pub use standby::StandbyExit;
pub use stats::FtmStats;
pub use vm::{DirtyRange, GuestMemory, StateSerializer, VmBackend, VmLifecycle, VmState};
