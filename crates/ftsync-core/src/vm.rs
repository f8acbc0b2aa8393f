//! Interfaces of the VM components the synchronization core drives.
//!
//! The state serialization engine, the guest memory manager and the VM
//! lifecycle manager live outside this crate. They are consumed through the
//! narrow traits below and bundled per VM in [`VmBackend`].

use crate::Result;
use crate::transport::StateStream;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// VM power state as reported by the lifecycle manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Created, not yet powering on
    Created,
    /// Power-on in progress; the only state fault tolerance can start from
    PoweringOn,
    /// Executing guest code
    Running,
    /// Suspended (e.g. during a full sync)
    Suspended,
    /// Powered off
    Off,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VmState::Created => "created",
            VmState::PoweringOn => "powering-on",
            VmState::Running => "running",
            VmState::Suspended => "suspended",
            VmState::Off => "off",
        };
        f.write_str(name)
    }
}

/// A contiguous run of guest-physical memory modified since the last sync point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyRange {
    /// Guest physical address of the first byte
    pub phys_addr: u64,
    /// Current contents of the range
    pub data: Bytes,
}

impl DirtyRange {
    /// Create a dirty range
    pub fn new(phys_addr: u64, data: impl Into<Bytes>) -> Self {
        Self {
            phys_addr,
            data: data.into(),
        }
    }

    /// Size of the range in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the range is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Finite, single-pass sequence of dirty ranges
pub type DirtyRanges<'a> = Box<dyn Iterator<Item = DirtyRange> + Send + 'a>;

/// State serialization engine (snapshot save/restore)
#[async_trait]
pub trait StateSerializer: Send + Sync {
    /// Save the VM state into `stream`.
    ///
    /// The engine may call `is_ok` between writes to pick up a cancellation
    /// from the receiver, and may `close` the stream when done.
    async fn save(&self, stream: &mut dyn StateStream, continue_after: bool) -> Result<()>;

    /// Restore the VM state from `stream`
    async fn load(&self, stream: &mut dyn StateStream) -> Result<()>;
}

/// Guest memory manager
pub trait GuestMemory: Send + Sync {
    /// Ranges written since the previous call (or since `write_protect_all`).
    ///
    /// Yielding a range re-arms write monitoring for it, so the next call
    /// only reports pages touched after this one.
    fn dirty_ranges(&self) -> Result<DirtyRanges<'_>>;

    /// Write `data` into guest physical memory at `phys_addr`
    fn write_physical(&self, phys_addr: u64, data: &[u8]) -> Result<()>;

    /// Write-protect all guest RAM and forget previously recorded dirty pages
    fn write_protect_all(&self) -> Result<()>;

    /// Enable or disable large page backing
    fn set_large_page_usage(&self, enabled: bool);

    /// Whether guest RAM is backed by large pages
    fn is_using_large_pages(&self) -> bool;
}

/// VM lifecycle (power state) manager
pub trait VmLifecycle: Send + Sync {
    /// Suspend guest execution
    fn suspend(&self) -> Result<()>;
    /// Resume guest execution
    fn resume(&self) -> Result<()>;
    /// Complete power-on
    fn power_on(&self) -> Result<()>;
    /// Current power state
    fn state(&self) -> VmState;
}

/// The external components of one VM instance
#[derive(Clone)]
pub struct VmBackend {
    /// Lifecycle manager
    pub lifecycle: Arc<dyn VmLifecycle>,
    /// Guest memory manager
    pub memory: Arc<dyn GuestMemory>,
    /// State serialization engine
    pub serializer: Arc<dyn StateSerializer>,
}

impl VmBackend {
    /// Bundle separate component implementations
    pub fn new(
        lifecycle: Arc<dyn VmLifecycle>,
        memory: Arc<dyn GuestMemory>,
        serializer: Arc<dyn StateSerializer>,
    ) -> Self {
        Self {
            lifecycle,
            memory,
            serializer,
        }
    }

    /// Use a single object implementing all three components
    pub fn from_vm<V>(vm: Arc<V>) -> Self
    where
        V: VmLifecycle + GuestMemory + StateSerializer + 'static,
    {
        Self {
            lifecycle: vm.clone(),
            memory: vm.clone(),
            serializer: vm,
        }
    }
}

impl fmt::Debug for VmBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmBackend")
            .field("state", &self.lifecycle.state())
            .finish_non_exhaustive()
    }
}
