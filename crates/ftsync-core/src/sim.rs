//! In-memory VM used by the node binary and the test suites.
//!
//! Guest RAM is a flat byte vector tracked at 4 KiB page granularity. Guest
//! writes mark pages dirty until the next `write_protect_all` or
//! `dirty_ranges` call. The saved state is the RAM image followed by an
//! opaque device blob, written to the stream in bounded chunks with an
//! `is_ok` check between them.

use crate::transport::StateStream;
use crate::vm::{DirtyRange, DirtyRanges, GuestMemory, StateSerializer, VmLifecycle, VmState};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// Page size of the simulated guest
pub const PAGE_SIZE: usize = 4096;

const SAVE_CHUNK: usize = 64 * 1024;

/// Lifecycle and memory events, in call order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmEvent {
    /// `power_on` completed
    PowerOn,
    /// `suspend` completed
    Suspend,
    /// `resume` completed
    Resume,
    /// `write_protect_all` completed
    WriteProtect,
    /// A full state save completed
    Saved,
    /// A full state load completed
    Loaded,
}

struct Inner {
    state: VmState,
    ram: Vec<u8>,
    dirty: BTreeSet<usize>,
    device_state: Vec<u8>,
    large_pages: bool,
    events: Vec<VmEvent>,
    physical_writes: Vec<(u64, usize)>,
    failing_writes: HashSet<u64>,
    fail_loads: bool,
}

/// Simulated VM implementing every collaborator trait
pub struct SimulatedVm {
    inner: Mutex<Inner>,
}

impl SimulatedVm {
    /// A VM in the `PoweringOn` state with `pages` pages of zeroed RAM
    pub fn new(pages: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: VmState::PoweringOn,
                ram: vec![0; pages * PAGE_SIZE],
                dirty: BTreeSet::new(),
                device_state: Vec::new(),
                large_pages: true,
                events: Vec::new(),
                physical_writes: Vec::new(),
                failing_writes: HashSet::new(),
                fail_loads: false,
            }),
        })
    }

    /// Size of guest RAM in bytes
    pub fn ram_size(&self) -> usize {
        self.inner.lock().ram.len()
    }

    /// Write as the guest would, marking the touched pages dirty
    pub fn guest_write(&self, phys_addr: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let range = checked_range(inner.ram.len(), phys_addr, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        let (first, last) = (range.start / PAGE_SIZE, (range.end - 1) / PAGE_SIZE);
        inner.ram[range].copy_from_slice(data);
        inner.dirty.extend(first..=last);
        Ok(())
    }

    /// Copy of guest RAM
    pub fn ram(&self) -> Vec<u8> {
        self.inner.lock().ram.clone()
    }

    /// Replace the opaque device state carried by full syncs
    pub fn set_device_state(&self, blob: impl Into<Vec<u8>>) {
        self.inner.lock().device_state = blob.into();
    }

    /// Current device state blob
    pub fn device_state(&self) -> Vec<u8> {
        self.inner.lock().device_state.clone()
    }

    /// Pages currently marked dirty
    pub fn dirty_page_count(&self) -> usize {
        self.inner.lock().dirty.len()
    }

    /// Events recorded so far
    pub fn events(&self) -> Vec<VmEvent> {
        self.inner.lock().events.clone()
    }

    /// Number of times `event` was recorded
    pub fn count(&self, event: VmEvent) -> usize {
        self.inner.lock().events.iter().filter(|e| **e == event).count()
    }

    /// Successful `write_physical` calls as `(address, length)`
    pub fn physical_writes(&self) -> Vec<(u64, usize)> {
        self.inner.lock().physical_writes.clone()
    }

    /// Make `write_physical` fail for ranges starting at `phys_addr`
    pub fn fail_physical_writes_at(&self, phys_addr: u64) {
        self.inner.lock().failing_writes.insert(phys_addr);
    }

    /// Make state loads fail after reading the RAM size
    pub fn fail_loads(&self, fail: bool) {
        self.inner.lock().fail_loads = fail;
    }

    fn record(&self, event: VmEvent) {
        self.inner.lock().events.push(event);
    }
}

fn checked_range(ram_len: usize, phys_addr: u64, len: usize) -> Result<std::ops::Range<usize>> {
    let start = usize::try_from(phys_addr)
        .map_err(|_| Error::memory(format!("address {:#x} out of range", phys_addr)))?;
    match start.checked_add(len) {
        Some(end) if end <= ram_len => Ok(start..end),
        _ => Err(Error::memory(format!(
            "range {:#x}+{:#x} outside guest RAM ({:#x} bytes)",
            phys_addr, len, ram_len
        ))),
    }
}

impl GuestMemory for SimulatedVm {
    fn dirty_ranges(&self) -> Result<DirtyRanges<'_>> {
        let mut inner = self.inner.lock();
        let pages = std::mem::take(&mut inner.dirty);

        // Coalesce consecutive pages
        let mut runs: Vec<(usize, usize)> = Vec::new();
        for page in pages {
            match runs.last_mut() {
                Some((_, end)) if *end == page => *end += 1,
                _ => runs.push((page, page + 1)),
            }
        }

        let ranges: Vec<DirtyRange> = runs
            .into_iter()
            .map(|(first, end)| {
                let data = &inner.ram[first * PAGE_SIZE..end * PAGE_SIZE];
                DirtyRange::new((first * PAGE_SIZE) as u64, Bytes::copy_from_slice(data))
            })
            .collect();
        Ok(Box::new(ranges.into_iter()))
    }

    fn write_physical(&self, phys_addr: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.failing_writes.contains(&phys_addr) {
            return Err(Error::memory(format!(
                "injected write failure at {:#x}",
                phys_addr
            )));
        }
        let range = checked_range(inner.ram.len(), phys_addr, data.len())?;
        inner.ram[range].copy_from_slice(data);
        inner.physical_writes.push((phys_addr, data.len()));
        Ok(())
    }

    fn write_protect_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.dirty.clear();
        inner.events.push(VmEvent::WriteProtect);
        Ok(())
    }

    fn set_large_page_usage(&self, enabled: bool) {
        self.inner.lock().large_pages = enabled;
    }

    fn is_using_large_pages(&self) -> bool {
        self.inner.lock().large_pages
    }
}

impl VmLifecycle for SimulatedVm {
    fn suspend(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != VmState::Running {
            return Err(Error::vm(format!("cannot suspend a {} VM", inner.state)));
        }
        inner.state = VmState::Suspended;
        inner.events.push(VmEvent::Suspend);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != VmState::Suspended {
            return Err(Error::vm(format!("cannot resume a {} VM", inner.state)));
        }
        inner.state = VmState::Running;
        inner.events.push(VmEvent::Resume);
        Ok(())
    }

    fn power_on(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            VmState::Created | VmState::PoweringOn => {
                inner.state = VmState::Running;
                inner.events.push(VmEvent::PowerOn);
                Ok(())
            }
            state => Err(Error::vm(format!("cannot power on a {} VM", state))),
        }
    }

    fn state(&self) -> VmState {
        self.inner.lock().state
    }
}

#[async_trait]
impl StateSerializer for SimulatedVm {
    async fn save(&self, stream: &mut dyn StateStream, continue_after: bool) -> Result<()> {
        let (ram, device_state) = {
            let inner = self.inner.lock();
            (inner.ram.clone(), inner.device_state.clone())
        };
        tracing::debug!(
            "Saving {} bytes of RAM and {} bytes of device state (continue_after={})",
            ram.len(),
            device_state.len(),
            continue_after
        );

        let result = async {
            stream.write(&(ram.len() as u64).to_le_bytes()).await?;
            for chunk in ram.chunks(SAVE_CHUNK) {
                stream.is_ok().await?;
                stream.write(chunk).await?;
            }
            stream.write(&(device_state.len() as u32).to_le_bytes()).await?;
            stream.write(&device_state).await
        }
        .await;

        stream.close(result.is_err()).await?;
        result?;
        self.record(VmEvent::Saved);
        Ok(())
    }

    async fn load(&self, stream: &mut dyn StateStream) -> Result<()> {
        let mut word = [0u8; 8];
        stream.read_exact(&mut word).await?;
        let ram_len = u64::from_le_bytes(word) as usize;
        if ram_len != self.ram_size() {
            return Err(Error::serializer(format!(
                "saved RAM size {:#x} does not match {:#x}",
                ram_len,
                self.ram_size()
            )));
        }
        if self.inner.lock().fail_loads {
            return Err(Error::serializer("injected load failure"));
        }

        let mut ram = vec![0u8; ram_len];
        for chunk in ram.chunks_mut(SAVE_CHUNK) {
            stream.read_exact(chunk).await?;
        }

        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await?;
        let mut device_state = vec![0u8; u32::from_le_bytes(len) as usize];
        stream.read_exact(&mut device_state).await?;

        let mut inner = self.inner.lock();
        inner.ram = ram;
        inner.device_state = device_state;
        inner.events.push(VmEvent::Loaded);
        Ok(())
    }
}
