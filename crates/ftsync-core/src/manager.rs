//! Per-VM fault tolerance manager.
//!
//! Entry point for the VM: powers fault tolerance on in either role, exposes
//! the checkpoint API on the master and the cancel API on the standby, and
//! owns the background worker.

use crate::config::{FtmConfig, Role};
use crate::master::{MasterEngine, MasterState};
use crate::standby::{StandbyExit, StandbyServer};
use crate::stats::{FtmStats, StatsCell};
use crate::vm::{VmBackend, VmState};
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

enum Worker {
    Master {
        engine: Arc<MasterEngine>,
        handle: JoinHandle<()>,
    },
    Standby {
        local_addr: SocketAddr,
        handle: JoinHandle<StandbyExit>,
    },
}

/// Fault tolerance of one VM instance
pub struct FaultTolerance {
    role: Role,
    stats: Arc<StatsCell>,
    shutdown: CancellationToken,
    worker: Worker,
}

impl FaultTolerance {
    /// Power on a fault tolerant VM.
    ///
    /// The VM must be powering on. A master disables large pages, completes
    /// the power-on and starts replicating in the background; a standby binds
    /// its listener and waits for the master.
    pub async fn power_on(mut config: FtmConfig, vm: VmBackend) -> Result<Self> {
        config.validate()?;
        let state = vm.lifecycle.state();
        if state != VmState::PoweringOn {
            return Err(Error::invalid_state(format!(
                "fault tolerance requires a powering-on VM, found {}",
                state
            )));
        }
        config.sync_interval = config.effective_sync_interval();

        let stats = Arc::new(StatsCell::new());
        let shutdown = CancellationToken::new();
        let role = config.role;

        let worker = match role {
            Role::Master => {
                if vm.memory.is_using_large_pages() {
                    // Large pages are too big to write-monitor
                    tracing::info!("FTSync: disabling large page usage");
                    vm.memory.set_large_page_usage(false);
                }
                vm.lifecycle.power_on()?;

                let engine = MasterEngine::new(config, vm, stats.clone(), shutdown.clone());
                let handle = tokio::spawn(engine.clone().run());
                Worker::Master { engine, handle }
            }
            Role::Standby => {
                let server =
                    StandbyServer::bind(config, vm, stats.clone(), shutdown.clone()).await?;
                let local_addr = server.local_addr();
                let handle = tokio::spawn(server.serve());
                Worker::Standby { local_addr, handle }
            }
        };

        Ok(Self {
            role,
            stats,
            shutdown,
            worker,
        })
    }

    /// Role of this node
    pub fn role(&self) -> Role {
        self.role
    }

    /// Replication counters
    pub fn stats(&self) -> FtmStats {
        self.stats.snapshot()
    }

    /// Listener address of a standby
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.worker {
            Worker::Standby { local_addr, .. } => Some(*local_addr),
            Worker::Master { .. } => None,
        }
    }

    /// Worker state of a master
    pub fn master_state(&self) -> Option<MasterState> {
        match &self.worker {
            Worker::Master { engine, .. } => Some(engine.state()),
            Worker::Standby { .. } => None,
        }
    }

    /// Whether the background worker has exited
    pub fn is_finished(&self) -> bool {
        match &self.worker {
            Worker::Master { handle, .. } => handle.is_finished(),
            Worker::Standby { handle, .. } => handle.is_finished(),
        }
    }

    /// Checkpoint: synchronize VM state with the standby (no-op on a standby)
    pub async fn sync_state(&self) -> Result<()> {
        match &self.worker {
            Worker::Master { engine, .. } => engine.sync_state().await,
            Worker::Standby { .. } => Ok(()),
        }
    }

    /// Stop a standby's listener and command loop
    pub fn cancel_standby(&self) -> Result<()> {
        match self.worker {
            Worker::Standby { .. } => {
                self.shutdown.cancel();
                Ok(())
            }
            Worker::Master { .. } => Err(Error::NotSupported("cancel_standby on a master")),
        }
    }

    /// Wait for the background worker to finish.
    ///
    /// A standby reports why it stopped serving; a master returns `None`.
    pub async fn join(self) -> Result<Option<StandbyExit>> {
        match self.worker {
            Worker::Master { handle, .. } => {
                handle
                    .await
                    .map_err(|e| Error::internal(format!("master worker failed: {}", e)))?;
                Ok(None)
            }
            Worker::Standby { handle, .. } => handle
                .await
                .map(Some)
                .map_err(|e| Error::internal(format!("standby worker failed: {}", e))),
        }
    }

    /// Signal shutdown and wait for the worker
    pub async fn terminate(self) -> Result<Option<StandbyExit>> {
        tracing::info!("FTSync: terminating {}", self.role);
        self.shutdown.cancel();
        self.join().await
    }
}
