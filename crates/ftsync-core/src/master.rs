//! Master synchronization engine.
//!
//! One background worker per fault tolerant master VM:
//!
//! ```text
//! Connecting -> Authenticating -> FullSyncing -> Idle <-> DeltaSyncing
//!      ^                                           |
//!      +------------- transport failure -----------+      (any) -> ShuttingDown
//! ```
//!
//! Every round runs with the link mutex held, which makes full syncs,
//! checkpoints and steady-state memory rounds mutually exclusive on the wire.

use crate::config::{FtmConfig, Role};
use crate::memsync;
use crate::protocol::{self, Command};
use crate::stats::StatsCell;
use crate::transport::{Connection, FramedStream, StateStream, SyncSession, TcpConnection};
use crate::vm::VmBackend;
use crate::{Error, Result};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

/// Observable state of the master worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    /// Opening a connection to the standby
    Connecting,
    /// Exchanging banner and password
    Authenticating,
    /// Transferring the complete VM state
    FullSyncing,
    /// Waiting for the next sync interval
    Idle,
    /// Running a dirty-memory or checkpoint round
    DeltaSyncing,
    /// Worker is exiting
    ShuttingDown,
}

impl fmt::Display for MasterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MasterState::Connecting => "connecting",
            MasterState::Authenticating => "authenticating",
            MasterState::FullSyncing => "full-syncing",
            MasterState::Idle => "idle",
            MasterState::DeltaSyncing => "delta-syncing",
            MasterState::ShuttingDown => "shutting-down",
        };
        f.write_str(name)
    }
}

/// What a synchronization round transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Complete VM state snapshot
    Full,
    /// Incremental non-memory state (checkpoint)
    DeltaVm,
    /// Dirty guest pages only
    DeltaMemory,
}

/// Live connection to the standby and the session state of its rounds
struct MasterLink {
    conn: Arc<TcpConnection>,
    session: SyncSession,
}

/// Clears the checkpointing flag on every exit path
struct CheckpointGuard<'a>(&'a AtomicBool);

impl Drop for CheckpointGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Master synchronization engine
pub struct MasterEngine {
    config: FtmConfig,
    vm: VmBackend,
    link: Mutex<Option<MasterLink>>,
    checkpointing_active: AtomicBool,
    connect_attempts: AtomicU64,
    state: watch::Sender<MasterState>,
    stats: Arc<StatsCell>,
    shutdown: CancellationToken,
}

impl MasterEngine {
    /// Create an engine; the worker starts with [`MasterEngine::run`]
    pub fn new(
        config: FtmConfig,
        vm: VmBackend,
        stats: Arc<StatsCell>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(MasterState::Connecting);
        Arc::new(Self {
            config,
            vm,
            link: Mutex::new(None),
            checkpointing_active: AtomicBool::new(false),
            connect_attempts: AtomicU64::new(0),
            state,
            stats,
            shutdown,
        })
    }

    /// Current worker state
    pub fn state(&self) -> MasterState {
        *self.state.borrow()
    }

    /// Watch worker state transitions
    pub fn subscribe(&self) -> watch::Receiver<MasterState> {
        self.state.subscribe()
    }

    /// Whether a checkpoint round is in progress
    pub fn is_checkpointing(&self) -> bool {
        self.checkpointing_active.load(Ordering::SeqCst)
    }

    /// Ask the worker to stop at its next wait point
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn set_state(&self, state: MasterState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("FTSync master: {} -> {}", previous, state);
        }
    }

    /// Wait for `timeout`; returns `true` if shutdown was requested instead
    async fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(timeout) => false,
        }
    }

    /// Worker body: connect, replicate, reconnect on transport failure
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            "FTSync master starting (standby {}:{}, interval {:?})",
            self.config.address,
            self.config.port,
            self.config.effective_sync_interval()
        );

        while let Some(conn) = self.connect().await {
            *self.link.lock().await = Some(MasterLink {
                conn,
                session: SyncSession::new(),
            });

            match self.replicate().await {
                Ok(()) => break,
                Err(e) => {
                    tracing::error!("FTSync master: replication session failed: {}", e);
                    self.teardown().await;
                    if self.wait_for_shutdown(self.config.retry_delay).await {
                        break;
                    }
                }
            }
        }

        self.set_state(MasterState::ShuttingDown);
        self.teardown().await;
        tracing::info!("FTSync master stopped");
    }

    /// Connect and authenticate, retrying until success or shutdown
    async fn connect(&self) -> Option<Arc<TcpConnection>> {
        loop {
            self.set_state(MasterState::Connecting);
            if self.connect_attempts.fetch_add(1, Ordering::SeqCst) > 0 {
                self.stats.update(|s| s.reconnects += 1);
            }

            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                attempt = self.try_connect() => attempt,
            };
            match attempt {
                Ok(conn) => return Some(conn),
                Err(Error::AuthenticationFailed) => {
                    tracing::error!("FTSync master: standby rejected the password")
                }
                Err(e) => tracing::warn!(
                    "FTSync master: connecting to {}:{} failed: {}",
                    self.config.address,
                    self.config.port,
                    e
                ),
            }

            if self.wait_for_shutdown(self.config.retry_delay).await {
                return None;
            }
        }
    }

    async fn try_connect(&self) -> Result<Arc<TcpConnection>> {
        let target = (self.config.address.as_str(), self.config.port);
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        let conn = Connection::from_tcp(stream)?;

        self.set_state(MasterState::Authenticating);
        protocol::handshake(
            &conn,
            self.config.password_bytes(),
            self.config.max_line_length,
            self.config.connect_timeout,
        )
        .await?;

        tracing::info!("FTSync master: connected to standby {}", conn.peer());
        Ok(conn)
    }

    /// Drop the link, shutting the socket down
    async fn teardown(&self) {
        if let Some(link) = self.link.lock().await.take() {
            if let Err(e) = link.conn.shutdown().await {
                tracing::debug!("FTSync master: socket shutdown failed: {}", e);
            }
        }
    }

    /// Full sync, then steady-state memory rounds until shutdown or a transport failure
    async fn replicate(&self) -> Result<()> {
        if self.full_sync_until_done().await? {
            return Ok(());
        }

        let interval = self.config.effective_sync_interval();
        loop {
            self.set_state(MasterState::Idle);
            if self.wait_for_shutdown(interval).await {
                return Ok(());
            }
            if self.checkpointing_active.load(Ordering::SeqCst) {
                tracing::trace!("FTSync master: checkpoint in progress, skipping memory round");
                continue;
            }

            match self.locked_round(ReplicationMode::DeltaMemory).await {
                Ok(()) => {}
                Err(_) if self.shutdown.is_cancelled() => return Ok(()),
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        "FTSync master: memory round failed ({}), re-sending full state",
                        e
                    );
                    if self.full_sync_until_done().await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Repeat full syncs on the current link until one succeeds.
    ///
    /// Returns `Ok(true)` if shutdown was requested while waiting to retry.
    async fn full_sync_until_done(&self) -> Result<bool> {
        loop {
            match self.locked_round(ReplicationMode::Full).await {
                Ok(()) => return Ok(false),
                Err(_) if self.shutdown.is_cancelled() => return Ok(true),
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => {
                    tracing::warn!("FTSync master: full sync failed: {}; retrying", e);
                    if self.wait_for_shutdown(self.config.retry_delay).await {
                        return Ok(true);
                    }
                }
            }
        }
    }

    async fn locked_round(&self, mode: ReplicationMode) -> Result<()> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(Error::NotConnected)?;
        self.perform_sync(link, mode).await
    }

    /// External checkpoint: a `DeltaVm` round, exclusive with memory rounds
    pub async fn sync_state(&self) -> Result<()> {
        self.checkpointing_active.store(true, Ordering::SeqCst);
        let _active = CheckpointGuard(&self.checkpointing_active);

        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(Error::NotConnected)?;
        link.session.reset();

        let result = self.perform_sync(link, ReplicationMode::DeltaVm).await;
        if let Err(e) = &result {
            if e.is_transport() {
                tracing::error!("FTSync master: checkpoint lost the link: {}", e);
                if let Some(link) = guard.take() {
                    if let Err(e) = link.conn.shutdown().await {
                        tracing::debug!("FTSync master: socket shutdown failed: {}", e);
                    }
                }
            }
        }
        result
    }

    /// Run one round of `mode` on `link`
    async fn perform_sync(&self, link: &mut MasterLink, mode: ReplicationMode) -> Result<()> {
        let result = match mode {
            ReplicationMode::Full => {
                self.set_state(MasterState::FullSyncing);
                self.full_sync(link).await
            }
            ReplicationMode::DeltaVm => {
                self.set_state(MasterState::DeltaSyncing);
                self.checkpoint(link).await
            }
            ReplicationMode::DeltaMemory => {
                self.set_state(MasterState::DeltaSyncing);
                self.interruptible(self.memory_round(link)).await
            }
        };

        self.stats.update(|s| match (&result, mode) {
            (Err(_), _) => s.failed_rounds += 1,
            (Ok(()), ReplicationMode::Full) => s.full_syncs += 1,
            (Ok(()), ReplicationMode::DeltaVm) => s.checkpoints += 1,
            (Ok(()), ReplicationMode::DeltaMemory) => s.memory_rounds += 1,
        });
        result
    }

    /// Run `round` unless shutdown is requested first
    async fn interruptible<F>(&self, round: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                tracing::info!("FTSync master: round interrupted by shutdown");
                Err(Error::Cancelled)
            }
            result = round => result,
        }
    }

    /// Suspend, run `round`, and always try to resume afterwards
    async fn suspended<F>(&self, round: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        self.vm.lifecycle.suspend()?;
        let result = self.interruptible(round).await;
        let resumed = self.vm.lifecycle.resume();
        if let Err(e) = &resumed {
            tracing::error!("FTSync master: failed to resume the VM: {}", e);
        }
        result.and(resumed)
    }

    async fn full_sync(&self, link: &mut MasterLink) -> Result<()> {
        tracing::info!("FTSync master: starting full sync");
        self.suspended(self.transfer_full_state(link)).await?;
        tracing::info!("FTSync master: full sync complete");
        Ok(())
    }

    async fn transfer_full_state(&self, link: &mut MasterLink) -> Result<()> {
        let limit = self.config.max_line_length;
        protocol::submit_command(&link.conn, Command::FullSync, true, limit).await?;

        link.session.reset();
        let (saved, sent) = {
            let mut stream = FramedStream::new(
                &link.conn,
                &mut link.session,
                Role::Master,
                self.config.read_poll_interval,
            );
            let saved = self.vm.serializer.save(&mut stream, true).await;
            let closed = stream.close(saved.is_err()).await;
            (saved.and(closed), stream.tell())
        };
        self.stats.update(|s| s.sent_state_bytes += sent);

        if let Err(e) = saved {
            if !e.is_transport() {
                // The standby drains the cancelled stream and answers it
                let _ = protocol::read_ack(&link.conn, "full-sync-cancelled", limit).await;
            }
            return Err(e);
        }

        protocol::read_ack(&link.conn, "full-sync-complete", limit).await?;
        self.vm.memory.write_protect_all()
    }

    async fn checkpoint(&self, link: &mut MasterLink) -> Result<()> {
        let limit = self.config.max_line_length;
        self.suspended(async {
            protocol::submit_command(&link.conn, Command::Checkpoint, false, limit).await?;
            self.vm.memory.write_protect_all()
        })
        .await
    }

    async fn memory_round(&self, link: &mut MasterLink) -> Result<()> {
        let limit = self.config.max_line_length;
        protocol::submit_command(&link.conn, Command::MemSync, true, limit).await?;

        match memsync::send_dirty_pages(&link.conn, self.vm.memory.as_ref()).await {
            Ok(report) => {
                self.stats.update(|s| s.sent_memory_bytes += report.bytes);
                protocol::read_ack(&link.conn, "mem-sync-complete", limit).await
            }
            Err(e) if e.is_transport() => Err(e),
            Err(e) => {
                // The empty batch is still answered
                let _ = protocol::read_ack(&link.conn, "mem-sync-complete", limit).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::status;
    use crate::sim::{SimulatedVm, VmEvent};
    use crate::vm::VmLifecycle;
    use tokio::net::TcpListener;

    fn create_test_config(port: u16) -> FtmConfig {
        FtmConfig::master("127.0.0.1", port)
            .with_password("pw")
            .with_retry_delay(Duration::from_millis(50))
            .with_sync_interval(Duration::from_millis(20))
            .with_read_poll_interval(Duration::from_millis(50))
    }

    fn running_vm() -> Arc<SimulatedVm> {
        let vm = SimulatedVm::new(4);
        vm.power_on().unwrap();
        vm
    }

    #[tokio::test]
    async fn test_retries_until_shutdown_when_no_standby() {
        // Reserve a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let stats = Arc::new(StatsCell::new());
        let engine = MasterEngine::new(
            create_test_config(port),
            VmBackend::from_vm(running_vm()),
            stats.clone(),
            CancellationToken::new(),
        );
        let worker = tokio::spawn(engine.clone().run());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(engine.state(), MasterState::Connecting);
        assert!(stats.snapshot().reconnects >= 2);

        engine.shutdown();
        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(engine.state(), MasterState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_sync_state_without_link() {
        let engine = MasterEngine::new(
            create_test_config(6000),
            VmBackend::from_vm(running_vm()),
            Arc::new(StatsCell::new()),
            CancellationToken::new(),
        );
        assert!(matches!(engine.sync_state().await, Err(Error::NotConnected)));
        assert!(!engine.is_checkpointing());
    }

    /// Scripted standby that NACKs the first full sync and ACKs the second
    #[tokio::test]
    async fn test_nacked_full_sync_is_retried_on_the_same_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let standby = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let conn = Connection::from_tcp(socket).unwrap();
            protocol::accept_handshake(&conn, b"pw", Duration::from_secs(5))
                .await
                .unwrap();

            for reply_ok in [false, true] {
                assert_eq!(protocol::read_line(&conn, 128).await.unwrap(), "full-sync");
                protocol::write_ack(&conn).await.unwrap();

                let mut session = SyncSession::new();
                let mut stream = FramedStream::new(
                    &conn,
                    &mut session,
                    Role::Standby,
                    Duration::from_millis(50),
                );
                stream.skip_to_end().await.unwrap();

                if reply_ok {
                    protocol::write_ack(&conn).await.unwrap();
                } else {
                    protocol::write_nack(&conn, status::SERIALIZER, Some("load failed"))
                        .await
                        .unwrap();
                }
            }
            // Keep the link open until the master goes idle
            let _ = protocol::read_line(&conn, 128).await;
        });

        let vm = running_vm();
        let stats = Arc::new(StatsCell::new());
        let engine = MasterEngine::new(
            create_test_config(port).with_sync_interval(Duration::from_secs(60)),
            VmBackend::from_vm(vm.clone()),
            stats.clone(),
            CancellationToken::new(),
        );
        let mut states = engine.subscribe();
        let worker = tokio::spawn(engine.clone().run());

        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == MasterState::Idle),
        )
        .await
        .unwrap()
        .unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.full_syncs, 1);
        assert_eq!(snapshot.failed_rounds, 1);
        assert_eq!(snapshot.reconnects, 0);
        // Both attempts suspended and resumed the guest; only the good one write-protected
        assert_eq!(vm.count(VmEvent::Suspend), 2);
        assert_eq!(vm.count(VmEvent::Resume), 2);
        assert_eq!(vm.count(VmEvent::WriteProtect), 1);

        engine.shutdown();
        worker.await.unwrap();
        standby.await.unwrap();
    }

    /// Scripted standby side of the handshake and one successful full sync
    async fn accept_and_full_sync(listener: TcpListener) -> Arc<TcpConnection> {
        let (socket, _) = listener.accept().await.unwrap();
        let conn = Connection::from_tcp(socket).unwrap();
        protocol::accept_handshake(&conn, b"pw", Duration::from_secs(5))
            .await
            .unwrap();
        drain_full_sync(&conn).await;
        protocol::write_ack(&conn).await.unwrap();
        conn
    }

    async fn drain_full_sync(conn: &TcpConnection) {
        assert_eq!(protocol::read_line(conn, 128).await.unwrap(), "full-sync");
        protocol::write_ack(conn).await.unwrap();
        let mut session = SyncSession::new();
        let mut stream =
            FramedStream::new(conn, &mut session, Role::Standby, Duration::from_millis(50));
        stream.skip_to_end().await.unwrap();
    }

    #[tokio::test]
    async fn test_nacked_memory_round_triggers_full_resync() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let standby = tokio::spawn(async move {
            let conn = accept_and_full_sync(listener).await;

            assert_eq!(protocol::read_line(&conn, 128).await.unwrap(), "mem-sync");
            protocol::write_ack(&conn).await.unwrap();
            let scratch = SimulatedVm::new(4);
            memsync::receive_dirty_pages(&conn, &*scratch).await.unwrap();
            protocol::write_nack(&conn, status::MEMORY, Some("1 of 1 ranges failed"))
                .await
                .unwrap();

            // The lost delta is replaced by a fresh snapshot on the same link
            drain_full_sync(&conn).await;
            protocol::write_ack(&conn).await.unwrap();
            // Swallow later commands unanswered until the master hangs up
            while protocol::read_line(&conn, 128).await.is_ok() {}
        });

        let stats = Arc::new(StatsCell::new());
        let engine = MasterEngine::new(
            create_test_config(port),
            VmBackend::from_vm(running_vm()),
            stats.clone(),
            CancellationToken::new(),
        );
        let worker = tokio::spawn(engine.clone().run());

        tokio::time::timeout(Duration::from_secs(5), async {
            while stats.snapshot().full_syncs < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.reconnects, 0);
        assert_eq!(snapshot.failed_rounds, 1);
        assert_eq!(snapshot.memory_rounds, 0);

        engine.shutdown();
        tokio::time::timeout(Duration::from_secs(3), worker)
            .await
            .unwrap()
            .unwrap();
        standby.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_a_stalled_full_sync() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Takes the whole snapshot but never confirms it
        let standby = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let conn = Connection::from_tcp(socket).unwrap();
            protocol::accept_handshake(&conn, b"pw", Duration::from_secs(5))
                .await
                .unwrap();
            drain_full_sync(&conn).await;
            let _ = protocol::read_line(&conn, 128).await;
        });

        let vm = running_vm();
        let engine = MasterEngine::new(
            create_test_config(port),
            VmBackend::from_vm(vm.clone()),
            Arc::new(StatsCell::new()),
            CancellationToken::new(),
        );
        let mut states = engine.subscribe();
        let worker = tokio::spawn(engine.clone().run());

        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == MasterState::FullSyncing),
        )
        .await
        .unwrap()
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.state(), MasterState::FullSyncing);

        engine.shutdown();
        tokio::time::timeout(Duration::from_secs(3), worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(engine.state(), MasterState::ShuttingDown);
        // The guest is never left suspended
        assert_eq!(vm.state(), crate::vm::VmState::Running);
        assert_eq!(vm.count(VmEvent::Suspend), 1);
        assert_eq!(vm.count(VmEvent::Resume), 1);
        standby.await.unwrap();
    }

    #[tokio::test]
    async fn test_checkpoint_on_a_dead_link_drops_it() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let standby = tokio::spawn(async move {
            drop(accept_and_full_sync(listener).await);
        });

        let vm = running_vm();
        let engine = MasterEngine::new(
            create_test_config(port).with_sync_interval(Duration::from_secs(60)),
            VmBackend::from_vm(vm.clone()),
            Arc::new(StatsCell::new()),
            CancellationToken::new(),
        );
        let mut states = engine.subscribe();
        let worker = tokio::spawn(engine.clone().run());
        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == MasterState::Idle),
        )
        .await
        .unwrap()
        .unwrap();
        standby.await.unwrap();

        // The first fire-and-forget write may still land in the socket buffer
        let mut transport_failure = false;
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            match engine.sync_state().await {
                Ok(()) => {}
                Err(Error::NotConnected) => break,
                Err(e) => {
                    assert!(e.is_transport(), "unexpected error {}", e);
                    transport_failure = true;
                }
            }
        }
        assert!(transport_failure);
        assert!(matches!(engine.sync_state().await, Err(Error::NotConnected)));
        assert!(!engine.is_checkpointing());
        assert_eq!(vm.state(), crate::vm::VmState::Running);

        engine.shutdown();
        tokio::time::timeout(Duration::from_secs(3), worker)
            .await
            .unwrap()
            .unwrap();
    }
}
