//! Standby listener engine.
//!
//! Listens for the master, authenticates the first connection that presents
//! the right password, stops listening, then serves commands on that single
//! connection until it fails, an unknown command arrives, or the standby is
//! cancelled.

use crate::config::{FtmConfig, Role};
use crate::memsync;
use crate::protocol::{self, Command};
use crate::stats::StatsCell;
use crate::transport::{Connection, FramedStream, StateStream, SyncSession, TcpConnection};
use crate::vm::VmBackend;
use crate::{Error, Result};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Why the standby stopped serving
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StandbyExit {
    /// Cancelled locally before or during service
    Cancelled,
    /// The master connection failed or was closed
    ConnectionLost,
    /// The master sent a line that is not a known command
    UnknownCommand(String),
}

impl fmt::Display for StandbyExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StandbyExit::Cancelled => f.write_str("cancelled"),
            StandbyExit::ConnectionLost => f.write_str("connection lost"),
            StandbyExit::UnknownCommand(line) => write!(f, "unknown command {:?}", line),
        }
    }
}

/// Standby listener engine
pub struct StandbyServer {
    config: FtmConfig,
    vm: VmBackend,
    stats: Arc<StatsCell>,
    shutdown: CancellationToken,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
}

impl StandbyServer {
    /// Bind the listener on the configured address and port
    pub async fn bind(
        config: FtmConfig,
        vm: VmBackend,
        stats: Arc<StatsCell>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind((config.address.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("FTSync standby listening on {}", local_addr);

        Ok(Self {
            config,
            vm,
            stats,
            shutdown,
            listener: Some(listener),
            local_addr,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the master and serve it until the session ends
    pub async fn serve(mut self) -> StandbyExit {
        let conn = match self.accept_master().await {
            Some(conn) => conn,
            None => return StandbyExit::Cancelled,
        };

        // Single session per lifetime: stop accepting
        self.listener = None;
        tracing::info!("FTSync standby: serving master {}", conn.peer());

        let exit = self.serve_connection(&conn).await;
        tracing::info!("FTSync standby stopped: {}", exit);
        if let Err(e) = conn.shutdown().await {
            tracing::debug!("FTSync standby: socket shutdown failed: {}", e);
        }
        exit
    }

    async fn accept_master(&self) -> Option<Arc<TcpConnection>> {
        let listener = self.listener.as_ref()?;
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                accepted = listener.accept() => accepted,
            };
            let (socket, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("FTSync standby: accept failed: {}", e);
                    continue;
                }
            };
            let conn = match Connection::from_tcp(socket) {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("FTSync standby: failed to set up {}: {}", addr, e);
                    continue;
                }
            };

            let verdict = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                verdict = protocol::accept_handshake(
                    &conn,
                    self.config.password_bytes(),
                    self.config.connect_timeout,
                ) => verdict,
            };
            match verdict {
                Ok(()) => return Some(conn),
                Err(e) => tracing::warn!("FTSync standby: rejected connection from {}: {}", addr, e),
            }
        }
    }

    /// Command loop on an authenticated connection
    pub async fn serve_connection<S>(&self, conn: &Connection<S>) -> StandbyExit
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let limit = self.config.max_line_length;
        let mut session = SyncSession::new();

        loop {
            let line = tokio::select! {
                _ = self.shutdown.cancelled() => return StandbyExit::Cancelled,
                line = protocol::read_line(conn, limit) => line,
            };
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!("FTSync standby: command read failed: {}", e);
                    return StandbyExit::ConnectionLost;
                }
            };

            let command = match Command::parse(&line) {
                Some(command) => command,
                None => {
                    tracing::warn!("FTSync standby: unknown command {:?}", line);
                    return StandbyExit::UnknownCommand(line);
                }
            };

            // A stalled master must not pin the standby inside a round
            let handled = tokio::select! {
                _ = self.shutdown.cancelled() => Err(Error::Cancelled),
                handled = self.handle_command(conn, command, &mut session) => handled,
            };

            match handled {
                Ok(()) => {}
                Err(Error::Cancelled) => return StandbyExit::Cancelled,
                Err(e) => {
                    tracing::error!("FTSync standby: '{}' failed: {}", line, e);
                    return StandbyExit::ConnectionLost;
                }
            }
        }
    }

    async fn handle_command<S>(
        &self,
        conn: &Connection<S>,
        command: Command,
        session: &mut SyncSession,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        match command {
            Command::MemSync => self.apply_memory(conn).await,
            Command::FullSync => self.load_full_state(conn, session).await,
            Command::Heartbeat | Command::Checkpoint => {
                tracing::trace!("FTSync standby: '{}'", command);
                Ok(())
            }
        }
    }

    async fn apply_memory<S>(&self, conn: &Connection<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        protocol::write_ack(conn).await?;

        let report = memsync::receive_dirty_pages(conn, self.vm.memory.as_ref()).await?;
        self.stats.update(|s| {
            s.received_memory_bytes += report.bytes;
            s.pages_applied += report.ranges - report.failed;
            s.page_apply_failures += report.failed;
            if report.is_clean() {
                s.memory_rounds += 1;
            } else {
                s.failed_rounds += 1;
            }
        });

        match &report.first_error {
            None => protocol::write_ack(conn).await,
            Some(e) => {
                let message =
                    format!("{} of {} ranges failed: {}", report.failed, report.ranges, e);
                protocol::write_nack(conn, e.status_code(), Some(&message)).await
            }
        }
    }

    async fn load_full_state<S>(
        &self,
        conn: &Connection<S>,
        session: &mut SyncSession,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        protocol::write_ack(conn).await?;

        session.reset();
        let mut stream =
            FramedStream::new(conn, session, Role::Standby, self.config.read_poll_interval);

        let loaded = self.vm.serializer.load(&mut stream).await;
        stream.close(false).await?;

        let verdict = match loaded {
            Err(e) => {
                tracing::error!("FTSync standby: state load failed: {}", e);
                // Skip what the loader left unread so the reply lands on a line boundary
                stream.skip_to_end().await?;
                Err(e)
            }
            Ok(()) => Self::drain_end_of_stream(&mut stream).await?,
        };

        let received = stream.tell();
        let loaded_ok = verdict.is_ok();
        self.stats.update(|s| {
            s.received_state_bytes += received;
            if loaded_ok {
                s.full_syncs += 1;
            } else {
                s.failed_rounds += 1;
            }
        });

        match verdict {
            Ok(()) => {
                tracing::info!("FTSync standby: full sync done ({} bytes)", received);
                protocol::write_ack(conn).await
            }
            Err(e) => protocol::write_nack(conn, e.status_code(), Some(&e.to_string())).await,
        }
    }

    /// Consume the terminating header if the loader stopped short of it.
    ///
    /// The outer `Result` is a transport failure; the inner one is the verdict
    /// to report to the master.
    async fn drain_end_of_stream<S>(stream: &mut FramedStream<'_, S>) -> Result<Result<()>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        stream.resume_reading();
        let mut peek = [0u8; 1];
        match stream.read(&mut peek).await {
            Err(Error::EndOfStream) => Ok(Ok(())),
            Ok(_) => {
                stream.skip_to_end().await?;
                Ok(Err(Error::protocol("state stream continues past the saved state")))
            }
            Err(e) if e.is_transport() => Err(e),
            Err(e) => {
                tracing::warn!("FTSync standby: draining the state stream: {}", e);
                Ok(Err(e))
            }
        }
    }
}
