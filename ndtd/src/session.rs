//! The worker task owning one admitted session.
//!
//! While queued the worker only reacts to scheduler commands; once started it runs the
//! orchestrator under the session lifetime deadline and still honours evictions.

use common::error::{ExitCode, SessionError};
use control::protocol::{Login, QueueStatus};
use control::{ControlConnection, MessageType};
use tracing::Instrument;

use crate::ServerContext;
use crate::collab::SessionInfo;
use crate::scheduler::SessionId;

/// Capacity for whatever the client answers a heartbeat with.
const HEARTBEAT_REPLY_CAPACITY: usize = 1024;

/// Scheduler to worker messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCommand {
    /// Number of sessions now ahead in the queue
    Position(u32),
    Heartbeat,
    Start,
    /// Leave the queue, telling the client why
    Evict(QueueStatus),
}

/// How a worker task ended; `exit` is `None` when it panicked.
#[derive(Debug)]
pub struct WorkerExit {
    pub id: SessionId,
    pub exit: Option<ExitCode>,
}

#[derive(Debug)]
pub struct Worker {
    info: SessionInfo,
    conn: ControlConnection,
    login: Login,
    commands: tokio::sync::mpsc::Receiver<QueueCommand>,
    ctx: std::sync::Arc<ServerContext>,
}

impl Worker {
    pub fn new(
        id: SessionId,
        conn: ControlConnection,
        login: Login,
        commands: tokio::sync::mpsc::Receiver<QueueCommand>,
        ctx: std::sync::Arc<ServerContext>,
    ) -> Self {
        let info = SessionInfo::new(id, conn.peer_addr(), login.client_version.clone());
        Self {
            info,
            conn,
            login,
            commands,
            ctx,
        }
    }

    pub async fn run(self) -> ExitCode {
        let span = tracing::info_span!("session", id = self.info.id, peer = %self.info.peer);
        self.serve().instrument(span).await
    }

    async fn serve(mut self) -> ExitCode {
        self.conn.set_deadline(self.ctx.tests.control_deadline);
        let exit = match self.wait_for_start().await {
            Some(exit) => exit,
            None => self.execute().await,
        };
        if let Err(err) = self.conn.close().await {
            tracing::debug!("closing control connection failed: {err}");
        }
        tracing::info!("session ended: {exit}");
        exit
    }

    /// Follows scheduler commands until `Start`; returns the exit code if the session
    /// never gets to run.
    async fn wait_for_start(&mut self) -> Option<ExitCode> {
        loop {
            let Some(command) = self.commands.recv().await else {
                tracing::debug!("scheduler dropped the session");
                return Some(ExitCode::Evicted);
            };
            match command {
                QueueCommand::Start => return None,
                QueueCommand::Position(ahead) => {
                    if let Err(err) = self.conn.send(QueueStatus::Ahead(ahead).to_message()).await
                    {
                        tracing::info!("client left the queue: {err}");
                        return Some(ExitCode::PeerFault);
                    }
                    tracing::debug!("{ahead} sessions ahead");
                }
                QueueCommand::Heartbeat => {
                    if let Err(err) = self.heartbeat().await {
                        tracing::info!("heartbeat failed: {err}");
                        return Some(ExitCode::HeartbeatFailed);
                    }
                }
                QueueCommand::Evict(status) => {
                    tracing::info!("evicted with queue status {}", status.code());
                    if let Err(err) = self.conn.send(status.to_message()).await {
                        tracing::debug!("eviction notice not delivered: {err}");
                    }
                    return Some(ExitCode::Evicted);
                }
            }
        }
    }

    async fn heartbeat(&mut self) -> Result<(), control::Error> {
        self.conn.send(QueueStatus::Heartbeat.to_message()).await?;
        let reply = self
            .conn
            .recv_within(HEARTBEAT_REPLY_CAPACITY, self.ctx.scheduler.heartbeat_deadline)
            .await?;
        tracing::trace!("heartbeat answered with {}", reply.kind);
        Ok(())
    }

    async fn execute(&mut self) -> ExitCode {
        if let Err(err) = self.conn.send(QueueStatus::StartNow.to_message()).await {
            return SessionError::from(err).exit_code();
        }
        let lifetime = self.ctx.scheduler.session_lifetime;
        let outcome = {
            let session = tokio::time::timeout(
                lifetime,
                crate::orchestrator::run(&mut self.conn, &self.login, &self.ctx, &self.info),
            );
            tokio::select! {
                finished = session => Ok(finished),
                status = next_eviction(&mut self.commands) => Err(status),
            }
        };
        match outcome {
            Ok(Ok(Ok(_))) => ExitCode::Success,
            Ok(Ok(Err(err))) => {
                tracing::warn!("session failed: {err:#}");
                err.exit_code()
            }
            Ok(Err(_)) => {
                tracing::warn!(
                    "session exceeded its lifetime of {}",
                    humantime::format_duration(lifetime)
                );
                let notice = "Server: session lifetime exceeded";
                if let Err(err) = self.conn.send_text(MessageType::Error, notice).await {
                    tracing::debug!("lifetime notice not delivered: {err}");
                }
                ExitCode::LifetimeExceeded
            }
            Err(status) => {
                tracing::warn!("stopped mid-session with queue status {}", status.code());
                if let Err(err) = self.conn.send(status.to_message()).await {
                    tracing::debug!("eviction notice not delivered: {err}");
                }
                ExitCode::Evicted
            }
        }
    }
}

/// Waits for an eviction while the session runs; other commands no longer apply and a
/// closed channel leaves the session running.
async fn next_eviction(commands: &mut tokio::sync::mpsc::Receiver<QueueCommand>) -> QueueStatus {
    while let Some(command) = commands.recv().await {
        if let QueueCommand::Evict(status) = command {
            return status;
        }
        tracing::trace!("ignoring {command:?} while running");
    }
    std::future::pending().await
}
