//! Session admission and queueing.
//!
//! [`SessionQueue`] is the bookkeeping: an ordered queue with `waiting` and `running`
//! counters, mutated only under the scheduler's mutex. [`Scheduler`] drives it from a
//! single `select!` loop that accepts connections, admits finished handshakes, reaps
//! worker tasks and runs periodic housekeeping (timeout eviction, heartbeats and the
//! corruption guard).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use common::error::ExitCode;
use common::{SchedulerConfig, SchedulingMode};
use control::protocol::{LEGACY_PROBE, LOGIN_CAPACITY, Login, LoginError, QueueStatus};
use control::{ControlConnection, MessageType};
use futures::FutureExt;
use tracing::Instrument;

use crate::ServerContext;
use crate::session::{QueueCommand, Worker, WorkerExit};

pub type SessionId = u64;

/// Buffered scheduler commands per worker.
const COMMAND_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Queued,
    Running,
}

#[derive(Debug, Clone)]
pub struct QueuedSession {
    pub id: SessionId,
    pub arrival: Instant,
    pub estimated_start: Instant,
    /// Client answers heartbeat probes
    pub heartbeat: bool,
    pub state: SessionState,
    notified: Option<u32>,
}

/// Inconsistent queue bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueFault {
    #[error("negative session counters (waiting {waiting}, running {running})")]
    NegativeCounter { waiting: i64, running: i64 },
    #[error("{running} sessions running but only {waiting} waiting")]
    RunningExceedsWaiting { waiting: i64, running: i64 },
    #[error("{0} sessions queued while nothing is waiting")]
    OrphanedEntries(usize),
}

/// Ordered queue of admitted sessions.
///
/// `waiting` counts every session in the queue, queued or running; `running` only the
/// dispatched ones. Running sessions always precede queued ones.
#[derive(Debug)]
pub struct SessionQueue {
    mode: SchedulingMode,
    max_clients: usize,
    budget: Duration,
    entries: VecDeque<QueuedSession>,
    waiting: i64,
    running: i64,
}

impl SessionQueue {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            mode: config.mode,
            max_clients: config.max_clients.max(1),
            budget: config.per_session_budget,
            entries: VecDeque::new(),
            waiting: 0,
            running: 0,
        }
    }

    pub fn waiting(&self) -> i64 {
        self.waiting
    }

    pub fn running(&self) -> i64 {
        self.running
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueuedSession> {
        self.entries.iter()
    }

    /// Sessions admitted but not yet dispatched.
    pub fn queued(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.state == SessionState::Queued)
            .count()
    }

    /// Whether a new session would have to be turned away.
    pub fn is_saturated(&self) -> bool {
        let queued = self.queued();
        match self.mode {
            SchedulingMode::Single => queued >= self.max_clients.saturating_sub(1).max(1),
            SchedulingMode::Bounded => queued >= (4 * self.max_clients).saturating_sub(1),
        }
    }

    /// Expected wait of a session with `ahead` sessions in front of it.
    pub fn estimated_wait(&self, ahead: u32) -> Duration {
        self.budget.saturating_mul(rounds_ahead(self.mode, self.max_clients, ahead))
    }

    pub fn enqueue(&mut self, id: SessionId, heartbeat: bool, now: Instant) -> QueuedSession {
        let ahead = u32::try_from(self.entries.len()).unwrap_or(u32::MAX);
        let entry = QueuedSession {
            id,
            arrival: now,
            estimated_start: now + self.estimated_wait(ahead),
            heartbeat,
            state: SessionState::Queued,
            notified: None,
        };
        self.entries.push_back(entry.clone());
        self.waiting += 1;
        entry
    }

    /// Marks the sessions that may start now as running and returns them.
    pub fn dispatch_ready(&mut self) -> Vec<SessionId> {
        let mut started = Vec::new();
        match self.mode {
            SchedulingMode::Single => {
                if self.running == 0
                    && let Some(head) = self.entries.front_mut()
                    && head.state == SessionState::Queued
                {
                    head.state = SessionState::Running;
                    self.running += 1;
                    started.push(head.id);
                }
            }
            SchedulingMode::Bounded => {
                let max = i64::try_from(self.max_clients).unwrap_or(i64::MAX);
                for entry in self.entries.iter_mut() {
                    if self.running >= max {
                        break;
                    }
                    if entry.state == SessionState::Queued {
                        entry.state = SessionState::Running;
                        self.running += 1;
                        started.push(entry.id);
                    }
                }
            }
        }
        started
    }

    /// Drops a session from the queue; unknown ids are ignored.
    pub fn remove(&mut self, id: SessionId) -> Option<SessionState> {
        let index = self.entries.iter().position(|entry| entry.id == id)?;
        let entry = self.entries.remove(index)?;
        self.waiting -= 1;
        if entry.state == SessionState::Running {
            self.running -= 1;
        }
        Some(entry.state)
    }

    /// Queued sessions that have waited longer than `ceiling`.
    pub fn expired(&self, now: Instant, ceiling: Duration) -> Vec<SessionId> {
        self.entries
            .iter()
            .filter(|entry| {
                entry.state == SessionState::Queued
                    && now.saturating_duration_since(entry.arrival) > ceiling
            })
            .map(|entry| entry.id)
            .collect()
    }

    /// Queued heartbeat-capable sessions to probe, skipping the front of the queue.
    pub fn heartbeat_candidates(
        &self,
        threshold: usize,
        skip: usize,
        batch: usize,
    ) -> Vec<SessionId> {
        if self.waiting <= i64::try_from(threshold).unwrap_or(i64::MAX) {
            return Vec::new();
        }
        self.entries
            .iter()
            .skip(skip)
            .filter(|entry| entry.state == SessionState::Queued && entry.heartbeat)
            .take(batch)
            .map(|entry| entry.id)
            .collect()
    }

    /// Queued sessions whose position changed since they were last told.
    ///
    /// The position is in the same units as [`Self::estimated_wait`], never below 1.
    pub fn position_updates(&mut self) -> Vec<(SessionId, u32)> {
        let (mode, max_clients) = (self.mode, self.max_clients);
        let mut updates = Vec::new();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if entry.state != SessionState::Queued {
                continue;
            }
            let index = u32::try_from(index).unwrap_or(u32::MAX);
            let ahead = rounds_ahead(mode, max_clients, index).max(1);
            if entry.notified != Some(ahead) {
                entry.notified = Some(ahead);
                updates.push((entry.id, ahead));
            }
        }
        updates
    }

    pub fn check_invariants(&self) -> Result<(), QueueFault> {
        if self.waiting < 0 || self.running < 0 {
            return Err(QueueFault::NegativeCounter {
                waiting: self.waiting,
                running: self.running,
            });
        }
        if self.running > self.waiting {
            return Err(QueueFault::RunningExceedsWaiting {
                waiting: self.waiting,
                running: self.running,
            });
        }
        if !self.entries.is_empty() && self.waiting == 0 {
            return Err(QueueFault::OrphanedEntries(self.entries.len()));
        }
        Ok(())
    }

    /// Empties the queue and resets both counters.
    pub fn drain(&mut self) -> Vec<SessionId> {
        self.waiting = 0;
        self.running = 0;
        self.entries.drain(..).map(|entry| entry.id).collect()
    }
}

/// Sessions that must finish before the one at `index` starts, counted in whole
/// rounds of `max_clients` in bounded mode.
fn rounds_ahead(mode: SchedulingMode, max_clients: usize, index: u32) -> u32 {
    match mode {
        SchedulingMode::Single => index,
        SchedulingMode::Bounded => index / u32::try_from(max_clients).unwrap_or(u32::MAX),
    }
}

/// Scheduler counters, updated from the loop and readable from anywhere.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub admitted: AtomicU64,
    pub rejected_busy: AtomicU64,
    pub evicted_timeout: AtomicU64,
    pub evicted_heartbeat: AtomicU64,
    pub completed: AtomicU64,
    pub faults: AtomicU64,
}

impl SchedulerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected_busy: self.rejected_busy.load(Ordering::Relaxed),
            evicted_timeout: self.evicted_timeout.load(Ordering::Relaxed),
            evicted_heartbeat: self.evicted_heartbeat.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatsSummary {
    pub admitted: u64,
    pub rejected_busy: u64,
    pub evicted_timeout: u64,
    pub evicted_heartbeat: u64,
    pub completed: u64,
    pub faults: u64,
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "sessions admitted: {}", self.admitted)?;
        writeln!(f, "sessions completed: {}", self.completed)?;
        writeln!(f, "rejected (busy): {}", self.rejected_busy)?;
        writeln!(f, "evicted (queue timeout): {}", self.evicted_timeout)?;
        writeln!(f, "evicted (heartbeat): {}", self.evicted_heartbeat)?;
        write!(f, "scheduler faults: {}", self.faults)
    }
}

#[derive(Debug)]
struct WorkerLink {
    commands: tokio::sync::mpsc::Sender<QueueCommand>,
    abort: tokio::task::AbortHandle,
}

/// A connection that passed the probe and login exchange.
#[derive(Debug)]
pub struct Admitted {
    pub conn: ControlConnection,
    pub login: Login,
}

/// Sends the probe and reads the login; `None` when the client was turned away.
pub async fn handshake(stream: tokio::net::TcpStream) -> anyhow::Result<Option<Admitted>> {
    let mut conn = ControlConnection::new(stream).context("failed to set up control connection")?;
    conn.write_raw(LEGACY_PROBE)
        .await
        .context("failed to send probe")?;
    let login = match conn.recv(LOGIN_CAPACITY).await {
        Ok(message) => Login::parse(&message),
        Err(control::Error::TooLarge { .. }) => Err(LoginError::Malformed),
        Err(err) => return Err(err).context("no login received"),
    };
    match login {
        Ok(login) => Ok(Some(Admitted { conn, login })),
        Err(refusal) => {
            tracing::info!("refusing client: {refusal}");
            conn.send_text(MessageType::Error, &refusal.to_string())
                .await
                .context("failed to send login refusal")?;
            if let Err(err) = conn.close().await {
                tracing::debug!("close after refusal failed: {err}");
            }
            Ok(None)
        }
    }
}

async fn turn_away(mut conn: ControlConnection, status: QueueStatus) {
    if let Err(err) = conn.send(status.to_message()).await {
        tracing::debug!("queue status {} not delivered: {err}", status.code());
    }
    if let Err(err) = conn.close().await {
        tracing::debug!("close failed: {err}");
    }
}

/// The admission loop.
#[derive(Debug)]
pub struct Scheduler {
    ctx: std::sync::Arc<ServerContext>,
    queue: std::sync::Mutex<SessionQueue>,
    links: HashMap<SessionId, WorkerLink>,
    /// Workers told about a fault that have not been reaped yet; nothing is dispatched
    /// until they are gone
    draining: HashMap<SessionId, WorkerLink>,
    drain_deadline: Instant,
    workers: tokio::task::JoinSet<WorkerExit>,
    handshakes: tokio::task::JoinSet<Option<Admitted>>,
    stats: std::sync::Arc<SchedulerStats>,
    next_id: SessionId,
    last_housekeeping: Instant,
}

impl Scheduler {
    pub fn new(ctx: std::sync::Arc<ServerContext>) -> Self {
        let queue = SessionQueue::new(&ctx.scheduler);
        Self {
            ctx,
            queue: std::sync::Mutex::new(queue),
            links: HashMap::new(),
            draining: HashMap::new(),
            drain_deadline: Instant::now(),
            workers: tokio::task::JoinSet::new(),
            handshakes: tokio::task::JoinSet::new(),
            stats: std::sync::Arc::new(SchedulerStats::default()),
            next_id: 1,
            last_housekeeping: Instant::now(),
        }
    }

    pub fn stats(&self) -> std::sync::Arc<SchedulerStats> {
        self.stats.clone()
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, SessionQueue> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Serves until `cancel` fires, then evicts the queue and stops every worker.
    pub async fn run(
        mut self,
        listener: tokio::net::TcpListener,
        cancel: tokio_util::sync::CancellationToken,
    ) -> anyhow::Result<StatsSummary> {
        let interval = self.ctx.scheduler.housekeeping_interval;
        tracing::info!(
            "accepting sessions on {} ({} mode, max {} clients)",
            listener
                .local_addr()
                .context("listener has no local address")?,
            self.ctx.scheduler.mode,
            self.ctx.scheduler.max_clients
        );
        loop {
            let idle = self.queue().is_empty() && self.draining.is_empty();
            let accept = async {
                if idle {
                    Some(listener.accept().await)
                } else {
                    tokio::time::timeout(interval, listener.accept()).await.ok()
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = accept => match accepted {
                    Some(Ok((stream, peer))) => self.spawn_handshake(stream, peer),
                    Some(Err(err)) => tracing::warn!("accept failed: {err}"),
                    None => {}
                },
                Some(joined) = self.handshakes.join_next() => match joined {
                    Ok(Some(admitted)) => self.admit(admitted),
                    Ok(None) => {}
                    Err(err) => tracing::error!("handshake task failed: {err}"),
                },
                Some(joined) = self.workers.join_next() => self.reap(joined),
            }
            if self.last_housekeeping.elapsed() >= interval {
                self.housekeeping();
            }
            self.advance();
        }
        self.shutdown().await;
        let summary = self.stats.summary();
        tracing::info!("scheduler stopped\n{summary}");
        Ok(summary)
    }

    fn spawn_handshake(&mut self, stream: tokio::net::TcpStream, peer: std::net::SocketAddr) {
        let deadline = self.ctx.scheduler.handshake_deadline;
        let span = tracing::info_span!("handshake", %peer);
        self.handshakes.spawn(
            async move {
                match tokio::time::timeout(deadline, handshake(stream)).await {
                    Ok(Ok(admitted)) => admitted,
                    Ok(Err(err)) => {
                        tracing::info!("handshake failed: {err:#}");
                        None
                    }
                    Err(_) => {
                        tracing::info!("no login within {}", humantime::format_duration(deadline));
                        None
                    }
                }
            }
            .instrument(span),
        );
    }

    fn admit(&mut self, admitted: Admitted) {
        let Admitted { conn, login } = admitted;
        let peer = conn.peer_addr();
        if self.queue().is_saturated() {
            SchedulerStats::bump(&self.stats.rejected_busy);
            tracing::info!("queue saturated, turning away {peer}");
            tokio::spawn(turn_away(conn, QueueStatus::ServerBusy));
            return;
        }
        let id = self.next_id;
        self.next_id += 1;
        let now = Instant::now();
        let entry = self.queue().enqueue(id, login.tests.heartbeat_capable(), now);
        tracing::info!(
            "session {id} from {peer} admitted, tests [{}], estimated start in {}",
            login.tests.suite(),
            humantime::format_duration(entry.estimated_start.saturating_duration_since(now))
        );
        let (commands, receiver) = tokio::sync::mpsc::channel(COMMAND_CAPACITY);
        let worker = Worker::new(id, conn, login, receiver, self.ctx.clone());
        let abort = self.workers.spawn(async move {
            let exit = std::panic::AssertUnwindSafe(worker.run())
                .catch_unwind()
                .await
                .ok();
            WorkerExit { id, exit }
        });
        self.links.insert(id, WorkerLink { commands, abort });
        SchedulerStats::bump(&self.stats.admitted);
    }

    fn command(&self, id: SessionId, command: QueueCommand) -> bool {
        let Some(link) = self.links.get(&id) else {
            return false;
        };
        match link.commands.try_send(command) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!("session {id} not taking commands: {err}");
                false
            }
        }
    }

    /// Starts whatever may start and tells queued sessions where they stand.
    fn advance(&mut self) {
        let (started, updates) = {
            let mut queue = self.queue();
            let started = if self.draining.is_empty() {
                queue.dispatch_ready()
            } else {
                Vec::new()
            };
            (started, queue.position_updates())
        };
        for id in started {
            tracing::debug!("dispatching session {id}");
            self.command(id, QueueCommand::Start);
        }
        for (id, ahead) in updates {
            self.command(id, QueueCommand::Position(ahead));
        }
    }

    fn reap(&mut self, joined: Result<WorkerExit, tokio::task::JoinError>) {
        let WorkerExit { id, exit } = match joined {
            Ok(exit) => exit,
            Err(err) if err.is_cancelled() => {
                tracing::debug!("aborted worker reaped");
                return;
            }
            Err(err) => {
                SchedulerStats::bump(&self.stats.faults);
                tracing::error!("worker task failed: {err}");
                return;
            }
        };
        if self.queue().remove(id).is_none() {
            tracing::debug!("session {id} was already removed");
        }
        self.links.remove(&id);
        self.draining.remove(&id);
        match exit {
            Some(ExitCode::HeartbeatFailed) => SchedulerStats::bump(&self.stats.evicted_heartbeat),
            Some(ExitCode::Evicted) => {}
            Some(code) => {
                SchedulerStats::bump(&self.stats.completed);
                tracing::debug!("session {id} reaped with {code}");
            }
            None => {
                SchedulerStats::bump(&self.stats.faults);
                tracing::error!("session {id} panicked");
            }
        }
    }

    fn housekeeping(&mut self) {
        self.last_housekeeping = Instant::now();
        self.expire_draining();
        let checked = self.queue().check_invariants();
        if let Err(fault) = checked {
            self.recover(fault);
            return;
        }
        let config = self.ctx.scheduler;
        let expired = {
            let mut queue = self.queue();
            let expired = queue.expired(Instant::now(), config.max_queue_wait);
            for id in &expired {
                queue.remove(*id);
            }
            expired
        };
        for id in expired {
            SchedulerStats::bump(&self.stats.evicted_timeout);
            tracing::info!(
                "session {id} queued for over {}, evicting",
                humantime::format_duration(config.max_queue_wait)
            );
            if let Some(link) = self.links.remove(&id)
                && link
                    .commands
                    .try_send(QueueCommand::Evict(QueueStatus::ServerBusy))
                    .is_err()
            {
                link.abort.abort();
            }
        }
        let probes = self.queue().heartbeat_candidates(
            config.heartbeat_threshold,
            config.heartbeat_skip,
            config.heartbeat_batch,
        );
        for id in probes {
            self.command(id, QueueCommand::Heartbeat);
        }
    }

    /// Corruption guard: every session is told about the fault and the queue restarts
    /// empty. Dispatch stays blocked until the notified workers are reaped.
    fn recover(&mut self, fault: QueueFault) {
        SchedulerStats::bump(&self.stats.faults);
        let dropped = self.queue().drain();
        tracing::error!(
            "scheduler invariant violated: {fault}; evicting {} sessions",
            dropped.len()
        );
        for (id, link) in self.links.drain() {
            if link
                .commands
                .try_send(QueueCommand::Evict(QueueStatus::ServerFault))
                .is_err()
            {
                link.abort.abort();
                continue;
            }
            tracing::debug!("session {id} notified of the fault");
            self.draining.insert(id, link);
        }
        self.drain_deadline = Instant::now() + self.ctx.scheduler.heartbeat_deadline;
    }

    /// Aborts notified workers still alive past the grace period.
    fn expire_draining(&mut self) {
        if self.draining.is_empty() || Instant::now() < self.drain_deadline {
            return;
        }
        tracing::warn!(
            "stopping {} sessions that outlived the fault notice",
            self.draining.len()
        );
        for (_, link) in self.draining.drain() {
            link.abort.abort();
        }
    }

    async fn shutdown(&mut self) {
        self.handshakes.shutdown().await;
        let queued: Vec<SessionId> = {
            let mut queue = self.queue();
            let queued = queue
                .entries()
                .filter(|entry| entry.state == SessionState::Queued)
                .map(|entry| entry.id)
                .collect();
            queue.drain();
            queued
        };
        tracing::info!("shutting down, {} sessions still queued", queued.len());
        // running sessions keep their links until they finish or the grace runs out
        for id in queued {
            if let Some(link) = self.links.get(&id)
                && let Err(err) = link
                    .commands
                    .try_send(QueueCommand::Evict(QueueStatus::BusyRetryIn60s))
            {
                tracing::debug!("session {id} not taking the shutdown notice: {err}");
                link.abort.abort();
            }
        }
        self.draining.clear();
        let grace = self.ctx.scheduler.heartbeat_deadline;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = self.workers.join_next().await {
                self.reap(joined);
            }
        })
        .await;
        if drained.is_err() {
            tracing::info!("stopping {} running sessions", self.workers.len());
        }
        self.workers.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tracing_test::traced_test;

    fn config(mode: SchedulingMode, max_clients: usize) -> SchedulerConfig {
        SchedulerConfig {
            mode,
            max_clients,
            ..Default::default()
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Admit { heartbeat: bool },
        FinishRunning,
        EvictQueued(usize),
        ReapUnknown,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => any::<bool>().prop_map(|heartbeat| Op::Admit { heartbeat }),
            2 => Just(Op::FinishRunning),
            1 => (0usize..8).prop_map(Op::EvictQueued),
            1 => Just(Op::ReapUnknown),
        ]
    }

    fn apply(queue: &mut SessionQueue, op: &Op, next: &mut SessionId, now: Instant) {
        match op {
            Op::Admit { heartbeat } => {
                if !queue.is_saturated() {
                    queue.enqueue(*next, *heartbeat, now);
                    *next += 1;
                }
            }
            Op::FinishRunning => {
                let running = queue
                    .entries()
                    .find(|entry| entry.state == SessionState::Running)
                    .map(|entry| entry.id);
                if let Some(id) = running {
                    assert_eq!(queue.remove(id), Some(SessionState::Running));
                }
            }
            Op::EvictQueued(nth) => {
                let queued = queue
                    .entries()
                    .filter(|entry| entry.state == SessionState::Queued)
                    .nth(*nth)
                    .map(|entry| entry.id);
                if let Some(id) = queued {
                    assert_eq!(queue.remove(id), Some(SessionState::Queued));
                }
            }
            Op::ReapUnknown => assert_eq!(queue.remove(SessionId::MAX), None),
        }
    }

    proptest! {
        #[test]
        fn single_mode_runs_one_session_in_admission_order(
            ops in prop::collection::vec(op(), 1..200),
            max_clients in 1usize..6,
        ) {
            let mut queue = SessionQueue::new(&config(SchedulingMode::Single, max_clients));
            let now = Instant::now();
            let mut next = 0;
            let mut dispatched = Vec::new();
            for op in &ops {
                apply(&mut queue, op, &mut next, now);
                dispatched.extend(queue.dispatch_ready());
                prop_assert!(queue.running() <= 1);
                prop_assert!(queue.check_invariants().is_ok());
            }
            prop_assert!(dispatched.windows(2).all(|pair| pair[0] < pair[1]));
        }

        #[test]
        fn bounded_mode_respects_the_bound(
            ops in prop::collection::vec(op(), 1..200),
            max_clients in 1usize..6,
        ) {
            let mut queue = SessionQueue::new(&config(SchedulingMode::Bounded, max_clients));
            let now = Instant::now();
            let mut next = 0;
            for op in &ops {
                apply(&mut queue, op, &mut next, now);
                queue.dispatch_ready();
                prop_assert!(queue.running() <= max_clients as i64);
                prop_assert!(queue.check_invariants().is_ok());
            }
        }

        #[test]
        fn counters_never_go_negative(
            ops in prop::collection::vec(op(), 1..200),
            bounded in any::<bool>(),
        ) {
            let mode = if bounded { SchedulingMode::Bounded } else { SchedulingMode::Single };
            let mut queue = SessionQueue::new(&config(mode, 3));
            let now = Instant::now();
            let mut next = 0;
            for op in &ops {
                apply(&mut queue, op, &mut next, now);
                queue.dispatch_ready();
                prop_assert!(queue.waiting() >= 0);
                prop_assert!(queue.running() >= 0);
                prop_assert_eq!(queue.waiting(), queue.len() as i64);
            }
        }
    }

    #[test]
    fn single_mode_saturation_counts_queued_sessions() {
        let mut queue = SessionQueue::new(&config(SchedulingMode::Single, 1));
        let now = Instant::now();
        assert!(!queue.is_saturated());
        queue.enqueue(1, false, now);
        assert_eq!(queue.dispatch_ready(), vec![1]);
        assert!(!queue.is_saturated());
        queue.enqueue(2, false, now);
        assert!(queue.dispatch_ready().is_empty());
        assert_eq!(queue.position_updates(), vec![(2, 1)]);
        assert!(queue.position_updates().is_empty());
        assert!(queue.is_saturated());
        queue.remove(1);
        assert_eq!(queue.dispatch_ready(), vec![2]);
        assert!(queue.position_updates().is_empty());
    }

    #[test]
    fn bounded_mode_saturates_at_four_times_the_bound() {
        let mut queue = SessionQueue::new(&config(SchedulingMode::Bounded, 2));
        let now = Instant::now();
        for id in 0..2 {
            queue.enqueue(id, false, now);
        }
        assert_eq!(queue.dispatch_ready(), vec![0, 1]);
        for id in 2..9 {
            assert!(!queue.is_saturated());
            queue.enqueue(id, false, now);
        }
        assert!(queue.is_saturated());
        assert_eq!(queue.queued(), 7);
    }

    #[test]
    fn bounded_positions_count_rounds_of_sessions() {
        let mut queue = SessionQueue::new(&config(SchedulingMode::Bounded, 4));
        let now = Instant::now();
        for id in 0..6 {
            queue.enqueue(id, false, now);
        }
        assert_eq!(queue.dispatch_ready(), vec![0, 1, 2, 3]);
        assert_eq!(queue.position_updates(), vec![(4, 1), (5, 1)]);
        for id in 6..12 {
            queue.enqueue(id, false, now);
        }
        assert_eq!(
            queue.position_updates(),
            vec![(6, 1), (7, 1), (8, 2), (9, 2), (10, 2), (11, 2)]
        );
        assert_eq!(queue.estimated_wait(8), Duration::from_secs(90));
        queue.remove(0);
        assert_eq!(queue.dispatch_ready(), vec![4]);
        assert_eq!(queue.position_updates(), vec![(8, 1), (9, 1)]);
    }

    #[test]
    fn estimated_start_follows_the_budget() {
        let mut queue = SessionQueue::new(&config(SchedulingMode::Single, 10));
        let now = Instant::now();
        queue.enqueue(1, false, now);
        let second = queue.enqueue(2, false, now);
        assert_eq!(second.estimated_start - now, Duration::from_secs(45));

        let bounded = SessionQueue::new(&config(SchedulingMode::Bounded, 4));
        assert_eq!(bounded.estimated_wait(3), Duration::ZERO);
        assert_eq!(bounded.estimated_wait(8), Duration::from_secs(90));
    }

    #[test]
    fn expired_only_covers_queued_sessions() {
        let mut queue = SessionQueue::new(&config(SchedulingMode::Single, 5));
        let then = Instant::now();
        queue.enqueue(1, false, then);
        queue.enqueue(2, false, then);
        queue.dispatch_ready();
        let later = then + Duration::from_secs(71);
        assert_eq!(queue.expired(later, Duration::from_secs(70)), vec![2]);
        assert!(queue.expired(then, Duration::from_secs(70)).is_empty());
    }

    #[test]
    fn heartbeats_skip_the_front_of_the_queue() {
        let mut queue = SessionQueue::new(&config(SchedulingMode::Bounded, 100));
        let now = Instant::now();
        for id in 0..20 {
            queue.enqueue(id, id % 2 == 0, now);
        }
        assert_eq!(queue.heartbeat_candidates(5, 4, 8), vec![4, 6, 8, 10, 12, 14, 16, 18]);
        assert_eq!(queue.heartbeat_candidates(5, 4, 3), vec![4, 6, 8]);
        assert!(queue.heartbeat_candidates(20, 4, 8).is_empty());
    }

    #[test]
    fn corrupted_counters_are_detected_and_drained() {
        let mut queue = SessionQueue::new(&config(SchedulingMode::Single, 5));
        let now = Instant::now();
        queue.enqueue(1, false, now);
        queue.enqueue(2, false, now);
        queue.running = -1;
        assert!(matches!(
            queue.check_invariants(),
            Err(QueueFault::NegativeCounter { .. })
        ));
        queue.running = 3;
        assert!(matches!(
            queue.check_invariants(),
            Err(QueueFault::RunningExceedsWaiting { .. })
        ));
        queue.running = 0;
        queue.waiting = 0;
        assert_eq!(queue.check_invariants(), Err(QueueFault::OrphanedEntries(2)));
        assert_eq!(queue.drain(), vec![1, 2]);
        assert_eq!((queue.waiting(), queue.running()), (0, 0));
        assert!(queue.check_invariants().is_ok());
    }

    #[tokio::test]
    #[traced_test]
    async fn housekeeping_recovers_from_corruption() -> anyhow::Result<()> {
        let ctx = ServerContext::new(
            SchedulerConfig::default(),
            common::TestConfig::default(),
            common::tcpstat::ProviderKind::TcpInfo.build(),
        )?;
        let mut scheduler = Scheduler::new(std::sync::Arc::new(ctx));
        {
            let mut queue = scheduler.queue();
            queue.enqueue(1, false, Instant::now());
            queue.waiting = -2;
        }
        scheduler.housekeeping();
        assert!(scheduler.queue().is_empty());
        assert!(scheduler.queue().check_invariants().is_ok());
        assert_eq!(scheduler.stats().summary().faults, 1);
        assert!(logs_contain("scheduler invariant violated"));
        Ok(())
    }

    const CAPACITY: usize = 64 * 1024;

    /// Logs a client in over loopback; returns the client end and the admitted session.
    async fn log_in(
        listener: &tokio::net::TcpListener,
        bits: u8,
    ) -> anyhow::Result<(ControlConnection, Admitted)> {
        let addr = listener.local_addr()?;
        let client = async {
            let mut stream = tokio::net::TcpStream::connect(addr).await?;
            let mut probe = [0u8; 13];
            tokio::io::AsyncReadExt::read_exact(&mut stream, &mut probe).await?;
            let mut conn = ControlConnection::new(stream)?;
            conn.send(control::Message::new(MessageType::Login, vec![bits]))
                .await?;
            anyhow::Ok(conn)
        };
        let server = async {
            let (stream, _) = listener.accept().await?;
            handshake(stream).await?.context("login refused")
        };
        tokio::try_join!(client, server)
    }

    async fn expect_status(
        conn: &mut ControlConnection,
        status: QueueStatus,
    ) -> anyhow::Result<()> {
        let message = conn.expect(MessageType::QueueStatus, CAPACITY).await?;
        let text = message.text();
        anyhow::ensure!(
            QueueStatus::parse(&text) == Some(status),
            "expected {status:?}, got {text:?}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn fault_stops_running_session_before_the_next_starts() -> anyhow::Result<()> {
        let ctx = ServerContext::new(
            SchedulerConfig {
                heartbeat_deadline: Duration::from_secs(5),
                ..Default::default()
            },
            common::TestConfig::default(),
            common::tcpstat::ProviderKind::TcpInfo.build(),
        )?;
        let mut scheduler = Scheduler::new(std::sync::Arc::new(ctx));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let meta = control::protocol::TestSet::from_bits(0)
            .with(control::protocol::TestKind::Meta)
            .bits();

        let (mut running, admitted) = log_in(&listener, meta).await?;
        scheduler.admit(admitted);
        scheduler.advance();
        expect_status(&mut running, QueueStatus::StartNow).await?;
        for kind in [
            MessageType::Login,
            MessageType::Login,
            MessageType::TestPrepare,
            MessageType::TestStart,
        ] {
            running.expect(kind, CAPACITY).await?;
        }

        scheduler.queue().waiting = -1;
        scheduler.housekeeping();
        expect_status(&mut running, QueueStatus::ServerFault).await?;
        assert!(running.recv(CAPACITY).await.is_err());

        let (mut next, admitted) = log_in(&listener, meta).await?;
        scheduler.admit(admitted);
        scheduler.advance();
        assert_eq!(scheduler.queue().running(), 0);
        expect_status(&mut next, QueueStatus::Ahead(1)).await?;

        let joined = tokio::time::timeout(Duration::from_secs(5), scheduler.workers.join_next())
            .await?
            .context("no worker to reap")?;
        scheduler.reap(joined);
        scheduler.advance();
        assert_eq!(scheduler.queue().running(), 1);
        expect_status(&mut next, QueueStatus::StartNow).await?;
        assert_eq!(scheduler.stats().summary().faults, 1);
        assert_eq!(scheduler.stats().summary().completed, 0);
        Ok(())
    }

    #[test]
    fn summary_lists_every_counter() {
        let stats = SchedulerStats::default();
        SchedulerStats::bump(&stats.admitted);
        SchedulerStats::bump(&stats.admitted);
        SchedulerStats::bump(&stats.rejected_busy);
        let text = stats.summary().to_string();
        assert!(text.contains("sessions admitted: 2"));
        assert!(text.contains("rejected (busy): 1"));
        assert_eq!(text.lines().count(), 6);
    }
}
