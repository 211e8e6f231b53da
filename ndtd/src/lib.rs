//! The NDT diagnostic server.
//!
//! A client connects to the control port, receives the legacy probe and logs in with the
//! set of tests it wants. The [`scheduler`] admits or refuses it and keeps it queued
//! until it may run; a [`session`] worker then drives the tests through the
//! [`orchestrator`], one [`phases`] module per test, and reports the diagnosis.
//!
//! Kernel telemetry, packet capture and result recording are reached through the
//! traits in [`collab`] and `common::tcpstat`, bundled into a [`ServerContext`].

pub mod collab;
pub mod orchestrator;
pub mod phases;
pub mod scheduler;
pub mod session;

use anyhow::Context;
use common::tcpstat::StatsProvider;
use common::{SchedulerConfig, TestConfig};
use control::PortRanges;
use diagnostics::Thresholds;

use crate::collab::{NoCapture, NullRecorder, PacketCapture, Recorder};

pub use scheduler::{Scheduler, StatsSummary};

/// Everything a session needs besides its own connection; shared by all workers.
#[derive(Debug)]
pub struct ServerContext {
    pub scheduler: SchedulerConfig,
    pub tests: TestConfig,
    pub port_ranges: Option<PortRanges>,
    pub provider: std::sync::Arc<dyn StatsProvider>,
    pub thresholds: Thresholds,
    pub capture: std::sync::Arc<dyn PacketCapture>,
    pub recorder: std::sync::Arc<dyn Recorder>,
}

impl ServerContext {
    pub fn new(
        scheduler: SchedulerConfig,
        tests: TestConfig,
        provider: std::sync::Arc<dyn StatsProvider>,
    ) -> anyhow::Result<Self> {
        let port_ranges = tests
            .port_ranges
            .as_deref()
            .map(PortRanges::parse)
            .transpose()
            .context("invalid data port ranges")?;
        Ok(Self {
            scheduler,
            tests,
            port_ranges,
            provider,
            thresholds: Thresholds::default(),
            capture: std::sync::Arc::new(NoCapture),
            recorder: std::sync::Arc::new(NullRecorder),
        })
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_recorder(mut self, recorder: std::sync::Arc<dyn Recorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_capture(mut self, capture: std::sync::Arc<dyn PacketCapture>) -> Self {
        self.capture = capture;
        self
    }
}

/// Serves clients arriving on `listener` until `cancel` fires.
pub async fn serve(
    listener: tokio::net::TcpListener,
    ctx: std::sync::Arc<ServerContext>,
    cancel: tokio_util::sync::CancellationToken,
) -> anyhow::Result<StatsSummary> {
    Scheduler::new(ctx).run(listener, cancel).await
}
