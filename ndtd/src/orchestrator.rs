//! Runs the granted tests of one session in order, then classifies and reports.

use common::SchedulingMode;
use common::error::SessionError;
use common::tcpstat::Snapshot;
use common::version::ProtocolVersion;
use control::protocol::{FirewallResult, Login, RESULTS_CHUNK, TestKind, chunk_results};
use control::{ControlConnection, MessageType};
use diagnostics::report::ReportInput;
use diagnostics::{Diagnosis, LinkSpeeds, Observations, PeakSummary, TcpVars};
use tracing::Instrument;

use crate::ServerContext;
use crate::collab::{SessionInfo, SessionSummary};
use crate::phases::c2s::C2sOutcome;
use crate::phases::middlebox::MiddleboxOutcome;
use crate::phases::s2c::S2cOutcome;
use crate::phases::{c2s, firewall, meta, middlebox, s2c};

/// Everything the tests of one session produced; a disabled test leaves `None`.
#[derive(Debug, Default)]
pub struct SessionResults {
    pub middlebox: Option<MiddleboxOutcome>,
    pub firewall: Option<FirewallResult>,
    pub c2s: Option<C2sOutcome>,
    pub s2c: Option<S2cOutcome>,
    pub meta: Vec<(String, String)>,
}

impl SessionResults {
    /// Inputs of the classification engine.
    pub fn observations(&self, concurrent: bool) -> Observations {
        let counters = self.s2c_counters();
        let mut links = LinkSpeeds::default();
        if let Some(c2s) = &self.c2s {
            links.c2s_data = c2s.measured.data_link;
            links.c2s_ack = c2s.measured.ack_link;
        }
        if let Some(s2c) = &self.s2c {
            links.s2c_data = s2c.measured.data_link;
            links.s2c_ack = s2c.measured.ack_link;
        }
        Observations {
            vars: TcpVars::from_snapshot(&counters),
            c2s_kbps: self.c2s.as_ref().map_or(0.0, |c2s| c2s.kbps),
            s2c_kbps: self.s2c.as_ref().map_or(0.0, |s2c| s2c.kbps),
            middlebox_kbps: self.middlebox.as_ref().map_or(0.0, |mid| mid.client_kbps),
            links,
            concurrent,
        }
    }

    fn s2c_counters(&self) -> Snapshot {
        self.s2c
            .as_ref()
            .map(|s2c| s2c.measured.counters.clone())
            .unwrap_or_default()
    }

    fn peaks(&self) -> PeakSummary {
        self.s2c
            .as_ref()
            .map(|s2c| PeakSummary {
                min: s2c.measured.peaks.min_or_unset(),
                max: s2c.measured.peaks.max_or_unset(),
                count: s2c.measured.peaks.peak_count,
            })
            .unwrap_or_default()
    }

    /// The results text sent to the client.
    pub fn render(&self, diagnosis: &Diagnosis, links: LinkSpeeds) -> String {
        let counters = self.s2c_counters();
        diagnostics::report::render(&ReportInput {
            counters: &counters,
            diagnosis,
            links,
            sndbuf: self.s2c.as_ref().map_or(0, S2cOutcome::sndbuf),
            middlebox_kbps: self.middlebox.as_ref().map_or(0.0, |mid| mid.client_kbps),
            peaks: self.peaks(),
        })
    }

    pub fn summary(
        &self,
        session: &SessionInfo,
        login: &Login,
        diagnosis: &Diagnosis,
    ) -> SessionSummary {
        let metrics = &diagnosis.metrics;
        SessionSummary {
            id: session.id,
            peer: session.peer.to_string(),
            started: session.started.to_rfc3339(),
            client_version: session.client_version.clone(),
            suite: login.tests.suite(),
            c2s_kbps: self.c2s.as_ref().map(|c2s| c2s.kbps),
            s2c_kbps: self.s2c.as_ref().map(|s2c| s2c.kbps),
            s2c_client_kbps: self.s2c.as_ref().map(|s2c| s2c.client_kbps),
            middlebox: self.middlebox.as_ref().map(|mid| mid.report.to_string()),
            middlebox_kbps: self.middlebox.as_ref().map(|mid| mid.client_kbps),
            nat: self.middlebox.as_ref().map(|mid| mid.nat.any()),
            mss_preserved: self.middlebox.as_ref().map(|mid| mid.mss_preserved),
            firewall: self.firewall.map(FirewallResult::code),
            meta: self.meta.clone(),
            link: diagnosis.verdict.code(),
            mismatch: diagnosis.mismatch.code(),
            bad_cable: diagnosis.bad_cable,
            half_duplex: diagnosis.half_duplex,
            congestion: diagnosis.congestion,
            bw: metrics.bw,
            loss: metrics.loss,
            avgrtt: metrics.avgrtt,
            peaks: self.peaks(),
        }
    }
}

async fn run_test(
    test: TestKind,
    conn: &mut ControlConnection,
    ctx: &ServerContext,
    session: &SessionInfo,
    results: &mut SessionResults,
) -> Result<(), SessionError> {
    match test {
        TestKind::Middlebox => results.middlebox = Some(middlebox::run(conn, ctx).await?),
        TestKind::Firewall => results.firewall = Some(firewall::run(conn, ctx).await?),
        TestKind::C2s => results.c2s = Some(c2s::run(conn, ctx, session).await?),
        TestKind::S2c => results.s2c = Some(s2c::run(conn, ctx, session).await?),
        TestKind::Meta => results.meta = meta::run(conn).await?,
    }
    Ok(())
}

/// Drives a started session to its LOGOUT.
///
/// A test that fails on its own is skipped and the session carries on; a failure that
/// takes the whole session down is reported to the client as an ERROR first.
pub async fn run(
    conn: &mut ControlConnection,
    login: &Login,
    ctx: &ServerContext,
    session: &SessionInfo,
) -> Result<SessionResults, SessionError> {
    let version = ProtocolVersion::current().handshake(ctx.provider.name());
    conn.send_text(MessageType::Login, &version).await?;
    conn.send_text(MessageType::Login, &login.tests.suite())
        .await?;
    tracing::info!("running tests [{}]", login.tests.suite());

    let mut results = SessionResults::default();
    for test in login.tests.tests() {
        let span = tracing::info_span!("test", %test);
        match run_test(test, conn, ctx, session, &mut results)
            .instrument(span)
            .await
        {
            Ok(()) => tracing::debug!("{test} done"),
            Err(err) if err.ends_session() => {
                tracing::error!("{test} failed, ending session: {err:#}");
                let notice = format!("Server ({}): {err}", test.label());
                if let Err(send_err) = conn.send_text(MessageType::Error, &notice).await {
                    tracing::debug!("could not report the failure: {send_err}");
                }
                return Err(err);
            }
            Err(err) => tracing::warn!("{test} disabled: {err:#}"),
        }
    }

    let concurrent = ctx.scheduler.mode == SchedulingMode::Bounded && ctx.scheduler.max_clients > 1;
    let observations = results.observations(concurrent);
    let diagnosis = diagnostics::diagnose(&observations, &ctx.thresholds);
    tracing::info!(
        "diagnosis: link {} mismatch {} bw {:.2} Mbps loss {:.6}",
        diagnosis.verdict.code(),
        diagnosis.mismatch.code(),
        diagnosis.metrics.bw,
        diagnosis.metrics.loss
    );
    let text = results.render(&diagnosis, observations.links);
    for chunk in chunk_results(&text, RESULTS_CHUNK) {
        conn.send_text(MessageType::Results, &chunk).await?;
    }
    conn.send_empty(MessageType::Logout).await?;

    let summary = results.summary(session, login, &diagnosis);
    if let Err(err) = ctx.recorder.record(session, &summary) {
        tracing::warn!("failed to record session: {err:#}");
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_results_still_render() {
        let results = SessionResults::default();
        let observations = results.observations(false);
        let diagnosis = diagnostics::diagnose(&observations, &diagnostics::Thresholds::default());
        let text = results.render(&diagnosis, observations.links);
        assert!(text.starts_with("c2sData: -2\n"));
        assert!(text.contains("Sndbuf: 0\n"));
        assert!(text.ends_with("CWNDpeaks: 0\n"));
        assert!(diagnosis.metrics.bw.is_finite());
    }

    #[test]
    fn summary_carries_meta_and_suite() {
        let mut results = SessionResults {
            firewall: Some(FirewallResult::Possible),
            ..Default::default()
        };
        results.meta.push(("client.os.name".to_string(), "Linux".to_string()));
        let login = Login {
            tests: control::protocol::TestSet::from_bits(8 | 32),
            client_version: None,
        };
        let session = SessionInfo::new(3, "192.0.2.1:5000".parse().unwrap(), None);
        let diagnosis = diagnostics::diagnose(
            &results.observations(false),
            &diagnostics::Thresholds::default(),
        );
        let summary = results.summary(&session, &login, &diagnosis);
        assert_eq!(summary.suite, "8 32");
        assert_eq!(summary.firewall, Some(3));
        assert_eq!(summary.meta.len(), 1);
        assert_eq!(summary.c2s_kbps, None);
        assert_eq!(summary.peaks.min, -1);
    }
}
