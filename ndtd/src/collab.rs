//! Collaborators the server talks to through traits: packet capture, persistence and
//! the socket probe feeding the telemetry sampler.

use std::os::fd::AsFd;

use common::tcpstat::{Aggregator, Snapshot, StatsProvider, names};
use congestion::{Probe, SampleLog};
use control::protocol::TestKind;
use diagnostics::LinkHistogram;

/// Identity of one admitted session, as handed to collaborators.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: u64,
    pub peer: std::net::SocketAddr,
    pub started: chrono::DateTime<chrono::Utc>,
    pub client_version: Option<String>,
}

impl SessionInfo {
    pub fn new(
        id: u64,
        peer: std::net::SocketAddr,
        client_version: Option<String>,
    ) -> Self {
        Self {
            id,
            peer,
            started: chrono::Utc::now(),
            client_version,
        }
    }

    /// Prefix shared by every file recorded for this session.
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.started.format("%Y%m%dT%H%M%S%.3fZ"), self.id)
    }
}

/// Packet-pair capture on a data connection.
pub trait PacketCapture: std::fmt::Debug + Send + Sync {
    /// Starts observing packets flowing from `from` to `to`.
    fn start(
        &self,
        from: std::net::SocketAddr,
        to: std::net::SocketAddr,
    ) -> Box<dyn CaptureHandle>;
}

pub trait CaptureHandle: Send {
    /// Stops the capture; `None` when nothing usable was seen.
    fn finish(self: Box<Self>) -> futures::future::BoxFuture<'static, Option<LinkHistogram>>;
}

/// Capture that never sees a packet; links classify as insufficient data.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapture;

struct NoCaptureHandle;

impl PacketCapture for NoCapture {
    fn start(
        &self,
        _from: std::net::SocketAddr,
        _to: std::net::SocketAddr,
    ) -> Box<dyn CaptureHandle> {
        Box::new(NoCaptureHandle)
    }
}

impl CaptureHandle for NoCaptureHandle {
    fn finish(self: Box<Self>) -> futures::future::BoxFuture<'static, Option<LinkHistogram>> {
        Box::pin(async { None })
    }
}

/// What is left of a session once results went out.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SessionSummary {
    pub id: u64,
    pub peer: String,
    pub started: String,
    pub client_version: Option<String>,
    pub suite: String,
    pub c2s_kbps: Option<f64>,
    pub s2c_kbps: Option<f64>,
    pub s2c_client_kbps: Option<f64>,
    pub middlebox: Option<String>,
    pub middlebox_kbps: Option<f64>,
    pub nat: Option<bool>,
    pub mss_preserved: Option<bool>,
    pub firewall: Option<u8>,
    pub meta: Vec<(String, String)>,
    pub link: i32,
    pub mismatch: i32,
    pub bad_cable: bool,
    pub half_duplex: bool,
    pub congestion: bool,
    pub bw: f64,
    pub loss: f64,
    pub avgrtt: f64,
    pub peaks: diagnostics::PeakSummary,
}

/// Persistence of snapshot logs and session summaries.
pub trait Recorder: std::fmt::Debug + Send + Sync {
    /// Sink for the telemetry samples of one test; `None` disables logging.
    fn snap_log(
        &self,
        session: &SessionInfo,
        test: TestKind,
    ) -> anyhow::Result<Option<Box<dyn SampleLog<Snapshot>>>>;

    fn record(&self, session: &SessionInfo, summary: &SessionSummary) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecorder;

impl Recorder for NullRecorder {
    fn snap_log(
        &self,
        _session: &SessionInfo,
        _test: TestKind,
    ) -> anyhow::Result<Option<Box<dyn SampleLog<Snapshot>>>> {
        Ok(None)
    }

    fn record(&self, _session: &SessionInfo, _summary: &SessionSummary) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes JSON lines under a data directory.
///
/// Each throughput test gets `<stamp>_<id>_<test>.snaplog.jsonl` with one line per
/// sample; the summary goes to `<stamp>_<id>.session.jsonl`.
#[derive(Debug, Clone)]
pub struct JsonRecorder {
    dir: std::path::PathBuf,
}

impl JsonRecorder {
    pub fn new(dir: impl Into<std::path::PathBuf>) -> anyhow::Result<Self> {
        use anyhow::Context;
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create data directory {dir:?}"))?;
        Ok(Self { dir })
    }

    fn create(&self, name: &str) -> anyhow::Result<(std::path::PathBuf, std::fs::File)> {
        use anyhow::Context;
        let path = self.dir.join(name);
        let file = std::fs::File::create(&path)
            .with_context(|| format!("failed to create {path:?}"))?;
        Ok((path, file))
    }
}

impl Recorder for JsonRecorder {
    fn snap_log(
        &self,
        session: &SessionInfo,
        test: TestKind,
    ) -> anyhow::Result<Option<Box<dyn SampleLog<Snapshot>>>> {
        let (path, file) = self.create(&format!("{}_{test}.snaplog.jsonl", session.file_stem()))?;
        tracing::debug!("snapshot log for {test}: {path:?}");
        Ok(Some(Box::new(JsonSnapLog {
            out: std::io::BufWriter::new(file),
            path,
            started: std::time::Instant::now(),
            failed: false,
        })))
    }

    fn record(&self, session: &SessionInfo, summary: &SessionSummary) -> anyhow::Result<()> {
        use anyhow::Context;
        use std::io::Write;
        let (path, file) = self.create(&format!("{}.session.jsonl", session.file_stem()))?;
        let mut out = std::io::BufWriter::new(file);
        serde_json::to_writer(&mut out, summary)
            .with_context(|| format!("failed to serialize session summary to {path:?}"))?;
        out.write_all(b"\n")
            .and_then(|()| out.flush())
            .with_context(|| format!("failed to write {path:?}"))?;
        Ok(())
    }
}

#[derive(serde::Serialize)]
struct SnapLine<'a> {
    elapsed_ms: u128,
    counters: &'a Snapshot,
}

struct JsonSnapLog {
    out: std::io::BufWriter<std::fs::File>,
    path: std::path::PathBuf,
    started: std::time::Instant,
    failed: bool,
}

impl SampleLog<Snapshot> for JsonSnapLog {
    fn record(&mut self, sample: &Snapshot) {
        use std::io::Write;
        if self.failed {
            return;
        }
        let line = SnapLine {
            elapsed_ms: self.started.elapsed().as_millis(),
            counters: sample,
        };
        let res = serde_json::to_writer(&mut self.out, &line)
            .map_err(std::io::Error::from)
            .and_then(|()| self.out.write_all(b"\n"));
        if let Err(err) = res {
            // one warning, then the log goes quiet for the rest of the test
            tracing::warn!("failed writing snapshot log {:?}: {err}", self.path);
            self.failed = true;
        }
    }
}

/// Samples the counters of a data socket and folds them into an [`Aggregator`].
///
/// Owns a duplicate of the socket descriptor so the sampler task can outlive the borrow
/// of the stream used for the transfer.
#[derive(Debug)]
pub struct StatsProbe {
    provider: std::sync::Arc<dyn StatsProvider>,
    socket: std::os::fd::OwnedFd,
    aggregator: Aggregator,
}

impl StatsProbe {
    pub fn new(
        provider: std::sync::Arc<dyn StatsProvider>,
        socket: std::os::fd::BorrowedFd<'_>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            provider,
            socket: socket.try_clone_to_owned()?,
            aggregator: Aggregator::new(),
        })
    }

    /// Cumulative counters over every sample, refreshed with one final reading.
    pub fn finish(mut self) -> Snapshot {
        if let Ok(last) = self.provider.snapshot(self.socket.as_fd()) {
            self.aggregator.observe(&last);
        }
        self.aggregator.finish()
    }
}

impl Probe for StatsProbe {
    type Sample = Snapshot;

    fn sample(&mut self) -> Option<Snapshot> {
        match self.provider.snapshot(self.socket.as_fd()) {
            Ok(snapshot) => {
                self.aggregator.observe(&snapshot);
                Some(snapshot)
            }
            Err(err) => {
                tracing::trace!("{} sample failed: {err:#}", self.provider.name());
                None
            }
        }
    }

    fn cwnd(sample: &Snapshot) -> Option<u64> {
        sample
            .get(names::CUR_CWND)
            .and_then(|cwnd| u64::try_from(cwnd).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionInfo {
        SessionInfo::new(7, "127.0.0.1:40000".parse().unwrap(), Some("v5.0".to_string()))
    }

    #[tokio::test]
    async fn no_capture_yields_nothing() {
        let handle = NoCapture.start(
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
        );
        assert!(handle.finish().await.is_none());
    }

    #[test]
    fn json_recorder_writes_lines() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let recorder = JsonRecorder::new(dir.path().join("data"))?;
        let info = session();
        let mut log = recorder
            .snap_log(&info, TestKind::S2c)?
            .expect("json recorder always logs");
        let mut sample = Snapshot::new();
        sample.set(names::CUR_CWND, 14480);
        log.record(&sample);
        log.record(&sample);
        drop(log);
        let summary = SessionSummary {
            id: info.id,
            suite: "4".to_string(),
            meta: vec![("client.os.name".to_string(), "Linux".to_string())],
            ..Default::default()
        };
        recorder.record(&info, &summary)?;

        let snaplog = dir
            .path()
            .join("data")
            .join(format!("{}_s2c.snaplog.jsonl", info.file_stem()));
        let text = std::fs::read_to_string(snaplog)?;
        assert_eq!(text.lines().count(), 2);
        let line: serde_json::Value = serde_json::from_str(text.lines().next().unwrap())?;
        assert!(line["counters"].to_string().contains("14480"));

        let session_file = dir
            .path()
            .join("data")
            .join(format!("{}.session.jsonl", info.file_stem()));
        let value: serde_json::Value =
            serde_json::from_str(std::fs::read_to_string(session_file)?.trim())?;
        assert_eq!(value["id"], 7);
        assert_eq!(value["meta"][0][1], "Linux");
        Ok(())
    }

    #[test]
    fn null_recorder_logs_nothing() -> anyhow::Result<()> {
        assert!(NullRecorder.snap_log(&session(), TestKind::C2s)?.is_none());
        NullRecorder.record(&session(), &SessionSummary::default())?;
        Ok(())
    }

    #[test]
    fn cwnd_comes_from_counters() {
        let mut sample = Snapshot::new();
        assert_eq!(StatsProbe::cwnd(&sample), None);
        sample.set(names::CUR_CWND, 28960);
        assert_eq!(StatsProbe::cwnd(&sample), Some(28960));
    }
}
