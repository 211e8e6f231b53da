//! Middlebox detection: a window-limited stream on a listener with a clamped MSS.

use std::os::fd::AsFd;

use common::error::SessionError;
use common::tcpstat::{names, tcpinfo};
use control::{ControlConnection, MessageType};
use diagnostics::MiddleboxReport;
use diagnostics::middlebox::{AddressView, NatDetection};
use tokio::io::AsyncWriteExt;

use super::DataPort;
use crate::ServerContext;

/// Window scale reported when the provider does not know it.
const UNSET: i64 = u32::MAX as i64;

const INVALID_THROUGHPUT: &str =
    "Server (Middlebox test): Invalid CWND limited throughput received";

#[derive(Debug, Clone)]
pub struct MiddleboxOutcome {
    pub report: MiddleboxReport,
    /// Throughput the client saw on the window-limited stream
    pub client_kbps: f64,
    pub nat: NatDetection,
    pub mss_preserved: bool,
}

#[tracing::instrument(skip_all, name = "mid")]
pub async fn run(
    conn: &mut ControlConnection,
    ctx: &ServerContext,
) -> Result<MiddleboxOutcome, SessionError> {
    let expected_mss = ctx.thresholds.middlebox_mss;
    let listener = super::bind_data_listener(
        ctx,
        conn.local_addr().ip(),
        DataPort::Offset(super::MIDDLEBOX_PORT_OFFSET),
        u32::try_from(expected_mss).ok(),
    )
    .await?;
    let port = super::listener_port(&listener)?;
    conn.send_text(MessageType::TestPrepare, &port.to_string())
        .await?;
    let mut stream = super::accept_data(&listener, ctx, conn.peer_addr().ip()).await?;
    drop(listener);
    let local = stream
        .local_addr()
        .map_err(|err| super::data_error(err, "data socket has no local address"))?;
    let peer = stream
        .peer_addr()
        .map_err(|err| super::data_error(err, "data socket has no peer address"))?;
    let counters = ctx.provider.snapshot(stream.as_fd()).unwrap_or_else(|err| {
        tracing::debug!("no counters for the middlebox connection: {err:#}");
        common::tcpstat::Snapshot::new()
    });
    let mss = counters.get(names::CUR_MSS).unwrap_or(-1);
    // the scale we sent is the one applied to our receive window
    let report = MiddleboxReport::new(
        local.ip(),
        peer.ip(),
        mss,
        counters.get(names::RCV_WIN_SCALE).unwrap_or(UNSET),
        counters.get(names::SND_WIN_SCALE).unwrap_or(UNSET),
    );

    let segment = usize::try_from(mss)
        .ok()
        .filter(|&mss| mss > 0)
        .or_else(|| usize::try_from(expected_mss).ok())
        .unwrap_or(1456);
    let window = i64::try_from(2 * segment).unwrap_or(i64::MAX);
    let packet = super::pattern(segment);
    let deadline = tokio::time::Instant::now() + ctx.tests.middlebox_duration;
    let mut bytes = 0u64;
    while tokio::time::Instant::now() < deadline {
        if tcpinfo::send_queue_bytes(stream.as_fd()).unwrap_or(0) >= window {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            continue;
        }
        match tokio::time::timeout_at(deadline, stream.write_all(&packet)).await {
            Err(_) => break,
            Ok(Ok(())) => bytes += packet.len() as u64,
            Ok(Err(err)) => {
                tracing::debug!("middlebox stream ended: {err}");
                break;
            }
        }
    }
    if let Err(err) = stream.shutdown().await {
        tracing::debug!("shutdown of middlebox connection failed: {err}");
    }
    tracing::info!("window-limited stream sent {bytes} bytes, report {report}");

    conn.send_text(MessageType::TestMsg, &report.to_string())
        .await?;
    let client_kbps = super::recv_client_float(conn, INVALID_THROUGHPUT).await?;
    conn.send_empty(MessageType::TestFinalize).await?;

    let control_view = AddressView {
        server_ip: conn.local_addr().ip().to_string(),
        client_ip: conn.peer_addr().ip().to_string(),
    };
    let timestamps = counters.get_or_zero(names::TIMESTAMPS_ENABLED) != 0;
    Ok(MiddleboxOutcome {
        nat: report.nat(&control_view),
        mss_preserved: report.mss_preserved(
            timestamps,
            expected_mss,
            ctx.thresholds.timestamp_overhead,
        ),
        report,
        client_kbps,
    })
}
