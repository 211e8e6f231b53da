//! Server-to-client throughput, with the counters of the sending socket.

use std::os::fd::AsFd;

use common::error::SessionError;
use common::tcpstat::{names, tcpinfo};
use control::protocol::{NO_DATA_COLLECTED, TestKind};
use control::{ControlConnection, MAX_PAYLOAD, MessageType};
use tokio::io::AsyncWriteExt;

use super::{DataPort, Measured, Telemetry};
use crate::ServerContext;
use crate::collab::SessionInfo;

/// Unacknowledged bytes above which writes are skipped with `avoid_sndblock_up`.
const SNDBLOCK_LIMIT: i64 = 8192 * 4;

const INVALID_THROUGHPUT: &str = "Server (S2C throughput test): Invalid S2C throughput received";

#[derive(Debug, Clone)]
pub struct S2cOutcome {
    /// Throughput measured by the server
    pub kbps: f64,
    /// Throughput the client reported
    pub client_kbps: f64,
    pub bytes: u64,
    /// Send queue depth when the transfer stopped
    pub send_queue: i64,
    pub measured: Measured,
}

impl S2cOutcome {
    pub fn sndbuf(&self) -> i64 {
        self.measured.counters.get_or_zero(names::SNDBUF)
    }
}

/// Renders the counters as `name: value` lines.
pub fn counter_lines(counters: &common::tcpstat::Snapshot) -> String {
    if counters.is_empty() {
        return format!("{NO_DATA_COLLECTED}\n");
    }
    counters
        .iter()
        .map(|(name, value)| format!("{name}: {value}\n"))
        .collect()
}

#[tracing::instrument(skip_all, name = "s2c")]
pub async fn run(
    conn: &mut ControlConnection,
    ctx: &ServerContext,
    session: &SessionInfo,
) -> Result<S2cOutcome, SessionError> {
    let listener = super::bind_data_listener(
        ctx,
        conn.local_addr().ip(),
        DataPort::Offset(super::S2C_PORT_OFFSET),
        None,
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
    let telemetry = Telemetry::attach(ctx, session, TestKind::S2c, &stream, local, peer)?;
    conn.send_empty(MessageType::TestStart).await?;
    telemetry.start();

    let buf = super::pattern(ctx.tests.write_buffer_size);
    let started = tokio::time::Instant::now();
    let deadline = started + ctx.tests.throughput_duration;
    let mut bytes = 0u64;
    while tokio::time::Instant::now() < deadline {
        if ctx.tests.avoid_sndblock_up
            && tcpinfo::send_queue_bytes(stream.as_fd()).unwrap_or(0) > SNDBLOCK_LIMIT
        {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            continue;
        }
        match tokio::time::timeout_at(deadline, stream.write(&buf)).await {
            Err(_) => break,
            Ok(Ok(n)) => bytes += n as u64,
            Ok(Err(err)) => {
                tracing::debug!("data connection ended: {err}");
                break;
            }
        }
    }
    let secs = started.elapsed().as_secs_f64();
    let send_queue = tcpinfo::send_queue_bytes(stream.as_fd()).unwrap_or(0);
    if let Err(err) = stream.shutdown().await {
        tracing::debug!("shutdown of data connection failed: {err}");
    }
    let measured = telemetry.finish(ctx).await?;
    let kbps = super::throughput_kbps(bytes, secs);
    tracing::info!(
        "sent {bytes} bytes in {secs:.2}s: {kbps:.0} kb/s, {} samples, cwnd peaks {:?}",
        measured.samples,
        measured.peaks
    );

    conn.send_text(
        MessageType::TestMsg,
        &format!("{kbps:.0} {send_queue} {bytes}"),
    )
    .await?;
    for chunk in control::protocol::chunk_results(&counter_lines(&measured.counters), MAX_PAYLOAD)
    {
        conn.send_text(MessageType::TestMsg, &chunk).await?;
    }
    let client_kbps = super::recv_client_float(conn, INVALID_THROUGHPUT).await?;
    conn.send_empty(MessageType::TestFinalize).await?;
    Ok(S2cOutcome {
        kbps,
        client_kbps,
        bytes,
        send_queue,
        measured,
    })
}
