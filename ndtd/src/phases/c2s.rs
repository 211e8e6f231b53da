//! Client-to-server throughput.

use common::error::SessionError;
use control::protocol::TestKind;
use control::{ControlConnection, MessageType};
use tokio::io::AsyncReadExt;

use super::{DataPort, Measured, Telemetry};
use crate::ServerContext;
use crate::collab::SessionInfo;

/// Slack past the nominal duration before the server stops reading.
const READ_GRACE: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct C2sOutcome {
    /// Throughput measured by the server
    pub kbps: f64,
    pub bytes: u64,
    pub measured: Measured,
}

#[tracing::instrument(skip_all, name = "c2s")]
pub async fn run(
    conn: &mut ControlConnection,
    ctx: &ServerContext,
    session: &SessionInfo,
) -> Result<C2sOutcome, SessionError> {
    let listener = super::bind_data_listener(
        ctx,
        conn.local_addr().ip(),
        DataPort::Offset(super::C2S_PORT_OFFSET),
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
    let telemetry = Telemetry::attach(ctx, session, TestKind::C2s, &stream, peer, local)?;
    tokio::time::sleep(ctx.tests.c2s_start_delay).await;
    conn.send_empty(MessageType::TestStart).await?;
    telemetry.start();

    let started = tokio::time::Instant::now();
    let deadline = started + ctx.tests.throughput_duration + READ_GRACE;
    let mut buf = vec![0u8; 64 * 1024];
    let mut bytes = 0u64;
    loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Err(_) => {
                tracing::debug!("stopped reading at the deadline");
                break;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => bytes += n as u64,
            Ok(Err(err)) => {
                tracing::debug!("data connection ended: {err}");
                break;
            }
        }
    }
    let secs = started.elapsed().as_secs_f64();
    let measured = telemetry.finish(ctx).await?;
    let kbps = super::throughput_kbps(bytes, secs);
    tracing::info!("received {bytes} bytes in {secs:.2}s: {kbps:.0} kb/s");

    conn.send_text(MessageType::TestMsg, &format!("{kbps:.0}"))
        .await?;
    conn.send_empty(MessageType::TestFinalize).await?;
    Ok(C2sOutcome {
        kbps,
        bytes,
        measured,
    })
}
