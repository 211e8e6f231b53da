//! Simple firewall test: connections opened in both directions outside the data ports.

use std::os::fd::AsFd;

use common::error::{ErrorKind, SessionError};
use common::tcpstat::names;
use control::protocol::{FIREWALL_PROBE, FirewallResult};
use control::streams::{RecvStream, SendStream};
use control::{ControlConnection, MessageType};

use super::DataPort;
use crate::ServerContext;

const INVALID_PORT: &str = "Server (Simple firewall test): Invalid port number received";

/// Round trips above this many milliseconds get the longer test window.
const SLOW_PATH_MS: i64 = 3000;

/// Picks the per-direction test window from the control connection's RTT and RTO.
pub fn test_time(counters: &common::tcpstat::Snapshot) -> std::time::Duration {
    let rtt = counters
        .get(names::MAX_RTT)
        .or_else(|| counters.get(names::SAMPLE_RTT))
        .unwrap_or(0);
    let rto = counters
        .get(names::MAX_RTO)
        .or_else(|| counters.get(names::CURRENT_RTO))
        .unwrap_or(0);
    if rtt.max(rto) > SLOW_PATH_MS {
        std::time::Duration::from_secs(3)
    } else {
        std::time::Duration::from_secs(1)
    }
}

/// Classifies what arrived on the server's listener.
async fn inbound(
    listener: tokio::net::TcpListener,
    window: std::time::Duration,
) -> FirewallResult {
    let stream = match tokio::time::timeout(window, listener.accept()).await {
        Err(_) => return FirewallResult::Possible,
        Ok(Err(err)) => {
            tracing::debug!("firewall accept failed: {err}");
            return FirewallResult::Unknown;
        }
        Ok(Ok((stream, _))) => stream,
    };
    let mut recv = RecvStream::new(stream);
    match recv.recv_within(FIREWALL_PROBE.len(), window).await {
        Ok(message)
            if message.kind == MessageType::TestMsg && message.text() == FIREWALL_PROBE =>
        {
            FirewallResult::NoFirewall
        }
        Ok(message) => {
            tracing::debug!("unexpected firewall probe {:?}", message.text());
            FirewallResult::Unknown
        }
        Err(control::Error::Timeout(_)) => FirewallResult::Possible,
        Err(err) => {
            tracing::debug!("firewall probe not received: {err}");
            FirewallResult::Unknown
        }
    }
}

/// Opens the server-to-client connection; the client judges it on its side.
async fn outbound(target: std::net::SocketAddr, window: std::time::Duration) {
    let attempt = async {
        let stream = tokio::net::TcpStream::connect(target).await?;
        SendStream::new(stream)
            .send_text(MessageType::TestMsg, FIREWALL_PROBE)
            .await?;
        anyhow::Ok(())
    };
    match tokio::time::timeout(window, attempt).await {
        Ok(Ok(())) => tracing::debug!("firewall probe delivered to {target}"),
        Ok(Err(err)) => tracing::debug!("firewall probe to {target} failed: {err:#}"),
        Err(_) => tracing::debug!("firewall probe to {target} timed out"),
    }
}

#[tracing::instrument(skip_all, name = "sfw")]
pub async fn run(
    conn: &mut ControlConnection,
    ctx: &ServerContext,
) -> Result<FirewallResult, SessionError> {
    let listener =
        super::bind_data_listener(ctx, conn.local_addr().ip(), DataPort::Ephemeral, None)
            .await?;
    let port = super::listener_port(&listener)?;
    let control_counters = ctx
        .provider
        .snapshot(conn.socket().as_fd())
        .unwrap_or_default();
    let window = test_time(&control_counters);
    conn.send_text(
        MessageType::TestPrepare,
        &format!("{port} {}", window.as_secs()),
    )
    .await?;
    let message = conn
        .expect(MessageType::TestMsg, super::REPLY_CAPACITY)
        .await?;
    let client_port = match message.text().trim().parse::<u16>() {
        Ok(port) if port != 0 => port,
        _ => {
            conn.send_text(MessageType::Error, INVALID_PORT).await?;
            return Err(SessionError::exchange(
                anyhow::anyhow!("{INVALID_PORT}: {:?}", message.text()),
                ErrorKind::ProtocolViolation,
            ));
        }
    };
    conn.send_empty(MessageType::TestStart).await?;
    let target = std::net::SocketAddr::new(conn.peer_addr().ip(), client_port);
    let (result, ()) = tokio::join!(inbound(listener, window), outbound(target, window));
    tracing::info!("firewall result {:?}", result);
    conn.send_text(MessageType::TestMsg, &result.code().to_string())
        .await?;
    conn.send_empty(MessageType::TestFinalize).await?;
    Ok(result)
}
