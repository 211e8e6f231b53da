//! The individual tests run over a session's control connection.
//!
//! Every phase follows the same shape: announce with TEST_PREPARE, run the exchange,
//! report with TEST_MSG and close with TEST_FINALIZE. Data connections are opened by
//! the client against a listener bound here.

use anyhow::Context;
use common::error::{ErrorKind, FailurePoint, SessionError};
use control::{ControlConnection, MessageType};

use crate::ServerContext;

pub mod c2s;
pub mod firewall;
pub mod meta;
pub mod middlebox;
pub mod s2c;

/// Port offsets from the base port for each data listener.
pub const C2S_PORT_OFFSET: u16 = 1;
pub const S2C_PORT_OFFSET: u16 = 2;
pub const MIDDLEBOX_PORT_OFFSET: u16 = 2;

/// Capacity used when the client reports a number (throughput, port).
pub(crate) const REPLY_CAPACITY: usize = 1024;

/// Bytes of printable filler, as the legacy clients expect on data connections.
pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (b'a'..=b'z').cycle().take(len).collect()
}

/// Throughput in kbit/s of `bytes` moved in `secs`.
pub fn throughput_kbps(bytes: u64, secs: f64) -> f64 {
    if secs > 0.0 {
        8e-3 * bytes as f64 / secs
    } else {
        0.0
    }
}

/// Where a data listener should bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPort {
    /// `base_port + offset`, or any port of the configured ranges
    Offset(u16),
    /// Whatever the kernel hands out
    Ephemeral,
}

/// Binds the listener a data connection will arrive on.
///
/// With port ranges configured a random port within them is used. Otherwise the fixed
/// offset from the base port is tried first; when another session holds it, or the base
/// port is 0, the kernel picks one. The chosen port is announced to the client anyway.
pub async fn bind_data_listener(
    ctx: &ServerContext,
    ip: std::net::IpAddr,
    port: DataPort,
    mss: Option<u32>,
) -> Result<tokio::net::TcpListener, SessionError> {
    let ephemeral = std::net::SocketAddr::new(ip, 0);
    let listener = match (port, &ctx.port_ranges) {
        (DataPort::Ephemeral, _) => control::port_ranges::bind_listener(ephemeral, mss),
        (DataPort::Offset(_), Some(ranges)) => ranges.bind_tcp_listener(ip, mss).await,
        (DataPort::Offset(_), None) if ctx.tests.base_port == 0 => {
            control::port_ranges::bind_listener(ephemeral, mss)
        }
        (DataPort::Offset(offset), None) => {
            let port = ctx.tests.base_port.checked_add(offset).ok_or_else(|| {
                SessionError::listen(anyhow::anyhow!(
                    "base port {} + {offset} is out of range",
                    ctx.tests.base_port
                ))
            })?;
            let addr = std::net::SocketAddr::new(ip, port);
            match control::port_ranges::bind_listener(addr, mss) {
                Err(err)
                    if err
                        .downcast_ref::<std::io::Error>()
                        .is_some_and(|e| e.kind() == std::io::ErrorKind::AddrInUse) =>
                {
                    tracing::debug!("{addr} in use, binding an ephemeral port");
                    control::port_ranges::bind_listener(ephemeral, mss)
                }
                res => res,
            }
        }
    };
    listener.map_err(SessionError::listen)
}

/// Port a freshly bound listener ended up on.
pub(crate) fn listener_port(listener: &tokio::net::TcpListener) -> Result<u16, SessionError> {
    listener
        .local_addr()
        .map(|addr| addr.port())
        .context("failed to read data listener address")
        .map_err(SessionError::listen)
}

/// Waits for the client's data connection.
///
/// Each attempt is bounded by the accept timeout. Connections from an address other
/// than the control connection's peer are dropped and do not count as an attempt.
pub async fn accept_data(
    listener: &tokio::net::TcpListener,
    ctx: &ServerContext,
    expected_peer: std::net::IpAddr,
) -> Result<tokio::net::TcpStream, SessionError> {
    let attempts = ctx.tests.accept_attempts;
    let mut timeouts = 0;
    while timeouts < attempts {
        match tokio::time::timeout(ctx.tests.accept_timeout, listener.accept()).await {
            Err(_) => {
                timeouts += 1;
                tracing::debug!("no data connection yet ({timeouts}/{attempts})");
            }
            Ok(Ok((stream, peer))) => {
                if peer.ip().to_canonical() != expected_peer.to_canonical() {
                    tracing::warn!("dropping data connection from unexpected peer {peer}");
                    continue;
                }
                tracing::debug!("data connection from {peer}");
                return Ok(stream);
            }
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Ok(Err(err)) => {
                return Err(SessionError::new(
                    anyhow::Error::new(err).context("failed to accept data connection"),
                    ErrorKind::PeerFault,
                    FailurePoint::Accept,
                ));
            }
        }
    }
    Err(SessionError::new(
        anyhow::anyhow!("no data connection after {attempts} attempts"),
        ErrorKind::Timeout,
        FailurePoint::AcceptTimeout,
    ))
}

/// A failure on an established data connection.
pub(crate) fn data_error(err: impl Into<anyhow::Error>, what: &'static str) -> SessionError {
    SessionError::exchange(err.into().context(what), ErrorKind::PeerFault)
}

/// Reads the float the client reports at the end of a test.
///
/// An unparsable value is answered with `complaint` as an ERROR message.
pub(crate) async fn recv_client_float(
    conn: &mut ControlConnection,
    complaint: &str,
) -> Result<f64, SessionError> {
    let message = conn.expect(MessageType::TestMsg, REPLY_CAPACITY).await?;
    match message.text().trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => {
            conn.send_text(MessageType::Error, complaint).await?;
            Err(SessionError::exchange(
                anyhow::anyhow!("{complaint}: {:?}", message.text()),
                ErrorKind::ProtocolViolation,
            ))
        }
    }
}

/// What the telemetry of one throughput transfer came down to.
#[derive(Debug, Clone)]
pub struct Measured {
    pub counters: common::tcpstat::Snapshot,
    pub peaks: congestion::CwndPeaks,
    pub samples: usize,
    pub data_link: diagnostics::LinkClass,
    pub ack_link: diagnostics::LinkClass,
}

/// Sampler and packet captures attached to one data connection.
pub(crate) struct Telemetry {
    sampler: congestion::Sampler<crate::collab::StatsProbe>,
    data: Box<dyn crate::collab::CaptureHandle>,
    ack: Box<dyn crate::collab::CaptureHandle>,
}

impl Telemetry {
    /// `sender` is the end the test data flows from.
    pub(crate) fn attach(
        ctx: &ServerContext,
        session: &crate::collab::SessionInfo,
        test: control::protocol::TestKind,
        stream: &tokio::net::TcpStream,
        sender: std::net::SocketAddr,
        receiver: std::net::SocketAddr,
    ) -> Result<Self, SessionError> {
        use std::os::fd::AsFd;
        let probe = crate::collab::StatsProbe::new(ctx.provider.clone(), stream.as_fd())
            .map_err(|err| data_error(err, "failed to duplicate data socket"))?;
        let log = ctx.recorder.snap_log(session, test).unwrap_or_else(|err| {
            tracing::warn!("snapshot log disabled: {err:#}");
            None
        });
        Ok(Self {
            sampler: congestion::Sampler::spawn(probe, ctx.tests.sample_interval, log),
            data: ctx.capture.start(sender, receiver),
            ack: ctx.capture.start(receiver, sender),
        })
    }

    pub(crate) fn start(&self) {
        self.sampler.start();
    }

    pub(crate) async fn finish(self, ctx: &ServerContext) -> Result<Measured, SessionError> {
        let report = self.sampler.stop().await.map_err(|err| {
            SessionError::exchange(
                anyhow::Error::new(err).context("telemetry sampler failed"),
                ErrorKind::ResourceExhaustion,
            )
        })?;
        let index = ctx.thresholds.interface_speed_index;
        let data = self.data.finish().await;
        let ack = self.ack.finish().await;
        Ok(Measured {
            peaks: report.peaks,
            samples: report.samples,
            counters: report.probe.finish(),
            data_link: diagnostics::LinkHistogram::classify(data.as_ref(), index),
            ack_link: diagnostics::LinkHistogram::classify(ack.as_ref(), index),
        })
    }
}
