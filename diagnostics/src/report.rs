//! Text sent to the client in RESULTS messages.

use std::fmt::Write;

use common::tcpstat::Snapshot;

use crate::engine::{Diagnosis, LinkSpeeds};

/// Congestion window peaks of the S2C transfer; -1 when never observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PeakSummary {
    pub min: i64,
    pub max: i64,
    pub count: u32,
}

impl Default for PeakSummary {
    fn default() -> Self {
        Self {
            min: -1,
            max: -1,
            count: 0,
        }
    }
}

/// Everything that ends up in the results text.
#[derive(Debug, Clone)]
pub struct ReportInput<'a> {
    pub counters: &'a Snapshot,
    pub diagnosis: &'a Diagnosis,
    pub links: LinkSpeeds,
    /// Send buffer of the S2C connection in bytes
    pub sndbuf: i64,
    /// Throughput of the window-limited middlebox stream, kbit/s
    pub middlebox_kbps: f64,
    pub peaks: PeakSummary,
}

/// Renders the `name: value` lines, counters first.
pub fn render(input: &ReportInput<'_>) -> String {
    let mut out = String::new();
    for (name, value) in input.counters.iter() {
        let _ = writeln!(out, "{name}: {value}");
    }
    let d = input.diagnosis;
    let m = &d.metrics;
    let links = &input.links;
    let _ = writeln!(out, "c2sData: {}", links.c2s_data.code());
    let _ = writeln!(out, "c2sAck: {}", links.c2s_ack.code());
    let _ = writeln!(out, "s2cData: {}", links.s2c_data.code());
    let _ = writeln!(out, "s2cAck: {}", links.s2c_ack.code());
    let _ = writeln!(out, "half_duplex: {}", i32::from(d.half_duplex));
    let _ = writeln!(out, "link: {}", d.verdict.code());
    let _ = writeln!(out, "congestion: {}", i32::from(d.congestion));
    let _ = writeln!(out, "bad_cable: {}", i32::from(d.bad_cable));
    let _ = writeln!(out, "mismatch: {}", d.mismatch.code());
    let _ = writeln!(out, "spd: {:.2}", m.spd);
    let _ = writeln!(out, "bw: {:.2}", m.bw);
    let _ = writeln!(out, "loss: {:.9}", m.loss);
    let _ = writeln!(out, "avgrtt: {:.2}", m.avgrtt);
    let _ = writeln!(out, "waitsec: {:.2}", m.waitsec);
    let _ = writeln!(out, "timesec: {:.2}", m.timesec);
    let _ = writeln!(out, "order: {:.4}", m.oo_order);
    let _ = writeln!(out, "rwintime: {:.4}", m.rwintime);
    let _ = writeln!(out, "sendtime: {:.4}", m.sendtime);
    let _ = writeln!(out, "cwndtime: {:.4}", m.cwndtime);
    let _ = writeln!(out, "rwin: {:.4}", m.rwin);
    let _ = writeln!(out, "swin: {:.4}", m.swin);
    let _ = writeln!(out, "cwin: {:.4}", m.cwin);
    let _ = writeln!(out, "rttsec: {:.6}", m.rttsec);
    let _ = writeln!(out, "Sndbuf: {}", input.sndbuf);
    // average speed is not measured by this server
    let _ = writeln!(out, "aspd: {:.5}", 0.0);
    let _ = writeln!(out, "CWND-Limited: {:.2}", input.middlebox_kbps);
    let _ = writeln!(out, "minCWNDpeak: {}", input.peaks.min);
    let _ = writeln!(out, "maxCWNDpeak: {}", input.peaks.max);
    let _ = writeln!(out, "CWNDpeaks: {}", input.peaks.count);
    out
}
