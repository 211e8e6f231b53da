//! Diagnosis of a network path from the telemetry of one NDT session.
//!
//! - [`link`] classifies the bottleneck from a packet-pair speed histogram.
//! - [`engine`] derives loss, RTT and limited-time ratios from the S2C counters and runs
//!   the duplex-mismatch, link-type and fault detectors.
//! - [`middlebox`] reads the middlebox test report (MSS rewriting, NAT).
//! - [`report`] renders the results text sent to the client.
//!
//! The thresholds of every detector are collected in [`Thresholds`]; defaults are the
//! tuned values, a JSON file may override any of them.

pub mod engine;
pub mod link;
pub mod middlebox;
pub mod report;
pub mod thresholds;

pub use engine::{
    Diagnosis, DuplexMismatch, LinkSpeeds, LinkVerdict, Metrics, Observations, TcpVars, diagnose,
};
pub use link::{LinkClass, LinkHistogram};
pub use middlebox::MiddleboxReport;
pub use report::PeakSummary;
pub use thresholds::Thresholds;
