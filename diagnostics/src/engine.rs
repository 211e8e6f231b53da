//! Path diagnosis from the telemetry of the server-to-client transfer.
//!
//! Everything here is a pure function of its inputs: [`TcpVars`] pulled out of the
//! aggregated snapshot, the measured throughputs and the link classes. [`Metrics`]
//! derives the ratios; [`diagnose`] runs the detectors over them in a fixed order so
//! later detectors can override the link verdict set by earlier ones.

use common::tcpstat::{Snapshot, names};

use crate::link::LinkClass;
use crate::thresholds::Thresholds;

/// Counters the heuristics read, in web100 units (bytes, ms for RTT/RTO, µs for the
/// limited-time counters).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TcpVars {
    pub sum_rtt: i64,
    pub count_rtt: i64,
    pub congestion_signals: i64,
    pub pkts_out: i64,
    pub pkts_retrans: i64,
    pub dup_acks_in: i64,
    pub ack_pkts_in: i64,
    pub cur_mss: i64,
    pub snd_win_scale: i64,
    pub rcv_win_scale: i64,
    pub sndbuf: i64,
    pub max_rwin_rcvd: i64,
    pub max_cwnd: i64,
    pub max_ssthresh: i64,
    pub snd_lim_time_rwin: i64,
    pub snd_lim_time_cwnd: i64,
    pub snd_lim_time_sender: i64,
    pub snd_lim_trans_rwin: i64,
    pub snd_lim_trans_cwnd: i64,
    pub snd_lim_trans_sender: i64,
    pub timeouts: i64,
    pub current_rto: i64,
    pub data_bytes_out: i64,
    pub timestamps_enabled: bool,
}

impl TcpVars {
    /// Missing counters read as zero.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let get = |name: &str| snapshot.get_or_zero(name);
        Self {
            sum_rtt: get(names::SUM_RTT),
            count_rtt: get(names::COUNT_RTT),
            congestion_signals: get(names::CONGESTION_SIGNALS),
            pkts_out: get(names::PKTS_OUT),
            pkts_retrans: get(names::PKTS_RETRANS),
            dup_acks_in: get(names::DUP_ACKS_IN),
            ack_pkts_in: get(names::ACK_PKTS_IN),
            cur_mss: get(names::CUR_MSS),
            snd_win_scale: get(names::SND_WIN_SCALE),
            rcv_win_scale: get(names::RCV_WIN_SCALE),
            sndbuf: get(names::SNDBUF),
            max_rwin_rcvd: get(names::MAX_RWIN_RCVD),
            max_cwnd: get(names::MAX_CWND),
            max_ssthresh: get(names::MAX_SSTHRESH),
            snd_lim_time_rwin: get(names::SND_LIM_TIME_RWIN),
            snd_lim_time_cwnd: get(names::SND_LIM_TIME_CWND),
            snd_lim_time_sender: get(names::SND_LIM_TIME_SENDER),
            snd_lim_trans_rwin: get(names::SND_LIM_TRANS_RWIN),
            snd_lim_trans_cwnd: get(names::SND_LIM_TRANS_CWND),
            snd_lim_trans_sender: get(names::SND_LIM_TRANS_SENDER),
            timeouts: get(names::TIMEOUTS),
            current_rto: get(names::CURRENT_RTO),
            data_bytes_out: get(names::DATA_BYTES_OUT),
            timestamps_enabled: get(names::TIMESTAMPS_ENABLED) != 0,
        }
    }
}

// window scale options above this are bogus
const WINDOW_SCALE_MAX: i64 = 15;
const UNSCALED_WINDOW: i64 = 65535;

fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        return 0.0;
    }
    let value = num / den;
    if value.is_finite() { value } else { 0.0 }
}

fn megabits(bytes: i64) -> f64 {
    bytes as f64 * 8.0 / 1024.0 / 1024.0
}

/// Quantities derived from [`TcpVars`]. All of them are finite.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct Metrics {
    /// Average RTT in ms
    pub avgrtt: f64,
    pub rttsec: f64,
    pub loss: f64,
    pub oo_order: f64,
    /// Mathis-model throughput bound in Mbit/s (base 1024)
    pub bw: f64,
    pub snd_win_scale: i64,
    pub rcv_win_scale: i64,
    pub rwin: f64,
    pub swin: f64,
    pub cwin: f64,
    /// µs spent in any send-limited state
    pub totaltime: i64,
    pub rwintime: f64,
    pub cwndtime: f64,
    pub sendtime: f64,
    pub timesec: f64,
    pub rto_idle: f64,
    /// Observed send throughput in Mbit/s
    pub realthruput: f64,
    pub waitsec: f64,
    pub spd: f64,
}

impl Metrics {
    /// `c2s_link` selects the loss floor applied when no congestion signal was seen.
    pub fn derive(vars: &TcpVars, c2s_link: LinkClass, thresholds: &Thresholds) -> Self {
        let avgrtt = ratio(vars.sum_rtt as f64, vars.count_rtt as f64);
        let rttsec = avgrtt * 0.001;
        let mut loss = ratio(vars.congestion_signals as f64, vars.pkts_out as f64);
        if loss == 0.0 {
            loss = if c2s_link.code() > thresholds.fast_link_class {
                thresholds.loss_floor_fast
            } else {
                thresholds.loss_floor_slow
            };
        }
        let oo_order = ratio(vars.dup_acks_in as f64, vars.ack_pkts_in as f64);
        let bw = ratio(vars.cur_mss as f64, rttsec * loss.sqrt()) * 8.0 / 1024.0 / 1024.0;
        let snd_win_scale = if vars.snd_win_scale > WINDOW_SCALE_MAX
            || vars.sndbuf < UNSCALED_WINDOW
        {
            0
        } else {
            vars.snd_win_scale
        };
        let rcv_win_scale =
            if vars.rcv_win_scale > WINDOW_SCALE_MAX || vars.max_rwin_rcvd < UNSCALED_WINDOW {
                0
            } else {
                vars.rcv_win_scale
            };
        let totaltime = vars
            .snd_lim_time_rwin
            .saturating_add(vars.snd_lim_time_cwnd)
            .saturating_add(vars.snd_lim_time_sender);
        let total = totaltime as f64;
        // whole seconds, the fraction is dropped
        let timesec = (totaltime / 1_000_000) as f64;
        Self {
            avgrtt,
            rttsec,
            loss,
            oo_order,
            bw,
            snd_win_scale,
            rcv_win_scale,
            rwin: megabits(vars.max_rwin_rcvd),
            swin: megabits(vars.sndbuf),
            cwin: megabits(vars.max_cwnd),
            totaltime,
            rwintime: ratio(vars.snd_lim_time_rwin as f64, total),
            cwndtime: ratio(vars.snd_lim_time_cwnd as f64, total),
            sendtime: ratio(vars.snd_lim_time_sender as f64, total),
            timesec,
            rto_idle: ratio(vars.timeouts as f64 * vars.current_rto as f64 / 1000.0, timesec),
            realthruput: ratio(vars.data_bytes_out as f64, total) * 8.0,
            waitsec: vars.current_rto as f64 * vars.timeouts as f64 / 1000.0,
            spd: ratio(8.0 * vars.data_bytes_out as f64 / 1e6, timesec),
        }
    }
}

/// Duplex mismatch indication reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum DuplexMismatch {
    #[default]
    None,
    /// Indicator of the original detection algorithm
    Legacy,
    SwitchFullHostHalf,
    SwitchHalfHostFull,
    SwitchFullHostHalfPossible,
    SwitchHalfHostFullPossible,
    SwitchHalfHostFullWarning,
}

impl DuplexMismatch {
    pub fn code(self) -> i32 {
        match self {
            DuplexMismatch::None => 0,
            DuplexMismatch::Legacy => 1,
            DuplexMismatch::SwitchFullHostHalf => 2,
            DuplexMismatch::SwitchHalfHostFull => 3,
            DuplexMismatch::SwitchFullHostHalfPossible => 4,
            DuplexMismatch::SwitchHalfHostFullPossible => 5,
            DuplexMismatch::SwitchHalfHostFullWarning => 7,
        }
    }
}

/// Link type guessed by the heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum LinkVerdict {
    AlgorithmFailed,
    DslOrCable,
    Wireless,
    Ethernet,
    #[default]
    Undetermined,
}

impl LinkVerdict {
    pub fn code(self) -> i32 {
        match self {
            LinkVerdict::AlgorithmFailed => 0,
            LinkVerdict::DslOrCable => 2,
            LinkVerdict::Wireless => 3,
            LinkVerdict::Ethernet => 10,
            LinkVerdict::Undetermined => 100,
        }
    }
}

/// Link classes seen by packet capture, per direction and packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct LinkSpeeds {
    pub c2s_data: LinkClass,
    pub c2s_ack: LinkClass,
    pub s2c_data: LinkClass,
    pub s2c_ack: LinkClass,
}

impl Default for LinkSpeeds {
    fn default() -> Self {
        Self {
            c2s_data: LinkClass::InsufficientData,
            c2s_ack: LinkClass::InsufficientData,
            s2c_data: LinkClass::InsufficientData,
            s2c_ack: LinkClass::InsufficientData,
        }
    }
}

/// Inputs of one diagnosis.
#[derive(Debug, Clone, Default)]
pub struct Observations {
    /// Counters of the S2C connection
    pub vars: TcpVars,
    /// Throughputs in kbit/s; 0 when the test did not run
    pub c2s_kbps: f64,
    pub s2c_kbps: f64,
    pub middlebox_kbps: f64,
    pub links: LinkSpeeds,
    /// More than one session may run at a time
    pub concurrent: bool,
}

/// Outcome of [`diagnose`].
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct Diagnosis {
    pub metrics: Metrics,
    pub verdict: LinkVerdict,
    pub mismatch: DuplexMismatch,
    pub bad_cable: bool,
    pub half_duplex: bool,
    pub congestion: bool,
}

/// Runs every detector over the observations.
pub fn diagnose(obs: &Observations, thresholds: &Thresholds) -> Diagnosis {
    let vars = &obs.vars;
    let m = Metrics::derive(vars, obs.links.c2s_data, thresholds);
    let s2c_mbps = obs.s2c_kbps / 1000.0;
    let mut verdict = LinkVerdict::Undetermined;
    let mut mismatch = DuplexMismatch::None;

    let duplex = m.cwndtime > thresholds.duplex_cwndtime_min
        && m.bw > thresholds.duplex_bw_min
        && ratio(vars.pkts_retrans as f64, m.timesec) > thresholds.duplex_retrans_rate_min
        && vars.max_ssthresh > 0
        && m.rto_idle > thresholds.duplex_rto_idle_min
        && verdict.code() > thresholds.duplex_link_min
        && obs.middlebox_kbps > obs.s2c_kbps
        && !obs.concurrent;
    if duplex {
        mismatch = if obs.c2s_kbps > obs.s2c_kbps {
            DuplexMismatch::Legacy
        } else {
            DuplexMismatch::SwitchFullHostHalf
        };
        verdict = LinkVerdict::AlgorithmFailed;
    }
    if s2c_mbps > thresholds.internal_s2c_min
        && m.realthruput < thresholds.internal_real_max
        && m.rwintime > thresholds.internal_rwintime_min
        && m.loss < thresholds.internal_loss_max
    {
        mismatch = DuplexMismatch::SwitchFullHostHalf;
        verdict = LinkVerdict::AlgorithmFailed;
    }

    if m.bw < m.realthruput {
        verdict = LinkVerdict::AlgorithmFailed;
    }

    let bad_cable = ratio(m.loss * 100.0, m.timesec) > thresholds.cable_loss_rate_min
        && ratio(m.cwndtime, m.timesec) > thresholds.cable_cwnd_ratio_min
        && m.loss < thresholds.cable_loss_max
        && vars.max_ssthresh > 0;

    if m.realthruput < thresholds.ethernet_real_max
        && m.realthruput > thresholds.ethernet_real_min
        && s2c_mbps < thresholds.ethernet_s2c_max
        && m.loss < thresholds.ethernet_loss_max
        && m.oo_order < thresholds.ethernet_order_max
        && verdict.code() > 0
    {
        verdict = LinkVerdict::Ethernet;
    }

    // integer division, as the transition counts are compared for equality
    let same_transitions = vars.snd_lim_trans_cwnd != 0
        && vars.snd_lim_trans_rwin / vars.snd_lim_trans_cwnd == 1;
    if m.sendtime == 0.0
        && m.realthruput < thresholds.wireless_real_max
        && m.bw > thresholds.wireless_bw_min
        && same_transitions
        && m.rwintime > thresholds.wireless_rwintime_min
        && verdict.code() > 0
    {
        verdict = LinkVerdict::Wireless;
    }

    if vars.snd_lim_time_sender < thresholds.dsl_sender_time_max
        && vars.snd_lim_trans_sender == 0
        && m.realthruput < thresholds.dsl_real_max
        && m.realthruput < m.bw
        && verdict.code() > 0
    {
        verdict = LinkVerdict::DslOrCable;
    }

    let half_duplex = m.rwintime > thresholds.half_duplex_rwintime_min
        && ratio(vars.snd_lim_trans_rwin as f64, m.timesec) > thresholds.half_duplex_trans_rate_min
        && ratio(vars.snd_lim_trans_sender as f64, m.timesec)
            > thresholds.half_duplex_trans_rate_min;

    let congestion = m.cwndtime > thresholds.congestion_cwndtime_min
        && mismatch == DuplexMismatch::None
        && ratio(m.cwin, m.rttsec) < ratio(m.rwin, m.rttsec);

    tracing::debug!(
        "diagnosis: verdict={:?} mismatch={:?} bad_cable={} half_duplex={} congestion={} bw={:.4} real={:.4} loss={:.9}",
        verdict,
        mismatch,
        bad_cable,
        half_duplex,
        congestion,
        m.bw,
        m.realthruput,
        m.loss
    );
    Diagnosis {
        metrics: m,
        verdict,
        mismatch,
        bad_cable,
        half_duplex,
        congestion,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn path(rtt_ms: i64, signals: i64, pkts_out: i64, mss: i64) -> TcpVars {
        TcpVars {
            sum_rtt: rtt_ms * 10,
            count_rtt: 10,
            congestion_signals: signals,
            pkts_out,
            cur_mss: mss,
            ..Default::default()
        }
    }

    #[test]
    fn mathis_bound_matches_reference_path() {
        let vars = path(50, 1, 1000, 1460);
        let m = Metrics::derive(&vars, LinkClass::InsufficientData, &Thresholds::default());
        assert!((m.loss - 0.001).abs() < 1e-12);
        assert!((m.rttsec - 0.05).abs() < 1e-12);
        assert!((m.bw - 7.0449).abs() < 0.01, "bw = {}", m.bw);
    }

    #[test]
    fn loss_floor_keeps_bound_finite() {
        let vars = path(50, 0, 1000, 1460);
        let slow = Metrics::derive(&vars, LinkClass::T1, &Thresholds::default());
        assert_eq!(slow.loss, 1e-6);
        assert!(slow.bw.is_finite() && slow.bw > 0.0);
        let fast = Metrics::derive(&vars, LinkClass::Oc12, &Thresholds::default());
        assert_eq!(fast.loss, 1e-10);
        assert!(fast.bw.is_finite() && fast.bw > slow.bw);
    }

    #[test]
    fn empty_counters_give_finite_metrics() {
        let m = Metrics::derive(
            &TcpVars::default(),
            LinkClass::InsufficientData,
            &Thresholds::default(),
        );
        for value in [
            m.avgrtt, m.rttsec, m.loss, m.oo_order, m.bw, m.rwintime, m.cwndtime, m.sendtime,
            m.timesec, m.rto_idle, m.realthruput, m.waitsec, m.spd,
        ] {
            assert!(value.is_finite());
        }
        let d = diagnose(&Observations::default(), &Thresholds::default());
        assert_eq!(d.mismatch, DuplexMismatch::None);
        assert!(!d.bad_cable && !d.half_duplex && !d.congestion);
    }

    #[test]
    fn window_scale_reset_on_small_buffers() {
        let vars = TcpVars {
            snd_win_scale: 7,
            rcv_win_scale: 16,
            sndbuf: 1000,
            max_rwin_rcvd: 1 << 20,
            ..Default::default()
        };
        let m = Metrics::derive(&vars, LinkClass::Unknown, &Thresholds::default());
        assert_eq!(m.snd_win_scale, 0);
        assert_eq!(m.rcv_win_scale, 0);
        assert!((m.rwin - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_time_counts_whole_seconds() {
        let vars = TcpVars {
            snd_lim_time_cwnd: 2_000_000,
            snd_lim_time_sender: 700_000,
            data_bytes_out: 2_000_000,
            ..Default::default()
        };
        let m = Metrics::derive(&vars, LinkClass::Unknown, &Thresholds::default());
        assert_eq!(m.totaltime, 2_700_000);
        assert_eq!(m.timesec, 2.0);
        assert!((m.spd - 8.0).abs() < 1e-9);

        let short = TcpVars {
            snd_lim_time_sender: 900_000,
            data_bytes_out: 1_000_000,
            ..Default::default()
        };
        let m = Metrics::derive(&short, LinkClass::Unknown, &Thresholds::default());
        assert_eq!(m.timesec, 0.0);
        assert_eq!(m.spd, 0.0);
    }

    fn mismatch_path() -> Observations {
        Observations {
            vars: TcpVars {
                sum_rtt: 200,
                count_rtt: 10,
                congestion_signals: 10,
                pkts_out: 100_000,
                pkts_retrans: 100,
                cur_mss: 1460,
                max_ssthresh: 20_000,
                snd_lim_time_cwnd: 9_500_000,
                snd_lim_time_rwin: 500_000,
                timeouts: 5,
                current_rto: 300,
                data_bytes_out: 1_000_000,
                ..Default::default()
            },
            c2s_kbps: 9000.0,
            s2c_kbps: 800.0,
            middlebox_kbps: 1200.0,
            ..Default::default()
        }
    }

    #[test]
    fn duplex_mismatch_forces_algorithm_failed() {
        let d = diagnose(&mismatch_path(), &Thresholds::default());
        assert_eq!(d.mismatch, DuplexMismatch::Legacy);
        assert_eq!(d.verdict, LinkVerdict::AlgorithmFailed);
        assert!(!d.congestion);
    }

    #[test]
    fn slower_upload_reports_switch_full_host_half() {
        let obs = Observations {
            c2s_kbps: 100.0,
            ..mismatch_path()
        };
        let d = diagnose(&obs, &Thresholds::default());
        assert_eq!(d.mismatch, DuplexMismatch::SwitchFullHostHalf);
        assert_eq!(d.mismatch.code(), 2);
    }

    #[test]
    fn concurrent_mode_disables_mismatch_check() {
        let obs = Observations {
            concurrent: true,
            ..mismatch_path()
        };
        assert_eq!(
            diagnose(&obs, &Thresholds::default()).mismatch,
            DuplexMismatch::None
        );
    }

    #[test]
    fn ethernet_verdict() {
        // 5 Mbit/s over 10 s of mostly receiver-limited sending
        let obs = Observations {
            vars: TcpVars {
                sum_rtt: 100,
                count_rtt: 10,
                congestion_signals: 1,
                pkts_out: 10_000,
                ack_pkts_in: 5000,
                cur_mss: 1460,
                snd_lim_time_rwin: 6_000_000,
                snd_lim_time_sender: 4_000_000,
                snd_lim_trans_sender: 3,
                data_bytes_out: 6_250_000,
                ..Default::default()
            },
            s2c_kbps: 5000.0,
            ..Default::default()
        };
        let d = diagnose(&obs, &Thresholds::default());
        assert!((d.metrics.realthruput - 5.0).abs() < 1e-9);
        assert_eq!(d.verdict, LinkVerdict::Ethernet);
        assert_eq!(d.verdict.code(), 10);
    }

    #[test]
    fn dsl_verdict() {
        let obs = Observations {
            vars: TcpVars {
                sum_rtt: 400,
                count_rtt: 10,
                congestion_signals: 2,
                pkts_out: 2000,
                cur_mss: 1460,
                snd_lim_time_cwnd: 10_000_000,
                data_bytes_out: 1_250_000,
                ..Default::default()
            },
            s2c_kbps: 1000.0,
            ..Default::default()
        };
        let d = diagnose(&obs, &Thresholds::default());
        assert_eq!(d.verdict, LinkVerdict::DslOrCable);
    }

    #[test]
    fn custom_thresholds_change_outcome() {
        let thresholds = Thresholds {
            duplex_bw_min: 1e9,
            ..Default::default()
        };
        assert_eq!(
            diagnose(&mismatch_path(), &thresholds).mismatch,
            DuplexMismatch::None
        );
    }

    proptest! {
        #[test]
        fn metrics_are_always_finite(
            sum_rtt in 0i64..1_000_000,
            count_rtt in 0i64..10_000,
            signals in 0i64..10_000,
            pkts_out in 0i64..10_000_000,
            mss in 0i64..9000,
            rwin in 0i64..100_000_000,
            cwnd in 0i64..100_000_000,
            sender in 0i64..100_000_000,
            bytes in 0i64..10_000_000_000,
            timeouts in 0i64..100,
        ) {
            let vars = TcpVars {
                sum_rtt,
                count_rtt,
                congestion_signals: signals,
                pkts_out,
                cur_mss: mss,
                snd_lim_time_rwin: rwin,
                snd_lim_time_cwnd: cwnd,
                snd_lim_time_sender: sender,
                data_bytes_out: bytes,
                timeouts,
                current_rto: 200,
                ..Default::default()
            };
            let d = diagnose(
                &Observations { vars, ..Default::default() },
                &Thresholds::default(),
            );
            let m = d.metrics;
            for value in [m.loss, m.bw, m.rto_idle, m.realthruput, m.spd, m.cwndtime] {
                prop_assert!(value.is_finite());
            }
        }
    }
}
