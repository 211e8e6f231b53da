use super::{names, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Limit {
    Rwin,
    Cwnd,
    Sender,
}

// linux congestion-avoidance states
const CA_CWR: i64 = 2;
const CA_LOSS: i64 = 4;

/// Folds a sequence of snapshots of one connection into cumulative counters.
#[derive(Debug, Default)]
pub struct Aggregator {
    last: Option<Snapshot>,
    samples: usize,
    sum_rtt: i64,
    count_rtt: i64,
    max_rtt: i64,
    max_rto: i64,
    max_cwnd: i64,
    max_ssthresh: i64,
    max_rwin: i64,
    congestion_signals: i64,
    timeouts: i64,
    limit: Option<Limit>,
    trans_rwin: i64,
    trans_cwnd: i64,
    trans_sender: i64,
    cwnd_increases: i64,
    cwnd_decreases: i64,
    cwnd_unchanged: i64,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn last(&self) -> Option<&Snapshot> {
        self.last.as_ref()
    }

    pub fn observe(&mut self, snapshot: &Snapshot) {
        self.samples += 1;
        let rtt = snapshot.get_or_zero(names::SAMPLE_RTT);
        if rtt > 0 {
            self.sum_rtt += rtt;
            self.count_rtt += 1;
            self.max_rtt = self.max_rtt.max(rtt);
        }
        self.max_rto = self.max_rto.max(snapshot.get_or_zero(names::CURRENT_RTO));
        let cwnd = snapshot.get_or_zero(names::CUR_CWND);
        self.max_cwnd = self.max_cwnd.max(cwnd);
        self.max_ssthresh = self
            .max_ssthresh
            .max(snapshot.get_or_zero(names::CUR_SSTHRESH));
        self.max_rwin = self
            .max_rwin
            .max(snapshot.get_or_zero(names::CUR_RWIN_RCVD));
        if let Some(prev) = &self.last {
            let prev_ca = prev.get_or_zero(names::CA_STATE);
            let ca = snapshot.get_or_zero(names::CA_STATE);
            if prev_ca < CA_CWR && ca >= CA_CWR {
                self.congestion_signals += 1;
            }
            if prev_ca != CA_LOSS && ca == CA_LOSS {
                self.timeouts += 1;
            }
            let prev_cwnd = prev.get_or_zero(names::CUR_CWND);
            match cwnd.cmp(&prev_cwnd) {
                std::cmp::Ordering::Greater => self.cwnd_increases += 1,
                std::cmp::Ordering::Less => self.cwnd_decreases += 1,
                std::cmp::Ordering::Equal => self.cwnd_unchanged += 1,
            }
            let delta = |name: &str| snapshot.get_or_zero(name) - prev.get_or_zero(name);
            let rwin = delta(names::SND_LIM_TIME_RWIN);
            let cwnd_time = delta(names::SND_LIM_TIME_CWND);
            let sender = delta(names::SND_LIM_TIME_SENDER);
            let dominant = if rwin <= 0 && cwnd_time <= 0 && sender <= 0 {
                None
            } else if rwin >= cwnd_time && rwin >= sender {
                Some(Limit::Rwin)
            } else if cwnd_time >= sender {
                Some(Limit::Cwnd)
            } else {
                Some(Limit::Sender)
            };
            if let Some(dominant) = dominant
                && self.limit != Some(dominant)
            {
                match dominant {
                    Limit::Rwin => self.trans_rwin += 1,
                    Limit::Cwnd => self.trans_cwnd += 1,
                    Limit::Sender => self.trans_sender += 1,
                }
                self.limit = Some(dominant);
            }
        }
        self.last = Some(snapshot.clone());
    }

    /// The last snapshot merged with the cumulative counters.
    ///
    /// Empty when nothing was observed.
    pub fn finish(&self) -> Snapshot {
        let Some(last) = &self.last else {
            return Snapshot::new();
        };
        let mut out = last.clone();
        out.set(names::SUM_RTT, self.sum_rtt);
        out.set(names::COUNT_RTT, self.count_rtt);
        out.set(names::MAX_RTT, self.max_rtt);
        out.set(names::MAX_RTO, self.max_rto);
        out.set(names::MAX_CWND, self.max_cwnd);
        out.set(names::MAX_SSTHRESH, self.max_ssthresh);
        out.set(names::MAX_RWIN_RCVD, self.max_rwin);
        out.set(names::CONGESTION_SIGNALS, self.congestion_signals);
        out.set(names::TIMEOUTS, self.timeouts);
        out.set(names::SND_LIM_TRANS_RWIN, self.trans_rwin);
        out.set(names::SND_LIM_TRANS_CWND, self.trans_cwnd);
        out.set(names::SND_LIM_TRANS_SENDER, self.trans_sender);
        out.set(names::CWND_INCREASES, self.cwnd_increases);
        out.set(names::CWND_DECREASES, self.cwnd_decreases);
        out.set(names::CWND_UNCHANGED, self.cwnd_unchanged);
        if out.get(names::DUP_ACKS_IN).is_none() {
            out.set(names::DUP_ACKS_IN, 0);
        }
        let acks =
            (last.get_or_zero(names::PKTS_IN) - last.get_or_zero(names::DATA_PKTS_IN)).max(0);
        out.set(names::ACK_PKTS_IN, acks);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(values: &[(&str, i64)]) -> Snapshot {
        values
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect()
    }

    #[test]
    fn empty_aggregator_yields_empty_snapshot() {
        let agg = Aggregator::new();
        assert!(agg.finish().is_empty());
        assert_eq!(agg.samples(), 0);
    }

    #[test]
    fn rtt_and_maxima() {
        let mut agg = Aggregator::new();
        agg.observe(&sample(&[(names::SAMPLE_RTT, 40), (names::CUR_CWND, 10_000)]));
        agg.observe(&sample(&[(names::SAMPLE_RTT, 0), (names::CUR_CWND, 20_000)]));
        agg.observe(&sample(&[(names::SAMPLE_RTT, 60), (names::CUR_CWND, 15_000)]));
        let out = agg.finish();
        assert_eq!(out.get(names::SUM_RTT), Some(100));
        assert_eq!(out.get(names::COUNT_RTT), Some(2));
        assert_eq!(out.get(names::MAX_RTT), Some(60));
        assert_eq!(out.get(names::MAX_CWND), Some(20_000));
        assert_eq!(out.get(names::CWND_INCREASES), Some(1));
        assert_eq!(out.get(names::CWND_DECREASES), Some(1));
        assert_eq!(out.get(names::CUR_CWND), Some(15_000));
    }

    #[test]
    fn congestion_signals_count_state_entries() {
        let mut agg = Aggregator::new();
        for ca in [0, 3, 3, 0, 2, 4, 0] {
            agg.observe(&sample(&[(names::CA_STATE, ca)]));
        }
        let out = agg.finish();
        assert_eq!(out.get(names::CONGESTION_SIGNALS), Some(2));
        assert_eq!(out.get(names::TIMEOUTS), Some(1));
    }

    #[test]
    fn limit_transitions() {
        let mut agg = Aggregator::new();
        let steps = [
            (0, 0, 0),
            (100, 0, 0),
            (200, 0, 0),
            (200, 300, 0),
            (200, 300, 50),
            (500, 300, 50),
        ];
        for (rwin, cwnd, sender) in steps {
            agg.observe(&sample(&[
                (names::SND_LIM_TIME_RWIN, rwin),
                (names::SND_LIM_TIME_CWND, cwnd),
                (names::SND_LIM_TIME_SENDER, sender),
            ]));
        }
        let out = agg.finish();
        assert_eq!(out.get(names::SND_LIM_TRANS_RWIN), Some(2));
        assert_eq!(out.get(names::SND_LIM_TRANS_CWND), Some(1));
        assert_eq!(out.get(names::SND_LIM_TRANS_SENDER), Some(1));
    }

    #[test]
    fn ack_packets_derived_from_segment_counts() {
        let mut agg = Aggregator::new();
        agg.observe(&sample(&[(names::PKTS_IN, 120), (names::DATA_PKTS_IN, 20)]));
        assert_eq!(agg.finish().get(names::ACK_PKTS_IN), Some(100));
        assert_eq!(agg.finish().get(names::DUP_ACKS_IN), Some(0));
    }

    proptest! {
        #[test]
        fn every_step_moves_the_window_one_way(cwnds in prop::collection::vec(0i64..100_000, 1..64)) {
            let mut agg = Aggregator::new();
            for cwnd in &cwnds {
                agg.observe(&sample(&[(names::CUR_CWND, *cwnd)]));
            }
            let out = agg.finish();
            let steps = out.get_or_zero(names::CWND_INCREASES)
                + out.get_or_zero(names::CWND_DECREASES)
                + out.get_or_zero(names::CWND_UNCHANGED);
            prop_assert_eq!(steps, cwnds.len() as i64 - 1);
            prop_assert_eq!(out.get(names::MAX_CWND), cwnds.iter().copied().max());
            prop_assert_eq!(agg.samples(), cwnds.len());
        }
    }
}
