/// Phase of the congestion window as seen by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// No decrease observed yet.
    #[default]
    SlowStart,
    /// At least one decrease observed; peaks and troughs are being counted.
    Oscillating,
}

/// Final oscillation statistics.
///
/// `min` and `max` are `None` when the window never reached the corresponding turning point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CwndPeaks {
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub peak_count: u32,
}

impl CwndPeaks {
    /// `min` as reported to clients, -1 when unset.
    pub fn min_or_unset(&self) -> i64 {
        self.min.map_or(-1, |v| i64::try_from(v).unwrap_or(i64::MAX))
    }

    /// `max` as reported to clients, -1 when unset.
    pub fn max_or_unset(&self) -> i64 {
        self.max.map_or(-1, |v| i64::try_from(v).unwrap_or(i64::MAX))
    }
}

/// Tracks peaks and troughs of the congestion window.
#[derive(Debug, Clone, Default)]
pub struct CwndPeakTracker {
    phase: Phase,
    previous: Option<u64>,
    decreasing: bool,
    peaks: CwndPeaks,
}

impl CwndPeakTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Feeds one sample.
    pub fn observe(&mut self, current: u64) {
        let Some(previous) = self.previous.replace(current) else {
            return;
        };
        match self.phase {
            Phase::SlowStart => {
                if current < previous {
                    self.phase = Phase::Oscillating;
                    self.peaks.max = Some(previous);
                    self.peaks.peak_count = 1;
                    self.decreasing = true;
                }
            }
            Phase::Oscillating => {
                if current < previous {
                    if !self.decreasing {
                        self.peaks.peak_count += 1;
                    }
                    if self.peaks.max.is_none_or(|max| previous > max) {
                        self.peaks.max = Some(previous);
                    }
                    self.decreasing = true;
                } else if current > previous {
                    if self.peaks.min.is_none_or(|min| previous < min) {
                        self.peaks.min = Some(previous);
                    }
                    self.decreasing = false;
                }
            }
        }
    }

    pub fn peaks(&self) -> CwndPeaks {
        self.peaks
    }

    pub fn finish(self) -> CwndPeaks {
        self.peaks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn run(samples: &[u64]) -> CwndPeaks {
        let mut tracker = CwndPeakTracker::new();
        for &s in samples {
            tracker.observe(s);
        }
        tracker.finish()
    }

    #[test]
    fn monotonic_growth_stays_in_slow_start() {
        let mut tracker = CwndPeakTracker::new();
        for s in [10, 20, 40, 80, 80, 160] {
            tracker.observe(s);
        }
        assert_eq!(tracker.phase(), Phase::SlowStart);
        let peaks = tracker.finish();
        assert_eq!(peaks, CwndPeaks::default());
        assert_eq!(peaks.min_or_unset(), -1);
        assert_eq!(peaks.max_or_unset(), -1);
    }

    #[test]
    fn first_decrease_records_max() {
        let peaks = run(&[10, 20, 40, 20]);
        assert_eq!(peaks.max, Some(40));
        assert_eq!(peaks.peak_count, 1);
        assert_eq!(peaks.min, None);
    }

    #[test]
    fn sawtooth_counts_peaks() {
        // 40 peak, trough 20, peak 35, trough 17, peak 50
        let peaks = run(&[10, 40, 20, 25, 35, 17, 30, 50, 25]);
        assert_eq!(peaks.peak_count, 3);
        assert_eq!(peaks.max, Some(50));
        assert_eq!(peaks.min, Some(17));
    }

    #[test]
    fn equal_samples_do_not_change_state() {
        let a = run(&[10, 40, 20, 20, 20, 30]);
        let b = run(&[10, 40, 20, 30]);
        assert_eq!(a, b);
    }

    #[test]
    fn consecutive_decreases_count_once() {
        let peaks = run(&[10, 40, 30, 20, 10, 20, 15]);
        assert_eq!(peaks.peak_count, 2);
        assert_eq!(peaks.min, Some(10));
        assert_eq!(peaks.max, Some(40));
    }

    proptest! {
        #[test]
        fn same_sequence_same_result(samples in proptest::collection::vec(0u64..1_000_000, 0..500)) {
            prop_assert_eq!(run(&samples), run(&samples));
        }

        #[test]
        fn min_never_exceeds_max(samples in proptest::collection::vec(0u64..1_000_000, 0..500)) {
            let peaks = run(&samples);
            if let (Some(min), Some(max)) = (peaks.min, peaks.max) {
                prop_assert!(min <= max);
            }
            if peaks.peak_count == 0 {
                prop_assert!(peaks.max.is_none());
            }
        }
    }
}
