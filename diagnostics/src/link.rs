//! Bottleneck link classification from a packet-pair speed histogram.

/// Number of histogram bins.
pub const BINS: usize = 12;

const RETRANSMISSION_BIN: usize = 10;
const UNKNOWN_BIN: usize = 11;

/// Upper bounds (Mbps, inclusive) of the speed bins 0..=9.
const BIN_LIMITS: [f64; 10] = [
    0.01, 0.064, 1.5, 10.0, 40.0, 100.0, 622.0, 1000.0, 2400.0, 10000.0,
];

/// Bottleneck bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum LinkClass {
    SystemFault,
    InsufficientData,
    Rtt,
    DialUp,
    T1,
    Ethernet,
    T3,
    FastEthernet,
    Oc12,
    GigE,
    Oc48,
    TenGigE,
    Retransmissions,
    Unknown,
}

impl LinkClass {
    pub fn code(self) -> i32 {
        match self {
            LinkClass::SystemFault => -1,
            LinkClass::InsufficientData => -2,
            LinkClass::Rtt => 0,
            LinkClass::DialUp => 1,
            LinkClass::T1 => 2,
            LinkClass::Ethernet => 3,
            LinkClass::T3 => 4,
            LinkClass::FastEthernet => 5,
            LinkClass::Oc12 => 6,
            LinkClass::GigE => 7,
            LinkClass::Oc48 => 8,
            LinkClass::TenGigE => 9,
            LinkClass::Retransmissions => 10,
            LinkClass::Unknown => 11,
        }
    }

    fn from_bin(bin: usize) -> Self {
        match bin {
            0 => LinkClass::Rtt,
            1 => LinkClass::DialUp,
            2 => LinkClass::T1,
            3 => LinkClass::Ethernet,
            4 => LinkClass::T3,
            5 => LinkClass::FastEthernet,
            6 => LinkClass::Oc12,
            7 => LinkClass::GigE,
            8 => LinkClass::Oc48,
            9 => LinkClass::TenGigE,
            RETRANSMISSION_BIN => LinkClass::Retransmissions,
            _ => LinkClass::Unknown,
        }
    }
}

impl std::fmt::Display for LinkClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkClass::SystemFault => "system fault",
            LinkClass::InsufficientData => "insufficient data",
            LinkClass::Rtt => "round trip time",
            LinkClass::DialUp => "dial-up modem",
            LinkClass::T1 => "T1",
            LinkClass::Ethernet => "Ethernet",
            LinkClass::T3 => "T3",
            LinkClass::FastEthernet => "FastEthernet",
            LinkClass::Oc12 => "OC-12",
            LinkClass::GigE => "Gigabit Ethernet",
            LinkClass::Oc48 => "OC-48",
            LinkClass::TenGigE => "10 Gigabit Ethernet",
            LinkClass::Retransmissions => "retransmissions",
            LinkClass::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Counts of inter-packet speeds per bin, as produced by packet capture.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LinkHistogram {
    pub bins: [u32; BINS],
    /// Number of packet pairs that fed the histogram
    pub samples: u32,
}

impl LinkHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bin for an inter-packet speed in Mbps.
    pub fn bin_for(mbps: f64) -> usize {
        if mbps == 0.0 {
            return RETRANSMISSION_BIN;
        }
        if mbps > 0.0
            && let Some(bin) = BIN_LIMITS.iter().position(|limit| mbps <= *limit)
        {
            return bin;
        }
        UNKNOWN_BIN
    }

    pub fn record(&mut self, mbps: f64) {
        self.bins[Self::bin_for(mbps)] += 1;
        self.samples += 1;
    }

    /// Picks the dominant bucket.
    ///
    /// `interface_speed_index` caps the highest bin considered (values above 10 are
    /// clamped). A missing histogram or fewer than two samples is insufficient data;
    /// an all-zero histogram is a system fault.
    pub fn classify(histogram: Option<&Self>, interface_speed_index: usize) -> LinkClass {
        let Some(histogram) = histogram else {
            return LinkClass::InsufficientData;
        };
        if histogram.samples < 2 {
            return LinkClass::InsufficientData;
        }
        if histogram.bins.iter().all(|count| *count == 0) {
            return LinkClass::SystemFault;
        }
        let limit = match interface_speed_index {
            0 => RETRANSMISSION_BIN,
            n => n.min(RETRANSMISSION_BIN),
        };
        let mut index = strict_max(&histogram.bins[..=limit]);
        if index == 8 {
            index = strict_max(&histogram.bins[..=9]);
        }
        LinkClass::from_bin(index)
    }
}

/// First index holding the largest count.
fn strict_max(bins: &[u32]) -> usize {
    let mut max = 0;
    let mut index = 0;
    for (bin, count) in bins.iter().enumerate() {
        if *count > max {
            max = *count;
            index = bin;
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn histogram(pairs: &[(usize, u32)]) -> LinkHistogram {
        let mut histogram = LinkHistogram::new();
        for (bin, count) in pairs {
            histogram.bins[*bin] = *count;
            histogram.samples += count;
        }
        histogram
    }

    #[test]
    fn bins_follow_speed_limits() {
        assert_eq!(LinkHistogram::bin_for(0.005), 0);
        assert_eq!(LinkHistogram::bin_for(0.01), 0);
        assert_eq!(LinkHistogram::bin_for(0.05), 1);
        assert_eq!(LinkHistogram::bin_for(1.5), 2);
        assert_eq!(LinkHistogram::bin_for(95.0), 5);
        assert_eq!(LinkHistogram::bin_for(1000.0), 7);
        assert_eq!(LinkHistogram::bin_for(9000.0), 9);
        assert_eq!(LinkHistogram::bin_for(0.0), 10);
        assert_eq!(LinkHistogram::bin_for(20000.0), 11);
        assert_eq!(LinkHistogram::bin_for(-1.0), 11);
    }

    #[test]
    fn special_buckets_win_first() {
        assert_eq!(
            LinkHistogram::classify(None, 10),
            LinkClass::InsufficientData
        );
        let one = histogram(&[(5, 1)]);
        assert_eq!(
            LinkHistogram::classify(Some(&one), 10),
            LinkClass::InsufficientData
        );
        let empty = LinkHistogram {
            bins: [0; BINS],
            samples: 4,
        };
        assert_eq!(
            LinkHistogram::classify(Some(&empty), 10),
            LinkClass::SystemFault
        );
    }

    #[test]
    fn largest_bin_wins() {
        let histogram = histogram(&[(3, 4), (5, 9), (7, 2)]);
        assert_eq!(
            LinkHistogram::classify(Some(&histogram), 10),
            LinkClass::FastEthernet
        );
        assert_eq!(LinkClass::FastEthernet.code(), 5);
    }

    #[test]
    fn ties_keep_the_slower_bin() {
        let histogram = histogram(&[(2, 6), (6, 6)]);
        assert_eq!(LinkHistogram::classify(Some(&histogram), 10), LinkClass::T1);
    }

    #[test]
    fn interface_speed_caps_bins() {
        let histogram = histogram(&[(3, 2), (7, 9)]);
        assert_eq!(
            LinkHistogram::classify(Some(&histogram), 5),
            LinkClass::Ethernet
        );
    }

    proptest! {
        #[test]
        fn classification_is_pure(
            bins in proptest::array::uniform12(0u32..50),
            samples in 0u32..200,
            cap in 0usize..=12,
        ) {
            let histogram = LinkHistogram { bins, samples };
            let first = LinkHistogram::classify(Some(&histogram), cap);
            let second = LinkHistogram::classify(Some(&histogram.clone()), cap);
            prop_assert_eq!(first, second);
        }
    }
}
