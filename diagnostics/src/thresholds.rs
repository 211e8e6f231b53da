//! Tuned constants used by the classification heuristics.
//!
//! The values are empirical. They are kept as data so that a deployment can
//! override them from a JSON file without rebuilding.

use anyhow::Context;

/// Thresholds consulted by [`crate::engine`] and [`crate::link`].
///
/// Every field has a default; a JSON file only needs to list the values it changes.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Thresholds {
    /// Loss assumed when no congestion signal was seen on a link faster than FastE
    pub loss_floor_fast: f64,
    /// Loss assumed when no congestion signal was seen otherwise
    pub loss_floor_slow: f64,
    /// C2S link class above which `loss_floor_fast` applies
    pub fast_link_class: i32,

    pub duplex_cwndtime_min: f64,
    pub duplex_bw_min: f64,
    /// Retransmitted segments per second
    pub duplex_retrans_rate_min: f64,
    pub duplex_rto_idle_min: f64,
    pub duplex_link_min: i32,

    /// S2C throughput in Mbps
    pub internal_s2c_min: f64,
    pub internal_real_max: f64,
    pub internal_rwintime_min: f64,
    pub internal_loss_max: f64,

    pub cable_loss_rate_min: f64,
    pub cable_cwnd_ratio_min: f64,
    pub cable_loss_max: f64,

    pub ethernet_real_min: f64,
    pub ethernet_real_max: f64,
    /// S2C throughput in Mbps
    pub ethernet_s2c_max: f64,
    pub ethernet_loss_max: f64,
    pub ethernet_order_max: f64,

    pub wireless_real_max: f64,
    pub wireless_bw_min: f64,
    pub wireless_rwintime_min: f64,

    /// Microseconds spent sender limited
    pub dsl_sender_time_max: i64,
    pub dsl_real_max: f64,

    pub half_duplex_rwintime_min: f64,
    /// Transitions per second, into both the receiver- and sender-limited states
    pub half_duplex_trans_rate_min: f64,

    pub congestion_cwndtime_min: f64,

    /// MSS the middlebox listener clamps to
    pub middlebox_mss: i64,
    /// Option overhead added back to the MSS when timestamps are on
    pub timestamp_overhead: i64,

    /// Highest histogram bin considered when classifying the link
    pub interface_speed_index: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            loss_floor_fast: 1e-10,
            loss_floor_slow: 1e-6,
            fast_link_class: 5,
            duplex_cwndtime_min: 0.9,
            duplex_bw_min: 2.0,
            duplex_retrans_rate_min: 2.0,
            duplex_rto_idle_min: 0.01,
            duplex_link_min: 2,
            internal_s2c_min: 50.0,
            internal_real_max: 5.0,
            internal_rwintime_min: 0.9,
            internal_loss_max: 0.01,
            cable_loss_rate_min: 15.0,
            cable_cwnd_ratio_min: 0.6,
            cable_loss_max: 0.01,
            ethernet_real_min: 3.0,
            ethernet_real_max: 9.5,
            ethernet_s2c_max: 9.5,
            ethernet_loss_max: 0.01,
            ethernet_order_max: 0.035,
            wireless_real_max: 5.0,
            wireless_bw_min: 50.0,
            wireless_rwintime_min: 0.9,
            dsl_sender_time_max: 600,
            dsl_real_max: 2.0,
            half_duplex_rwintime_min: 0.95,
            half_duplex_trans_rate_min: 30.0,
            congestion_cwndtime_min: 0.02,
            middlebox_mss: 1456,
            timestamp_overhead: 12,
            interface_speed_index: 10,
        }
    }
}

impl Thresholds {
    /// Loads thresholds from a JSON file; missing fields keep their defaults.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read thresholds from {}", path.display()))?;
        let thresholds: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse thresholds in {}", path.display()))?;
        thresholds.validate().map_err(anyhow::Error::msg)?;
        Ok(thresholds)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.loss_floor_fast > 0.0 && self.loss_floor_slow > 0.0) {
            return Err("loss floors must be positive".to_string());
        }
        if self.interface_speed_index > 10 {
            return Err(format!(
                "interface_speed_index must be at most 10, got {}",
                self.interface_speed_index
            ));
        }
        Ok(())
    }
}
