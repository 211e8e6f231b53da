//! Middlebox test report and the detectors that read it.

/// Rendered in place of a window scale the kernel reports as "unset".
const UNSET_U32: i64 = 4_294_967_295;

/// What the server saw on the middlebox test connection.
///
/// Sent to the client as `"serverip;clientip;CurMSS;WinScaleSent;WinScaleRecv;"`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MiddleboxReport {
    pub server_ip: String,
    pub client_ip: String,
    pub mss: i64,
    pub win_scale_sent: i64,
    pub win_scale_recv: i64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReportError {
    #[error("middlebox report has {0} fields, expected 5")]
    FieldCount(usize),
    #[error("invalid number {value:?} in middlebox field {field}")]
    InvalidNumber { field: &'static str, value: String },
}

fn render_u32(value: i64) -> i64 {
    if value == UNSET_U32 { -1 } else { value }
}

impl MiddleboxReport {
    pub fn new(
        server_ip: std::net::IpAddr,
        client_ip: std::net::IpAddr,
        mss: i64,
        win_scale_sent: i64,
        win_scale_recv: i64,
    ) -> Self {
        Self {
            server_ip: server_ip.to_string(),
            client_ip: client_ip.to_string(),
            mss: render_u32(mss),
            win_scale_sent: render_u32(win_scale_sent),
            win_scale_recv: render_u32(win_scale_recv),
        }
    }

    pub fn parse(text: &str) -> Result<Self, ReportError> {
        let fields: Vec<&str> = text.trim_end_matches(';').split(';').collect();
        if fields.len() != 5 {
            return Err(ReportError::FieldCount(fields.len()));
        }
        let number = |field: &'static str, value: &str| {
            value
                .trim()
                .parse::<i64>()
                .map_err(|_| ReportError::InvalidNumber {
                    field,
                    value: value.to_string(),
                })
        };
        Ok(Self {
            server_ip: fields[0].trim().to_string(),
            client_ip: fields[1].trim().to_string(),
            mss: number("mss", fields[2])?,
            win_scale_sent: number("win_scale_sent", fields[3])?,
            win_scale_recv: number("win_scale_recv", fields[4])?,
        })
    }

    /// Whether the MSS the listener clamped to survived the path.
    ///
    /// `timestamps` adds back the option overhead the kernel subtracts from the MSS.
    pub fn mss_preserved(&self, timestamps: bool, expected: i64, timestamp_overhead: i64) -> bool {
        let mss = if timestamps {
            self.mss + timestamp_overhead
        } else {
            self.mss
        };
        mss == expected
    }

    /// Compares the addresses the server saw with the ones the client saw, per side.
    pub fn nat(&self, client_view: &AddressView) -> NatDetection {
        NatDetection {
            server_side: !same_address(&self.server_ip, &client_view.server_ip),
            client_side: !same_address(&self.client_ip, &client_view.client_ip),
        }
    }
}

impl std::fmt::Display for MiddleboxReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{};{};{};{};{};",
            self.server_ip, self.client_ip, self.mss, self.win_scale_sent, self.win_scale_recv
        )
    }
}

/// Addresses of the control connection as observed by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressView {
    pub server_ip: String,
    pub client_ip: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct NatDetection {
    pub server_side: bool,
    pub client_side: bool,
}

impl NatDetection {
    pub fn any(self) -> bool {
        self.server_side || self.client_side
    }
}

// ipv4-mapped ipv6 addresses compare equal to their ipv4 form
fn same_address(a: &str, b: &str) -> bool {
    let canonical = |s: &str| match s.trim().parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        Ok(ip) => ip.to_string(),
        Err(_) => s.trim().to_string(),
    };
    canonical(a) == canonical(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_unset_scales_as_minus_one() {
        let report = MiddleboxReport::new(
            [10, 0, 0, 1].into(),
            [192, 168, 1, 5].into(),
            1456,
            4_294_967_295,
            7,
        );
        assert_eq!(report.to_string(), "10.0.0.1;192.168.1.5;1456;-1;7;");
    }

    #[test]
    fn parse_reads_back_rendered_report() {
        let report = MiddleboxReport::parse("10.0.0.1;192.168.1.5;1444;-1;7;").unwrap();
        assert_eq!(report.server_ip, "10.0.0.1");
        assert_eq!(report.mss, 1444);
        assert_eq!(report.win_scale_sent, -1);
        assert_eq!(
            MiddleboxReport::parse("a;b;1;2;"),
            Err(ReportError::FieldCount(4))
        );
        assert!(matches!(
            MiddleboxReport::parse("a;b;x;2;3;"),
            Err(ReportError::InvalidNumber { field: "mss", .. })
        ));
    }

    #[test]
    fn mss_check_accounts_for_timestamps() {
        let report = MiddleboxReport::parse("a;b;1444;0;0;").unwrap();
        assert!(report.mss_preserved(true, 1456, 12));
        assert!(!report.mss_preserved(false, 1456, 12));
        let clamped = MiddleboxReport::parse("a;b;1380;0;0;").unwrap();
        assert!(!clamped.mss_preserved(true, 1456, 12));
    }

    #[test]
    fn nat_is_detected_per_side() {
        let report = MiddleboxReport::parse("198.51.100.2;203.0.113.9;1456;0;0;").unwrap();
        let direct = AddressView {
            server_ip: "198.51.100.2".to_string(),
            client_ip: "::ffff:203.0.113.9".to_string(),
        };
        assert!(!report.nat(&direct).any());
        let behind_nat = AddressView {
            server_ip: "198.51.100.2".to_string(),
            client_ip: "192.168.0.10".to_string(),
        };
        let nat = report.nat(&behind_nat);
        assert!(nat.client_side);
        assert!(!nat.server_side);
    }
}
