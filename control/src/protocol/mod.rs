//! Message vocabulary carried over the control channel.

use crate::codec::{Message, MessageType};

/// Written right after accept so that clients speaking an incompatible protocol
/// revision disconnect instead of waiting for a message that never comes.
pub const LEGACY_PROBE: &[u8; 13] = b"123456 654321";

/// Longest client version accepted in an extended login.
pub const MAX_CLIENT_VERSION_LEN: usize = 64;

/// Receive capacity for the login message.
pub const LOGIN_CAPACITY: usize = 1 + MAX_CLIENT_VERSION_LEN;

/// Maximum size of one RESULTS chunk.
pub const RESULTS_CHUNK: usize = 8192;

/// The tests a client can request.
///
/// Declaration order is the order tests are announced and run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, enum_map::Enum)]
pub enum TestKind {
    Middlebox,
    Firewall,
    C2s,
    S2c,
    Meta,
}

impl TestKind {
    pub const ALL: [TestKind; 5] = [
        TestKind::Middlebox,
        TestKind::Firewall,
        TestKind::C2s,
        TestKind::S2c,
        TestKind::Meta,
    ];

    /// Login bit, also the id used in the test-suite announcement.
    pub fn bit(self) -> u8 {
        match self {
            TestKind::Middlebox => 1,
            TestKind::C2s => 2,
            TestKind::S2c => 4,
            TestKind::Firewall => 8,
            TestKind::Meta => 32,
        }
    }

    /// Prefix used in ERROR messages sent while this test runs.
    pub fn label(self) -> &'static str {
        match self {
            TestKind::Middlebox => "Middlebox test",
            TestKind::Firewall => "Simple firewall test",
            TestKind::C2s => "C2S throughput test",
            TestKind::S2c => "S2C throughput test",
            TestKind::Meta => "META test",
        }
    }
}

impl std::fmt::Display for TestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TestKind::Middlebox => "mid",
            TestKind::Firewall => "sfw",
            TestKind::C2s => "c2s",
            TestKind::S2c => "s2c",
            TestKind::Meta => "meta",
        };
        write!(f, "{name}")
    }
}

/// Login bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TestSet(u8);

impl TestSet {
    /// Client understands heartbeat queue probes.
    pub const STATUS: u8 = 16;
    /// Client sent an extended login.
    pub const EXTENDED: u8 = 64;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn with(self, kind: TestKind) -> Self {
        Self(self.0 | kind.bit())
    }

    pub fn contains(self, kind: TestKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn heartbeat_capable(self) -> bool {
        self.0 & Self::STATUS != 0
    }

    /// Requested tests in run order.
    pub fn tests(self) -> impl Iterator<Item = TestKind> {
        TestKind::ALL.into_iter().filter(move |kind| self.contains(*kind))
    }

    pub fn has_tests(self) -> bool {
        self.tests().next().is_some()
    }

    /// Space-separated ids of the requested tests, sent in the second LOGIN message.
    pub fn suite(self) -> String {
        self.tests()
            .map(|kind| kind.bit().to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Decoded login message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub tests: TestSet,
    pub client_version: Option<String>,
}

/// Why a login was refused; the display text is sent to the client verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoginError {
    #[error("Invalid login message.")]
    Malformed,
    #[error("Invalid test suite request.")]
    NoTests,
}

impl Login {
    pub fn parse(message: &Message) -> Result<Self, LoginError> {
        let payload = &message.payload;
        let (tests, client_version) = match message.kind {
            MessageType::Login if payload.len() == 1 => (TestSet::from_bits(payload[0]), None),
            MessageType::ExtendedLogin
                if !payload.is_empty() && payload.len() <= LOGIN_CAPACITY =>
            {
                let version = String::from_utf8_lossy(&payload[1..]).into_owned();
                (
                    TestSet::from_bits(payload[0] | TestSet::EXTENDED),
                    Some(version),
                )
            }
            _ => return Err(LoginError::Malformed),
        };
        if !tests.has_tests() {
            return Err(LoginError::NoTests);
        }
        Ok(Self {
            tests,
            client_version,
        })
    }
}

/// Queue status payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    StartNow,
    /// N sessions ahead of this one
    Ahead(u32),
    ServerFault,
    ServerBusy,
    BusyRetryIn60s,
    Heartbeat,
}

impl QueueStatus {
    pub fn code(self) -> u32 {
        match self {
            QueueStatus::StartNow => 0,
            QueueStatus::Ahead(n) => n,
            QueueStatus::ServerFault => 9977,
            QueueStatus::ServerBusy => 9988,
            QueueStatus::Heartbeat => 9990,
            QueueStatus::BusyRetryIn60s => 9999,
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        let code: u32 = text.trim().parse().ok()?;
        Some(match code {
            0 => QueueStatus::StartNow,
            9977 => QueueStatus::ServerFault,
            9988 => QueueStatus::ServerBusy,
            9990 => QueueStatus::Heartbeat,
            9999 => QueueStatus::BusyRetryIn60s,
            n => QueueStatus::Ahead(n),
        })
    }

    pub fn to_message(self) -> Message {
        Message::new(MessageType::QueueStatus, self.code().to_string())
    }
}

/// Outcome of the simple firewall test as reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallResult {
    NotTested,
    NoFirewall,
    Unknown,
    Possible,
}

impl FirewallResult {
    pub fn code(self) -> u8 {
        match self {
            FirewallResult::NotTested => 0,
            FirewallResult::NoFirewall => 1,
            FirewallResult::Unknown => 2,
            FirewallResult::Possible => 3,
        }
    }
}

/// Text the firewall test expects on the out-of-band connection.
pub const FIREWALL_PROBE: &str = "Simple firewall test";

/// Sent in place of counters when the stats provider returned nothing.
pub const NO_DATA_COLLECTED: &str = "No Data Collected: 000000";

/// Splits `text` into RESULTS-sized pieces on line boundaries where possible.
pub fn chunk_results(text: &str, max: usize) -> Vec<String> {
    let max = max.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        if !current.is_empty() && current.len() + line.len() > max {
            chunks.push(std::mem::take(&mut current));
        }
        if line.len() > max {
            let mut rest = line;
            while rest.len() > max {
                let mut cut = max;
                while !rest.is_char_boundary(cut) {
                    cut -= 1;
                }
                if cut == 0 {
                    cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
                }
                chunks.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
            current.push_str(rest);
        } else {
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_uses_canonical_order() {
        let set = TestSet::from_bits(2 | 4 | 1 | 32 | 8 | TestSet::STATUS);
        assert_eq!(set.suite(), "1 8 2 4 32");
        assert!(set.heartbeat_capable());
        let set = TestSet::from_bits(4 | 2);
        assert_eq!(set.suite(), "2 4");
        assert!(!set.heartbeat_capable());
    }

    #[test]
    fn login_requires_one_byte() {
        let ok = Login::parse(&Message::new(MessageType::Login, vec![2u8 | 4])).unwrap();
        assert_eq!(
            ok.tests.tests().collect::<Vec<_>>(),
            vec![TestKind::C2s, TestKind::S2c]
        );
        assert_eq!(ok.client_version, None);
        assert_eq!(
            Login::parse(&Message::new(MessageType::Login, vec![2u8, 4])),
            Err(LoginError::Malformed)
        );
        assert_eq!(
            Login::parse(&Message::new(MessageType::TestMsg, vec![2u8])),
            Err(LoginError::Malformed)
        );
    }

    #[test]
    fn login_rejects_empty_selection() {
        let err =
            Login::parse(&Message::new(MessageType::Login, vec![TestSet::STATUS])).unwrap_err();
        assert_eq!(err, LoginError::NoTests);
        assert_eq!(err.to_string(), "Invalid test suite request.");
    }

    #[test]
    fn extended_login_carries_version() {
        let mut payload = vec![1u8 | TestSet::STATUS];
        payload.extend_from_slice(b"v3.7.0");
        let login = Login::parse(&Message::new(MessageType::ExtendedLogin, payload)).unwrap();
        assert_eq!(login.client_version.as_deref(), Some("v3.7.0"));
        assert!(login.tests.heartbeat_capable());
        assert!(login.tests.contains(TestKind::Middlebox));
        let long = vec![b'x'; LOGIN_CAPACITY + 1];
        assert_eq!(
            Login::parse(&Message::new(MessageType::ExtendedLogin, long)),
            Err(LoginError::Malformed)
        );
    }

    #[test]
    fn queue_status_codes() {
        assert_eq!(QueueStatus::ServerBusy.to_message().text(), "9988");
        assert_eq!(QueueStatus::Ahead(3).to_message().text(), "3");
        assert_eq!(QueueStatus::parse("9990"), Some(QueueStatus::Heartbeat));
        assert_eq!(QueueStatus::parse(" 0"), Some(QueueStatus::StartNow));
        assert_eq!(QueueStatus::parse("x"), None);
    }

    #[test]
    fn results_are_chunked_on_lines() {
        let text = "a: 1\nbb: 2\nccc: 3\n";
        let chunks = chunk_results(text, 12);
        assert_eq!(chunks, vec!["a: 1\nbb: 2\n", "ccc: 3\n"]);
        assert_eq!(chunks.concat(), text);
        let long = "x".repeat(25);
        let chunks = chunk_results(&long, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 10));
        assert_eq!(chunks.concat(), long);
    }
}
