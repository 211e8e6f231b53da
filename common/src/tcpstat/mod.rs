//! Per-connection TCP instrumentation.
//!
//! A [`StatsProvider`] reads the kernel's view of one socket into a [`Snapshot`] of named
//! counters. Two providers exist and are picked at runtime:
//!
//! - [`tcpinfo::TcpInfoProvider`] queries `TCP_INFO` directly and exposes the full
//!   counter set.
//! - [`procfs::ProcfsProvider`] scans `/proc/net/tcp{,6}` and only knows queue depths
//!   and connection state.
//!
//! Snapshots taken during a test are folded by [`aggregate::Aggregator`] into the
//! cumulative counters the diagnostic engine works from (RTT sums, congestion signals,
//! limited-time transitions and so on).

pub mod aggregate;
pub mod names;
pub mod procfs;
pub mod tcpinfo;

pub use aggregate::Aggregator;

/// Named counters describing one socket at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    counters: std::collections::BTreeMap<String, i64>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.counters.get(name).copied()
    }

    /// Returns the counter or 0 when the provider does not expose it.
    pub fn get_or_zero(&self, name: &str) -> i64 {
        self.get(name).unwrap_or(0)
    }

    pub fn set(&mut self, name: &str, value: i64) {
        self.counters.insert(name.to_string(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.counters.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Copies every counter of `other` over this snapshot.
    pub fn merge(&mut self, other: &Snapshot) {
        for (name, value) in other.iter() {
            self.set(name, value);
        }
    }
}

impl FromIterator<(String, i64)> for Snapshot {
    fn from_iter<T: IntoIterator<Item = (String, i64)>>(iter: T) -> Self {
        Self {
            counters: iter.into_iter().collect(),
        }
    }
}

/// Source of kernel TCP counters for a connected socket.
pub trait StatsProvider: std::fmt::Debug + Send + Sync {
    /// Short name announced in the version handshake.
    fn name(&self) -> &'static str;

    /// Takes a snapshot of every counter this provider knows about.
    fn snapshot(&self, socket: std::os::fd::BorrowedFd<'_>) -> anyhow::Result<Snapshot>;

    /// Reads a single counter; `None` if the provider does not expose it.
    fn read_counter(
        &self,
        socket: std::os::fd::BorrowedFd<'_>,
        name: &str,
    ) -> anyhow::Result<Option<i64>> {
        Ok(self.snapshot(socket)?.get(name))
    }
}

/// Runtime selection between the available providers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// getsockopt(TCP_INFO)
    #[value(name = "tcpinfo")]
    TcpInfo,
    /// /proc/net/tcp scanning
    Procfs,
}

impl ProviderKind {
    pub fn build(self) -> std::sync::Arc<dyn StatsProvider> {
        match self {
            ProviderKind::TcpInfo => std::sync::Arc::new(tcpinfo::TcpInfoProvider),
            ProviderKind::Procfs => std::sync::Arc::new(procfs::ProcfsProvider),
        }
    }
}
