use anyhow::Context;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;

use super::names;

fn socket_inode(fd: std::os::fd::BorrowedFd<'_>) -> anyhow::Result<u64> {
    let link = format!("/proc/self/fd/{}", fd.as_raw_fd());
    let md = std::fs::metadata(&link).with_context(|| format!("cannot stat {link}"))?;
    Ok(md.ino())
}

fn state_code(state: &procfs::net::TcpState) -> i64 {
    use procfs::net::TcpState;
    match state {
        TcpState::Established => 1,
        TcpState::SynSent => 2,
        TcpState::SynRecv => 3,
        TcpState::FinWait1 => 4,
        TcpState::FinWait2 => 5,
        TcpState::TimeWait => 6,
        TcpState::Close => 7,
        TcpState::CloseWait => 8,
        TcpState::LastAck => 9,
        TcpState::Listen => 10,
        _ => 0,
    }
}

/// Reads the coarse per-socket view from `/proc/net/tcp` and `/proc/net/tcp6`.
///
/// Only state and queue depths are available here, so most heuristics see zeros.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsProvider;

impl super::StatsProvider for ProcfsProvider {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn snapshot(&self, socket: std::os::fd::BorrowedFd<'_>) -> anyhow::Result<super::Snapshot> {
        let inode = socket_inode(socket)?;
        let mut entries = procfs::net::tcp().context("failed to read /proc/net/tcp")?;
        // tcp6 is missing when ipv6 is disabled
        if let Ok(v6) = procfs::net::tcp6() {
            entries.extend(v6);
        }
        let entry = entries
            .into_iter()
            .find(|entry| entry.inode == inode)
            .with_context(|| format!("socket inode {inode} not found in /proc/net/tcp"))?;
        let mut snapshot = super::Snapshot::new();
        snapshot.set(names::STATE, state_code(&entry.state));
        snapshot.set(names::SEND_QUEUE, i64::from(entry.tx_queue));
        snapshot.set(names::RECV_QUEUE, i64::from(entry.rx_queue));
        Ok(snapshot)
    }
}
