use std::os::fd::AsRawFd;

use super::names;

/// Decoded subset of the kernel `struct tcp_info`.
///
/// Fields the running kernel does not report (shorter struct) decode as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpInfo {
    pub state: u8,
    pub ca_state: u8,
    pub retransmits: u8,
    pub backoff: u8,
    pub options: u8,
    pub snd_wscale: u8,
    pub rcv_wscale: u8,
    /// microseconds
    pub rto: u32,
    pub snd_mss: u32,
    pub rcv_mss: u32,
    /// segments
    pub unacked: u32,
    pub sacked: u32,
    pub lost: u32,
    /// microseconds
    pub rtt: u32,
    pub rttvar: u32,
    /// segments
    pub snd_ssthresh: u32,
    pub snd_cwnd: u32,
    pub reordering: u32,
    pub total_retrans: u32,
    pub pacing_rate: u64,
    pub bytes_acked: u64,
    pub bytes_received: u64,
    pub segs_out: u32,
    pub segs_in: u32,
    pub notsent_bytes: u32,
    pub min_rtt: u32,
    pub data_segs_in: u32,
    pub data_segs_out: u32,
    pub delivery_rate: u64,
    /// microseconds
    pub busy_time: u64,
    pub rwnd_limited: u64,
    pub sndbuf_limited: u64,
    pub bytes_sent: u64,
    pub bytes_retrans: u64,
    pub dsack_dups: u32,
    pub reord_seen: u32,
    pub snd_wnd: u32,
}

const TCPI_OPT_TIMESTAMPS: u8 = 1;
const TCPI_OPT_SACK: u8 = 2;
const TCPI_OPT_WSCALE: u8 = 4;
const TCPI_OPT_ECN: u8 = 8;
/// Kernel marker for "no slow start threshold yet".
const INFINITE_SSTHRESH: u32 = 0x7fff_ffff;

impl TcpInfo {
    /// Size of the struct on current kernels.
    pub const SIZE: usize = 232;

    pub fn parse(buf: &[u8]) -> Self {
        let u8_at = |off: usize| buf.get(off).copied().unwrap_or(0);
        let u32_at = |off: usize| {
            buf.get(off..off + 4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_ne_bytes)
                .unwrap_or(0)
        };
        let u64_at = |off: usize| {
            buf.get(off..off + 8)
                .and_then(|b| b.try_into().ok())
                .map(u64::from_ne_bytes)
                .unwrap_or(0)
        };
        let wscale = u8_at(6);
        Self {
            state: u8_at(0),
            ca_state: u8_at(1),
            retransmits: u8_at(2),
            backoff: u8_at(4),
            options: u8_at(5),
            snd_wscale: wscale & 0x0f,
            rcv_wscale: wscale >> 4,
            rto: u32_at(8),
            snd_mss: u32_at(16),
            rcv_mss: u32_at(20),
            unacked: u32_at(24),
            sacked: u32_at(28),
            lost: u32_at(32),
            rtt: u32_at(68),
            rttvar: u32_at(72),
            snd_ssthresh: u32_at(76),
            snd_cwnd: u32_at(80),
            reordering: u32_at(88),
            total_retrans: u32_at(100),
            pacing_rate: u64_at(104),
            bytes_acked: u64_at(120),
            bytes_received: u64_at(128),
            segs_out: u32_at(136),
            segs_in: u32_at(140),
            notsent_bytes: u32_at(144),
            min_rtt: u32_at(148),
            data_segs_in: u32_at(152),
            data_segs_out: u32_at(156),
            delivery_rate: u64_at(160),
            busy_time: u64_at(168),
            rwnd_limited: u64_at(176),
            sndbuf_limited: u64_at(184),
            bytes_sent: u64_at(200),
            bytes_retrans: u64_at(208),
            dsack_dups: u32_at(216),
            reord_seen: u32_at(220),
            snd_wnd: u32_at(228),
        }
    }

    /// Fills `snapshot` with the web100-style counters this struct maps to.
    pub fn fill(&self, snapshot: &mut super::Snapshot) {
        let mss = i64::from(self.snd_mss);
        let flag = |bit: u8| i64::from(self.options & bit != 0);
        snapshot.set(names::STATE, i64::from(self.state));
        snapshot.set(names::CA_STATE, i64::from(self.ca_state));
        snapshot.set(names::CUR_MSS, mss);
        snapshot.set(names::RCV_MSS, i64::from(self.rcv_mss));
        snapshot.set(names::SND_WIN_SCALE, i64::from(self.snd_wscale));
        snapshot.set(names::RCV_WIN_SCALE, i64::from(self.rcv_wscale));
        snapshot.set(names::TIMESTAMPS_ENABLED, flag(TCPI_OPT_TIMESTAMPS));
        snapshot.set(names::SACK_ENABLED, flag(TCPI_OPT_SACK));
        snapshot.set(names::WIN_SCALE_ENABLED, flag(TCPI_OPT_WSCALE));
        snapshot.set(names::ECN_ENABLED, flag(TCPI_OPT_ECN));
        // web100 reports times in milliseconds
        snapshot.set(names::CURRENT_RTO, i64::from(self.rto / 1000));
        snapshot.set(names::SAMPLE_RTT, i64::from(self.rtt / 1000));
        snapshot.set(names::RTT_VAR, i64::from(self.rttvar / 1000));
        snapshot.set(names::MIN_RTT, i64::from(self.min_rtt / 1000));
        snapshot.set(names::CUR_CWND, i64::from(self.snd_cwnd) * mss);
        if self.snd_ssthresh < INFINITE_SSTHRESH {
            snapshot.set(names::CUR_SSTHRESH, i64::from(self.snd_ssthresh) * mss);
        }
        snapshot.set(names::CUR_RWIN_RCVD, i64::from(self.snd_wnd));
        snapshot.set(names::BACKOFF, i64::from(self.backoff));
        snapshot.set(names::PKTS_UNACKED, i64::from(self.unacked));
        snapshot.set(names::SACKED, i64::from(self.sacked));
        snapshot.set(names::LOST, i64::from(self.lost));
        snapshot.set(names::REORDERING, i64::from(self.reordering));
        snapshot.set(names::PKTS_RETRANS, i64::from(self.total_retrans));
        snapshot.set(names::PKTS_OUT, i64::from(self.segs_out));
        snapshot.set(names::PKTS_IN, i64::from(self.segs_in));
        snapshot.set(names::DATA_PKTS_OUT, i64::from(self.data_segs_out));
        snapshot.set(names::DATA_PKTS_IN, i64::from(self.data_segs_in));
        snapshot.set(names::DATA_BYTES_OUT, saturating_i64(self.bytes_sent));
        snapshot.set(names::DATA_BYTES_IN, saturating_i64(self.bytes_received));
        snapshot.set(names::BYTES_ACKED, saturating_i64(self.bytes_acked));
        snapshot.set(names::BYTES_RETRANS, saturating_i64(self.bytes_retrans));
        snapshot.set(names::DSACK_DUPS, i64::from(self.dsack_dups));
        snapshot.set(names::REORD_SEEN, i64::from(self.reord_seen));
        snapshot.set(names::PACING_RATE, saturating_i64(self.pacing_rate));
        snapshot.set(names::DELIVERY_RATE, saturating_i64(self.delivery_rate));
        snapshot.set(names::NOTSENT_BYTES, i64::from(self.notsent_bytes));
        snapshot.set(names::BUSY_TIME, saturating_i64(self.busy_time));
        // busy time not attributed to the receiver or the send buffer is cwnd limited
        let cwnd_limited = self
            .busy_time
            .saturating_sub(self.rwnd_limited)
            .saturating_sub(self.sndbuf_limited);
        snapshot.set(names::SND_LIM_TIME_RWIN, saturating_i64(self.rwnd_limited));
        snapshot.set(names::SND_LIM_TIME_CWND, saturating_i64(cwnd_limited));
        snapshot.set(names::SND_LIM_TIME_SENDER, saturating_i64(self.sndbuf_limited));
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn read_tcp_info(fd: std::os::fd::BorrowedFd<'_>) -> std::io::Result<TcpInfo> {
    let mut buf = [0u8; TcpInfo::SIZE];
    let mut len = buf.len() as libc::socklen_t;
    // SAFETY: buf is valid for len bytes for the duration of the call
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            buf.as_mut_ptr().cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let len = (len as usize).min(buf.len());
    Ok(TcpInfo::parse(&buf[..len]))
}

fn int_sockopt(
    fd: std::os::fd::BorrowedFd<'_>,
    level: libc::c_int,
    name: libc::c_int,
) -> std::io::Result<i64> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: value is a valid c_int and len matches its size
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            level,
            name,
            (&mut value as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(i64::from(value))
}

/// Bytes sitting in the socket send queue (unsent + unacknowledged).
pub fn send_queue_bytes(fd: std::os::fd::BorrowedFd<'_>) -> std::io::Result<i64> {
    let mut value: libc::c_int = 0;
    // SAFETY: TIOCOUTQ writes a single c_int into value
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCOUTQ, &mut value as *mut libc::c_int) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(i64::from(value))
}

/// Reads counters with `getsockopt(TCP_INFO)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpInfoProvider;

impl super::StatsProvider for TcpInfoProvider {
    fn name(&self) -> &'static str {
        "tcpinfo"
    }

    fn snapshot(&self, socket: std::os::fd::BorrowedFd<'_>) -> anyhow::Result<super::Snapshot> {
        use anyhow::Context;
        let info = read_tcp_info(socket).context("getsockopt(TCP_INFO) failed")?;
        let mut snapshot = super::Snapshot::new();
        info.fill(&mut snapshot);
        snapshot.set(
            names::SNDBUF,
            int_sockopt(socket, libc::SOL_SOCKET, libc::SO_SNDBUF)
                .context("getsockopt(SO_SNDBUF) failed")?,
        );
        snapshot.set(
            names::RCVBUF,
            int_sockopt(socket, libc::SOL_SOCKET, libc::SO_RCVBUF)
                .context("getsockopt(SO_RCVBUF) failed")?,
        );
        snapshot.set(
            names::SEND_QUEUE,
            send_queue_bytes(socket).context("ioctl(TIOCOUTQ) failed")?,
        );
        Ok(snapshot)
    }
}
