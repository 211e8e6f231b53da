use anyhow::{Context, anyhow};
use std::os::fd::AsRawFd;

/// Set of ports the data listeners may bind to.
#[derive(Debug, Clone)]
pub struct PortRanges {
    ranges: Vec<std::ops::RangeInclusive<u16>>,
}

impl PortRanges {
    /// Parse port ranges from a string like "8000-8999,10000-10999"
    pub fn parse(ranges_str: &str) -> anyhow::Result<Self> {
        let mut ranges = Vec::new();
        for range_str in ranges_str.split(',') {
            let range_str = range_str.trim();
            if range_str.is_empty() {
                continue;
            }
            if let Some((start_str, end_str)) = range_str.split_once('-') {
                let start: u16 = start_str
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid start port in range: {start_str}"))?;
                let end: u16 = end_str
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid end port in range: {end_str}"))?;
                if start > end {
                    return Err(anyhow!(
                        "Invalid port range: start port {start} > end port {end}"
                    ));
                }
                if start == 0 {
                    return Err(anyhow!("Port 0 is not allowed in ranges"));
                }
                ranges.push(start..=end);
            } else {
                let port: u16 = range_str
                    .parse()
                    .with_context(|| format!("Invalid port: {range_str}"))?;
                if port == 0 {
                    return Err(anyhow!("Port 0 is not allowed"));
                }
                ranges.push(port..=port);
            }
        }
        if ranges.is_empty() {
            return Err(anyhow!("No valid port ranges found"));
        }
        Ok(PortRanges { ranges })
    }

    /// All ports in the ranges, in declaration order.
    pub fn ports(&self) -> Vec<u16> {
        let mut all_ports: Vec<u16> = Vec::new();
        for range in &self.ranges {
            all_ports.extend(range.clone());
        }
        all_ports
    }

    /// Try to bind a TCP listener on a port within the ranges.
    ///
    /// Ports are tried starting from a random offset so that concurrent sessions do not
    /// all collide on the first free port.
    pub async fn bind_tcp_listener(
        &self,
        ip: std::net::IpAddr,
        mss: Option<u32>,
    ) -> anyhow::Result<tokio::net::TcpListener> {
        use std::time::{Duration, Instant};
        let mut all_ports = self.ports();
        if !all_ports.is_empty() {
            let offset = (rand::random::<u64>() % all_ports.len() as u64) as usize;
            all_ports.rotate_left(offset);
        }
        let start_time = Instant::now();
        // allow overriding the timeout via environment variable
        let max_duration_secs = match std::env::var("NDT_TCP_BIND_MAX_DURATION_SECONDS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            Some(x) => {
                tracing::debug!(
                    "Using custom TCP bind timeout: {x}s (from NDT_TCP_BIND_MAX_DURATION_SECONDS)",
                );
                x
            }
            None => 5,
        };
        let max_duration = Duration::from_secs(max_duration_secs);
        let mut attempts = 0;
        let mut last_error = None;
        for port in all_ports {
            if start_time.elapsed() > max_duration {
                tracing::warn!(
                    "Port binding timeout after {} attempts in {:?}",
                    attempts,
                    start_time.elapsed()
                );
                break;
            }
            attempts += 1;
            let addr = std::net::SocketAddr::new(ip, port);
            match bind_listener(addr, mss) {
                Ok(listener) => {
                    tracing::info!(
                        "Bound data listener to {}:{} after {} attempts",
                        ip,
                        port,
                        attempts
                    );
                    return Ok(listener);
                }
                Err(e) => {
                    tracing::debug!("Failed to bind TCP to {}:{}: {:#}", ip, port, e);
                    let is_addr_in_use = e
                        .downcast_ref::<std::io::Error>()
                        .is_some_and(|e| e.kind() == std::io::ErrorKind::AddrInUse);
                    last_error = Some(e);
                    if is_addr_in_use && attempts % 10 == 0 {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                }
            }
        }
        Err(anyhow!(
            "Failed to bind TCP to any port in the specified ranges after {} attempts in {:?}: {}",
            attempts,
            start_time.elapsed(),
            last_error
                .map(|e| format!("{e:#}"))
                .unwrap_or_else(|| "no ports available".to_string())
        ))
    }
}

fn set_max_segment(socket: &socket2::Socket, mss: u32) -> std::io::Result<()> {
    let value = libc::c_int::try_from(mss)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    // SAFETY: the fd is owned by `socket` and valid for the duration of the call; the
    // option value points to a live c_int of the advertised length.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_MAXSEG,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Binds a non-blocking TCP listener on `addr`, optionally clamping the MSS of accepted
/// connections.
///
/// Must be called from within a tokio runtime.
pub fn bind_listener(
    addr: std::net::SocketAddr,
    mss: Option<u32>,
) -> anyhow::Result<tokio::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .context("failed to create TCP socket")?;
    socket
        .set_reuse_address(true)
        .context("failed to set SO_REUSEADDR")?;
    if let Some(mss) = mss {
        set_max_segment(&socket, mss)
            .with_context(|| format!("failed to set TCP_MAXSEG to {mss}"))?;
    }
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind {addr}"))?;
    socket
        .listen(1024)
        .with_context(|| format!("failed to listen on {addr}"))?;
    socket
        .set_nonblocking(true)
        .context("failed to make listener non-blocking")?;
    let std_listener = std::net::TcpListener::from(socket);
    let listener = tokio::net::TcpListener::from_std(std_listener)
        .context("failed to register listener with the runtime")?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_port() {
        let ranges = PortRanges::parse("8080").unwrap();
        assert_eq!(ranges.ranges.len(), 1);
        assert_eq!(ranges.ranges[0], 8080..=8080);
    }

    #[test]
    fn test_parse_range() {
        let ranges = PortRanges::parse("8000-8999").unwrap();
        assert_eq!(ranges.ranges.len(), 1);
        assert_eq!(ranges.ranges[0], 8000..=8999);
    }

    #[test]
    fn test_parse_multiple_ranges() {
        let ranges = PortRanges::parse("8000-8999,10000-10999,12345").unwrap();
        assert_eq!(ranges.ranges.len(), 3);
        assert_eq!(ranges.ranges[0], 8000..=8999);
        assert_eq!(ranges.ranges[1], 10000..=10999);
        assert_eq!(ranges.ranges[2], 12345..=12345);
    }

    #[test]
    fn test_parse_top_port() {
        let ranges = PortRanges::parse("65534-65535").unwrap();
        assert_eq!(ranges.ports(), vec![65534, 65535]);
    }

    #[test]
    fn test_parse_invalid_range() {
        assert!(PortRanges::parse("9000-8000").is_err()); // start > end
        assert!(PortRanges::parse("0-100").is_err()); // port 0 not allowed
        assert!(PortRanges::parse("abc").is_err()); // non-numeric
        assert!(PortRanges::parse("").is_err()); // empty
    }

    #[tokio::test]
    async fn binds_within_range() -> anyhow::Result<()> {
        let probe = bind_listener("127.0.0.1:0".parse()?, None)?;
        let port = probe.local_addr()?.port();
        drop(probe);
        let ranges = PortRanges::parse(&port.to_string())?;
        let listener = ranges
            .bind_tcp_listener(std::net::IpAddr::from([127, 0, 0, 1]), Some(1456))
            .await?;
        assert_eq!(listener.local_addr()?.port(), port);
        Ok(())
    }

    #[tokio::test]
    async fn occupied_ranges_fail() -> anyhow::Result<()> {
        let taken = std::net::TcpListener::bind("127.0.0.1:0")?;
        let port = taken.local_addr()?.port();
        let ranges = PortRanges::parse(&port.to_string())?;
        let res = ranges
            .bind_tcp_listener(std::net::IpAddr::from([127, 0, 0, 1]), None)
            .await;
        assert!(res.is_err());
        Ok(())
    }
}
