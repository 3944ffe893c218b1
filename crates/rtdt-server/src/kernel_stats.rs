//! Kernel UDP socket statistics.
//!
//! On Linux the queue sizes and drop count of a bound socket are read from
//! `/proc/net/udp` (or `udp6`) by matching the socket inode. Elsewhere a null
//! tracker reports zeros.

use crate::error::ServerError;
use tokio::net::UdpSocket;

/// Kernel queue sizes and drops of one UDP socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpProcStats {
    /// Bytes waiting in the transmit queue
    pub tx_queue: u64,
    /// Bytes waiting in the receive queue
    pub rx_queue: u64,
    /// Datagrams dropped by the kernel
    pub drops: u64,
}

/// Source of kernel statistics for one socket.
pub trait KernelStatsTracker: Send + Sync {
    /// Current statistics.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::KernelStats` if the statistics cannot be read.
    fn stats(&self) -> Result<UdpProcStats, ServerError>;
}

/// Tracker that always reports zeros.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullKernelStatsTracker;

impl KernelStatsTracker for NullKernelStatsTracker {
    fn stats(&self) -> Result<UdpProcStats, ServerError> {
        Ok(UdpProcStats::default())
    }
}

/// Tracker for `socket`, falling back to the null tracker when kernel
/// statistics are unavailable.
pub(crate) fn tracker_for(socket: &UdpSocket, ignore: bool) -> Box<dyn KernelStatsTracker> {
    if ignore {
        return Box::new(NullKernelStatsTracker);
    }

    #[cfg(target_os = "linux")]
    {
        match linux::ProcNetTracker::new(socket) {
            Ok(tracker) => return Box::new(tracker),
            Err(e) => tracing::warn!("Kernel stats unavailable: {e}"),
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = socket;

    Box::new(NullKernelStatsTracker)
}

/// Find the row for `inode` in the contents of `/proc/net/udp{,6}`.
pub(crate) fn parse_proc_net_udp(contents: &str, inode: u64) -> Result<UdpProcStats, ServerError> {
    for line in contents.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() != 13 {
            continue;
        }
        let Ok(row_inode) = cols[9].parse::<u64>() else {
            continue;
        };
        if row_inode != inode {
            continue;
        }

        let (tx, rx) = cols[4]
            .split_once(':')
            .ok_or_else(|| ServerError::KernelStats("tx:rx column not correctly split".into()))?;
        let tx_queue = u64::from_str_radix(tx, 16)
            .map_err(|e| ServerError::KernelStats(format!("tx not a number: {e}").into()))?;
        let rx_queue = u64::from_str_radix(rx, 16)
            .map_err(|e| ServerError::KernelStats(format!("rx not a number: {e}").into()))?;
        let drops = cols[12]
            .parse::<u64>()
            .map_err(|e| ServerError::KernelStats(format!("drops not a number: {e}").into()))?;

        return Ok(UdpProcStats {
            tx_queue,
            rx_queue,
            drops,
        });
    }

    Err(ServerError::KernelStats(
        format!("could not find stats for target inode {inode}").into(),
    ))
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{KernelStatsTracker, UdpProcStats, parse_proc_net_udp};
    use crate::error::ServerError;
    use std::os::fd::AsRawFd;
    use tokio::net::UdpSocket;

    pub(super) struct ProcNetTracker {
        inode: u64,
        is_v6: bool,
    }

    impl ProcNetTracker {
        pub(super) fn new(socket: &UdpSocket) -> Result<Self, ServerError> {
            let is_v6 = socket.local_addr()?.is_ipv6();
            let link = std::fs::read_link(format!("/proc/self/fd/{}", socket.as_raw_fd()))?;
            let link = link.to_string_lossy();
            let inode = link
                .strip_prefix("socket:[")
                .and_then(|s| s.strip_suffix(']'))
                .ok_or_else(|| {
                    ServerError::KernelStats(format!("fd does not link to a socket: {link}").into())
                })?
                .parse::<u64>()
                .map_err(|e| {
                    ServerError::KernelStats(format!("unable to decode inode: {e}").into())
                })?;

            let tracker = Self { inode, is_v6 };
            tracker.stats()?;
            Ok(tracker)
        }
    }

    impl KernelStatsTracker for ProcNetTracker {
        fn stats(&self) -> Result<UdpProcStats, ServerError> {
            let path = if self.is_v6 {
                "/proc/net/udp6"
            } else {
                "/proc/net/udp"
            };
            let contents = std::fs::read_to_string(path)?;
            parse_proc_net_udp(&contents, self.inode)
        }
    }
}
