//! UDP listeners: socket setup, handshake, the read path and the stale
//! connection sweep.
//!
//! Each listener owns one socket and the connections seen on it. Read tasks
//! share the socket; handshakes for unknown addresses are handed to a single
//! handshake task through a small bounded queue so a flood of handshake
//! attempts cannot stall relaying for established connections.

use crate::conn::Conn;
use crate::error::{Result, ServerError};
use crate::kernel_stats::{KernelStatsTracker, UdpProcStats};
use crate::server::ServerInner;
use crate::session::DestPeer;
use crate::stats::{Counter, Gauge, ListenerStats};
use dashmap::DashMap;
use rtdt_core::{FramedPktBuf, MAX_MESSAGE_SIZE};
use rtdt_crypto::SEAL_OVERHEAD;
use rtdt_crypto::kem::CIPHERTEXT_SIZE;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Handshake messages waiting for the handshake task.
const HANDSHAKE_QUEUE_SIZE: usize = 5;

/// Socket buffers smaller than this are likely to drop bursts.
const MIN_KERNEL_BUFFER_SIZE: usize = 1024 * 1024; // 1 MB

/// Interval of the kernel stats poll.
const KERNEL_STATS_INTERVAL: Duration = Duration::from_secs(5);

/// First datagram from an unknown address.
pub(crate) struct HandshakeMsg {
    data: Vec<u8>,
    addr: SocketAddr,
    recv_time: Instant,
}

/// One bound UDP socket and its connections.
pub(crate) struct Listener {
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) local_addr: SocketAddr,
    pub(crate) conns: DashMap<SocketAddr, Arc<Conn>>,

    pub(crate) conns_count: Gauge,
    pub(crate) pending_count: Gauge,
    pub(crate) handshake_stall: Counter,
    pub(crate) decrypt_fails: Counter,
    pub(crate) skipped_seq: Counter,

    kernel_tracker: Box<dyn KernelStatsTracker>,
    kernel_stats: Mutex<UdpProcStats>,

    handshake_tx: mpsc::Sender<HandshakeMsg>,
    handshake_rx: Mutex<Option<mpsc::Receiver<HandshakeMsg>>>,
}

/// Bind a UDP socket with the requested kernel buffer sizes.
pub(crate) fn bind_socket(addr: SocketAddr, buffer_size: usize) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    // Kernels may clamp these; a failure here is not fatal
    if let Err(e) = socket.set_recv_buffer_size(buffer_size) {
        warn!("Unable to set receive buffer size on {addr}: {e}");
    }
    if let Err(e) = socket.set_send_buffer_size(buffer_size) {
        warn!("Unable to set send buffer size on {addr}: {e}");
    }

    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    match socket.recv_buffer_size() {
        Ok(size) if size < MIN_KERNEL_BUFFER_SIZE => warn!(
            "Kernel receive buffer for {addr} is only {size} bytes; raise \
             net.core.rmem_max to avoid drops"
        ),
        Ok(_) => {}
        Err(e) => debug!("Unable to read receive buffer size for {addr}: {e}"),
    }
    match socket.send_buffer_size() {
        Ok(size) if size < MIN_KERNEL_BUFFER_SIZE => warn!(
            "Kernel send buffer for {addr} is only {size} bytes; raise \
             net.core.wmem_max to avoid drops"
        ),
        Ok(_) => {}
        Err(e) => debug!("Unable to read send buffer size for {addr}: {e}"),
    }

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

impl Listener {
    /// Wrap a bound socket.
    pub(crate) fn new(socket: UdpSocket, ignore_kernel_stats: bool) -> Result<Self> {
        let local_addr = socket.local_addr()?;
        let kernel_tracker = crate::kernel_stats::tracker_for(&socket, ignore_kernel_stats);
        let (handshake_tx, handshake_rx) = mpsc::channel(HANDSHAKE_QUEUE_SIZE);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            conns: DashMap::new(),
            conns_count: Gauge::default(),
            pending_count: Gauge::default(),
            handshake_stall: Counter::default(),
            decrypt_fails: Counter::default(),
            skipped_seq: Counter::default(),
            kernel_tracker,
            kernel_stats: Mutex::new(UdpProcStats::default()),
            handshake_tx,
            handshake_rx: Mutex::new(Some(handshake_rx)),
        })
    }

    fn take_handshake_rx(&self) -> Option<mpsc::Receiver<HandshakeMsg>> {
        self.handshake_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn kernel_stats(&self) -> UdpProcStats {
        *self.kernel_stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn stats(&self) -> ListenerStats {
        ListenerStats {
            addr: self.local_addr,
            conns: self.conns_count.get(),
            pending_conns: self.pending_count.get(),
            handshake_stalls: self.handshake_stall.get(),
            decrypt_fails: self.decrypt_fails.get(),
            skipped_seq: self.skipped_seq.get(),
            kernel: self.kernel_stats(),
        }
    }
}

/// A datagram that passed connection lookup and decryption.
struct Inbound {
    conn: Arc<Conn>,
    /// Plaintext length
    n: usize,
    recv_time: Instant,
}

impl ServerInner {
    /// Send `msg` to `conn`, sealing it when the connection is encrypted.
    pub(crate) async fn write_to(&self, conn: &Conn, msg: &[u8], scratch: &mut Vec<u8>) -> Result<usize> {
        let n = match &conn.session_key {
            None => conn.socket.send_to(msg, conn.addr).await?,
            Some(key) => {
                if msg.len() > MAX_MESSAGE_SIZE - SEAL_OVERHEAD {
                    return Err(ServerError::MessageTooLarge(msg.len()));
                }
                key.seal_into(msg, &[], scratch)?;
                conn.socket.send_to(scratch, conn.addr).await?
            }
        };

        self.stats.bytes_written.add(n as u64);
        self.stats.pkts_written.inc();
        Ok(n)
    }

    /// Drive the handshake for addresses without a connection.
    ///
    /// The first valid KEM ciphertext from an address creates a pending
    /// connection; the ciphertext, sealed under the derived key, is echoed
    /// back as proof that the server holds the private key.
    pub(crate) async fn handshake_loop(&self, l: Arc<Listener>, shutdown: CancellationToken) -> Result<()> {
        let Some(private_key) = self.cfg.private_key.clone() else {
            debug!("Encryption disabled, no handshake loop for {}", l.local_addr);
            return Ok(());
        };
        let Some(mut rx) = l.take_handshake_rx() else {
            return Err(ServerError::AlreadyRunning);
        };
        let mut scratch = Vec::with_capacity(MAX_MESSAGE_SIZE);

        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => return Ok(()),
                },
            };

            let existing = l.conns.get(&msg.addr).map(|c| c.clone());
            let conn = match existing {
                Some(conn) => conn,
                None => {
                    let ciphertext = &msg.data[..CIPHERTEXT_SIZE];
                    let key = match private_key.decapsulate(ciphertext) {
                        Ok(key) => key,
                        Err(e) => {
                            debug!("Failed to decrypt session key from {}: {e}", msg.addr);
                            continue;
                        }
                    };
                    let ciphertext: Arc<[u8]> = Arc::from(ciphertext);
                    l.conns
                        .entry(msg.addr)
                        .or_insert_with(|| {
                            l.pending_count.inc();
                            debug!("Decrypted session key from {}", msg.addr);
                            Arc::new(Conn::pending(
                                msg.addr,
                                l.socket.clone(),
                                key,
                                ciphertext,
                                msg.recv_time,
                            ))
                        })
                        .clone()
                }
            };

            let Some(ciphertext) = conn.pending_ciphertext() else {
                continue;
            };
            if *ciphertext != *msg.data {
                warn!(
                    "Remote client sent data before handshake completed {}",
                    conn.addr
                );
                continue;
            }

            debug!("Echoing encrypted session key back to {}", conn.addr);
            if let Err(e) = self.write_to(&conn, &ciphertext, &mut scratch).await {
                warn!("Unable to send handshake reply to {}: {e}", conn.addr);
            }
        }
    }

    /// Find the connection for a datagram.
    ///
    /// Returns `None` when the datagram was consumed (queued for handshake or
    /// dropped). The second value is the handshake ciphertext to resend when
    /// a pending connection repeated its handshake.
    fn read_conn(
        &self,
        l: &Listener,
        input: &[u8],
        addr: SocketAddr,
        recv_time: Instant,
    ) -> Option<(Arc<Conn>, Option<Arc<[u8]>>)> {
        let existing = l.conns.get(&addr).map(|c| c.clone());
        if let Some(conn) = existing {
            let Some(ciphertext) = conn.pending_ciphertext() else {
                return Some((conn, None));
            };

            if *ciphertext != *input {
                if conn.complete_handshake() {
                    l.pending_count.dec();
                    l.conns_count.inc();
                    debug!("Completed handshake with {addr}");
                }
                return Some((conn, None));
            }

            debug!("Resending ciphertext to {addr} due to received copy");
            // Bounds how many times a client can make us resend
            conn.add_ban_score(1);
            return Some((conn, Some(ciphertext)));
        }

        if !self.cfg.encrypted() {
            let conn = l
                .conns
                .entry(addr)
                .or_insert_with(|| {
                    l.conns_count.inc();
                    debug!("New unencrypted conn to {addr}");
                    Arc::new(Conn::unencrypted(addr, l.socket.clone(), recv_time))
                })
                .clone();
            return Some((conn, None));
        }

        if input.len() < CIPHERTEXT_SIZE {
            debug!("Received too few bytes in new conn from {addr}");
            return None;
        }

        let msg = HandshakeMsg {
            data: input.to_vec(),
            addr,
            recv_time,
        };
        if l.handshake_tx.try_send(msg).is_err() {
            warn!("Dropping unsessioned msg from {addr} due to stall");
            l.handshake_stall.inc();
        }
        None
    }

    /// Read until a datagram yields a decrypted framed packet in `pkt`.
    async fn read_next(
        &self,
        l: &Listener,
        raw: &mut [u8],
        pkt: &mut FramedPktBuf,
        scratch: &mut Vec<u8>,
    ) -> Result<Inbound> {
        loop {
            let (n, addr) = l.socket.recv_from(raw).await?;
            let recv_time = Instant::now();
            self.stats.bytes_read.add(n as u64);
            self.stats.pkts_read.inc();

            let input = &raw[..n];
            let Some((conn, resend)) = self.read_conn(l, input, addr, recv_time) else {
                continue;
            };

            if let Some(ciphertext) = resend {
                conn.last_read.store(recv_time);
                if let Err(e) = self.write_to(&conn, &ciphertext, scratch).await {
                    warn!("Unable to resend handshake reply to {addr}: {e}");
                }
                continue;
            }

            let opened = match &conn.session_key {
                None => {
                    if pkt.set_full_data(input).is_err() {
                        continue;
                    }
                    conn.last_read.store(recv_time);
                    return Ok(Inbound { conn, n, recv_time });
                }
                Some(_) if n < SEAL_OVERHEAD => continue,
                Some(key) => pkt.decrypt_from(input, key),
            };

            if opened.is_err() {
                l.decrypt_fails.inc();
                conn.add_ban_score(1);
                continue;
            }

            conn.last_read.store(recv_time);
            return Ok(Inbound {
                conn,
                n: n - SEAL_OVERHEAD,
                recv_time,
            });
        }
    }

    /// Relay loop. Several may run per listener.
    pub(crate) async fn read_loop(&self, l: Arc<Listener>, shutdown: CancellationToken) -> Result<()> {
        let mut raw = vec![0u8; MAX_MESSAGE_SIZE];
        let mut pkt = FramedPktBuf::new();
        let mut scratch = Vec::with_capacity(MAX_MESSAGE_SIZE);
        let mut dests = Vec::new();

        loop {
            let inbound = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                inbound = self.read_next(&l, &mut raw, &mut pkt, &mut scratch) => inbound?,
            };
            self.handle_packet(&l, inbound, &mut pkt, &mut scratch, &mut dests)
                .await;
        }
    }

    async fn handle_packet(
        &self,
        l: &Listener,
        inbound: Inbound,
        pkt: &mut FramedPktBuf,
        scratch: &mut Vec<u8>,
        dests: &mut Vec<DestPeer>,
    ) {
        let Inbound { conn, n, recv_time } = inbound;

        if !pkt.has_valid_size() {
            conn.add_ban_score(1);
            return;
        }
        if !conn.recv_seq.may_accept(pkt.sequence()) {
            l.skipped_seq.inc();
            debug!(
                "Ignoring packet from {} with unacceptable seq number {}",
                conn.addr,
                pkt.sequence()
            );
            return;
        }

        let source = pkt.source();
        if source != pkt.target() {
            if let Err(e) = self.handle_internal_cmd(&conn, pkt, recv_time, scratch).await {
                conn.add_ban_score(1);
                if self.cfg.log_read_loop_errors {
                    warn!(
                        "Error processing internal cmd from {}: {e} (ban score {})",
                        conn.addr,
                        conn.ban_score()
                    );
                }
            }
            return;
        }

        let Some(src_ps) = conn.sessions.get(&source).map(|e| e.value().clone()) else {
            if self.cfg.log_read_loop_errors {
                warn!(
                    "Peer {} sent data as {source} when not bound to a session",
                    conn.addr
                );
            }
            conn.add_ban_score(1);
            return;
        };

        if !src_ps.deduct_allowance(i64::try_from(n).unwrap_or(i64::MAX)) {
            if self.cfg.log_read_loop_errors {
                warn!("Peer {source} trying to send data when allowance was already depleted");
            }
            self.stats.no_allowance_bytes.add(n as u64);
            conn.add_ban_score(1);
            return;
        }

        dests.clear();
        src_ps.session.dest_peers(dests);
        if dests.len() > src_ps.size {
            dests.truncate(src_ps.size);
            if self.cfg.log_read_loop_errors {
                warn!(
                    "Reducing number of write peers from conn {} as {source} to {}",
                    conn.addr, src_ps.size
                );
            }
            conn.add_ban_score(1);
        }

        for dest in dests.drain(..) {
            if Arc::ptr_eq(&dest.conn, &conn) {
                continue;
            }
            pkt.set_target(dest.peer_id);
            pkt.set_sequence(dest.conn.next_send_seq());
            if let Err(e) = self.write_to(&dest.conn, pkt.as_bytes(), scratch).await {
                if self.cfg.log_read_loop_errors {
                    warn!("Unable to write {} bytes to {}: {e}", pkt.len(), dest.conn.addr);
                }
            }
        }

        self.stats.fwd_delay.observe(recv_time.elapsed());
    }

    /// Drop connections that went silent or misbehaved.
    pub(crate) async fn timeout_loop(&self, l: Arc<Listener>, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.cfg.timeout_tick());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            trace!("Timeout stale conns tick on {}", l.local_addr);
            self.sweep_stale_conns(&l, Instant::now());
        }
    }

    /// Remove connections silent for longer than the maximum ping interval
    /// or at the maximum ban score. Returns how many were removed.
    pub(crate) fn sweep_stale_conns(&self, l: &Listener, now: Instant) -> usize {
        let stale: Vec<(SocketAddr, ServerError)> = l
            .conns
            .iter()
            .filter_map(|e| {
                let conn = e.value();
                let last_read = conn.last_read.load().unwrap_or(now);
                if now.saturating_duration_since(last_read) > self.cfg.max_ping_interval {
                    Some((*e.key(), ServerError::ConnTimedOut))
                } else if conn.ban_score() >= self.cfg.max_ban_score {
                    Some((*e.key(), ServerError::BanScoreReached))
                } else {
                    None
                }
            })
            .collect();

        let mut removed = 0;
        for (addr, reason) in stale {
            let Some((_, conn)) = l.conns.remove(&addr) else {
                continue;
            };
            let was_pending = conn.complete_handshake();
            info!(
                "Removing {}{addr} from all sessions (reason: {reason})",
                if was_pending { "pending " } else { "" }
            );

            self.remove_from_all_sessions(&conn);
            if was_pending {
                l.pending_count.dec();
            } else {
                l.conns_count.dec();
            }
            removed += 1;
        }
        removed
    }

    /// Poll kernel socket statistics and log changes.
    pub(crate) async fn kernel_stats_loop(&self, l: Arc<Listener>, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(KERNEL_STATS_INTERVAL);
        let mut prev = UdpProcStats::default();
        let (mut prev_conns, mut prev_pending) = (0, 0);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            match l.kernel_tracker.stats() {
                Ok(stats) => {
                    *l.kernel_stats.lock().unwrap_or_else(PoisonError::into_inner) = stats;
                    if stats != prev {
                        info!(
                            "{} kernel stats: Queues RX {} TX {}, Drops {}",
                            l.local_addr, stats.rx_queue, stats.tx_queue, stats.drops
                        );
                    }
                    prev = stats;
                }
                Err(e) => debug!("Unable to read kernel stats for {}: {e}", l.local_addr),
            }

            let (conns, pending) = (l.conns_count.get(), l.pending_count.get());
            if conns != prev_conns || pending != prev_pending {
                info!(
                    "{} connections: {conns}, pending conns: {pending}",
                    l.local_addr
                );
            }
            (prev_conns, prev_pending) = (conns, pending);
        }
    }
}
