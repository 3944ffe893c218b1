//! Relay server: shared state and the task supervisor.

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::listener::{Listener, bind_socket};
use crate::payment::PaymentLedger;
use crate::session::{MembersListing, Session, Sessions};
use crate::stats::{Stats, StatsSnapshot, traffic_report};
use rand::rngs::OsRng;
use rtdt_core::{FramedPktBuf, MAX_MESSAGE_SIZE, PeerId, ServerCmdType};
use rtdt_crypto::hash::SessionHasher;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pending forced listings before new requests are dropped.
const FORCE_LISTING_QUEUE_SIZE: usize = 100;

/// Delay before a forced listing so that the reply that triggered it goes
/// out first.
const FORCE_LISTING_DELAY: Duration = Duration::from_micros(500);

/// State shared by every server task.
pub(crate) struct ServerInner {
    pub(crate) cfg: ServerConfig,
    pub(crate) hasher: SessionHasher,
    pub(crate) stats: Stats,
    pub(crate) sessions: Sessions,
    pub(crate) ledger: PaymentLedger,
    pub(crate) listeners: Vec<Arc<Listener>>,
    force_listing_tx: mpsc::Sender<Arc<Session>>,
}

impl ServerInner {
    fn new(
        cfg: ServerConfig,
        listeners: Vec<Arc<Listener>>,
    ) -> (Self, mpsc::Receiver<Arc<Session>>) {
        let (force_listing_tx, force_listing_rx) = mpsc::channel(FORCE_LISTING_QUEUE_SIZE);
        let inner = Self {
            cfg,
            hasher: SessionHasher::generate(&mut OsRng),
            stats: Stats::new(),
            sessions: Sessions::new(),
            ledger: PaymentLedger::new(),
            listeners,
            force_listing_tx,
        };
        (inner, force_listing_rx)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(cfg: ServerConfig) -> (Self, mpsc::Receiver<Arc<Session>>) {
        Self::new(cfg, Vec::new())
    }

    /// Ask the listing task to send `sess` its membership out of band.
    pub(crate) fn force_listing(&self, sess: Arc<Session>) {
        if self.force_listing_tx.try_send(sess).is_err() {
            debug!("Forced listing queue full, relying on periodic listing");
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_read: self.stats.bytes_read.get(),
            pkts_read: self.stats.pkts_read.get(),
            bytes_written: self.stats.bytes_written.get(),
            pkts_written: self.stats.pkts_written.get(),
            no_allowance_bytes: self.stats.no_allowance_bytes.get(),
            sessions: self.stats.sessions.get(),
            peers: self.stats.peers.get(),
            fwd_delay: self.stats.fwd_delay.snapshot(),
            listeners: self.listeners.iter().map(|l| l.stats()).collect(),
        }
    }

    /// Send a membership listing to every member it names.
    pub(crate) async fn send_listing(
        &self,
        listing: MembersListing,
        pkt: &mut FramedPktBuf,
        scratch: &mut Vec<u8>,
    ) {
        if let Err(e) = pkt.set_cmd_payload(ServerCmdType::MembersBitmap, &listing.bitmap) {
            debug!("Skipping members listing of session {}: {e}", listing.sid);
            return;
        }
        pkt.set_source(PeerId::SERVER);

        for dest in &listing.dests {
            pkt.set_target(dest.peer_id);
            pkt.set_sequence(dest.conn.next_send_seq());
            if let Err(e) = self.write_to(&dest.conn, pkt.as_bytes(), scratch).await {
                warn!(
                    "Unable to write session {} listing to {}: {e}",
                    listing.sid, dest.conn.addr
                );
            }
        }
        debug!(
            "Finished sending listing for session {} for {} peers",
            listing.sid,
            listing.dests.len()
        );
    }

    /// Periodic and forced membership listings.
    async fn listing_loop(
        &self,
        mut force_rx: mpsc::Receiver<Arc<Session>>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let interval = self.cfg.session_listing_interval;
        // The extra millisecond keeps every session due on each tick
        let period = interval + Duration::from_millis(1);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut pkt = FramedPktBuf::new();
        let mut scratch = Vec::with_capacity(MAX_MESSAGE_SIZE);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),

                Some(sess) = force_rx.recv() => {
                    if self.cfg.disable_force_listing {
                        warn!(
                            "Skipping force send members list of session {} due to server config",
                            sess.id()
                        );
                        continue;
                    }

                    tokio::time::sleep(FORCE_LISTING_DELAY).await;
                    let min_interval = self.cfg.min_session_listing_interval;
                    match sess.listing_if_due(Instant::now(), min_interval) {
                        Some(listing) => self.send_listing(listing, &mut pkt, &mut scratch).await,
                        None => debug!(
                            "Skipping forced members listing for session {} within min interval",
                            sess.id()
                        ),
                    }
                }

                _ = ticker.tick() => {
                    let now = Instant::now();
                    for sess in self.sessions.snapshot() {
                        if let Some(listing) = sess.listing_if_due(now, interval) {
                            self.send_listing(listing, &mut pkt, &mut scratch).await;
                        }
                    }
                }
            }
        }
    }

    /// Drop expired payments and rotation tags.
    async fn payment_sweep_loop(&self, shutdown: CancellationToken) -> Result<()> {
        let period = self.cfg.payment_sweep_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let (payments, rotations) = self.ledger.sweep(crate::time::unix_now());
            if payments + rotations > 0 {
                debug!("Dropped {payments} stale payments and {rotations} stale rotation tags");
            }
        }
    }

    /// Log traffic rates at a fixed interval.
    async fn stats_report_loop(&self, shutdown: CancellationToken) -> Result<()> {
        let period = self.cfg.stats_report_interval;
        if period.is_zero() {
            info!("Logging of stats is disabled");
            return Ok(());
        }

        info!("Running report stats loop with interval {period:?}");
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut prev = self.snapshot();
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            let cur = self.snapshot();
            if let Some(line) = traffic_report(&prev, &cur, now - last_tick) {
                info!("{line}");
            }
            prev = cur;
            last_tick = now;
        }
    }
}

/// Real-time relay server.
///
/// # Examples
///
/// ```no_run
/// use rtdt_server::{Server, ServerConfig};
///
/// # async fn example() -> Result<(), rtdt_server::ServerError> {
/// let config = ServerConfig::with_listen_addr("0.0.0.0:7010".parse().unwrap());
/// let server = Server::bind(config).await?;
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    inner: Arc<ServerInner>,
    shutdown: CancellationToken,
    force_listing_rx: Mutex<Option<mpsc::Receiver<Arc<Session>>>>,
}

impl Server {
    /// Validate `config` and bind every listen address.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::InvalidConfig` for a bad configuration or
    /// `ServerError::Io` if a socket cannot be bound.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        if !config.encrypted() {
            warn!("Running without transport-level encryption");
        }
        if config.cookie_key.is_none() {
            warn!("Running without join cookie validation");
        }

        let mut listeners = Vec::with_capacity(config.listen_addrs.len());
        for addr in &config.listen_addrs {
            let socket = bind_socket(*addr, config.socket_buffer_size)?;
            let listener = Listener::new(socket, config.ignore_kernel_stats)?;
            debug!("Bound listener on {}", listener.local_addr);
            listeners.push(Arc::new(listener));
        }

        let (inner, force_listing_rx) = ServerInner::new(config, listeners);
        Ok(Self {
            inner: Arc::new(inner),
            shutdown: CancellationToken::new(),
            force_listing_rx: Mutex::new(Some(force_listing_rx)),
        })
    }

    /// Addresses the listeners are bound to.
    #[must_use]
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner.listeners.iter().map(|l| l.local_addr).collect()
    }

    /// Current counters and gauges.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.snapshot()
    }

    /// Stop every task started by [`Server::run`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Token cancelled on shutdown.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shutdown or the first task failure.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::AlreadyRunning` if called more than once, or the
    /// first error that ended a server task (a socket read failure).
    pub async fn run(&self) -> Result<()> {
        let force_rx = self
            .force_listing_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ServerError::AlreadyRunning)?;

        let inner = &self.inner;
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        for l in &inner.listeners {
            info!(
                "Listening on {}. Starting {} read routines",
                l.local_addr, inner.cfg.read_routines
            );

            let (i, l2, t) = (inner.clone(), l.clone(), self.shutdown.clone());
            tasks.spawn(async move { i.timeout_loop(l2, t).await });
            let (i, l2, t) = (inner.clone(), l.clone(), self.shutdown.clone());
            tasks.spawn(async move { i.kernel_stats_loop(l2, t).await });
            let (i, l2, t) = (inner.clone(), l.clone(), self.shutdown.clone());
            tasks.spawn(async move { i.handshake_loop(l2, t).await });
            for _ in 0..inner.cfg.read_routines {
                let (i, l2, t) = (inner.clone(), l.clone(), self.shutdown.clone());
                tasks.spawn(async move { i.read_loop(l2, t).await });
            }
        }

        let (i, t) = (inner.clone(), self.shutdown.clone());
        tasks.spawn(async move { i.listing_loop(force_rx, t).await });
        let (i, t) = (inner.clone(), self.shutdown.clone());
        tasks.spawn(async move { i.payment_sweep_loop(t).await });
        let (i, t) = (inner.clone(), self.shutdown.clone());
        tasks.spawn(async move { i.stats_report_loop(t).await });

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let res = joined
                .map_err(|e| ServerError::TaskFailed(e.to_string().into()))
                .and_then(|r| r);
            if let Err(e) = res {
                if result.is_ok() {
                    warn!("Server task failed, shutting down: {e}");
                    self.shutdown.cancel();
                    result = Err(e);
                }
            }
        }

        info!("Server stopped");
        result
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listeners", &self.local_addrs())
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}
