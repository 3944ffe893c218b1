//! Sessions and the global session table.
//!
//! A session is the set of peer bindings that relay to one another. The
//! global table maps a derived session id to its session; the session's own
//! state (peers, bans, membership bitmap) lives behind a per-session mutex so
//! unrelated sessions never contend.
//!
//! Lock order: the table shard lock is never held while taking a session
//! lock, and a session lock is never held while taking another session's.

use crate::conn::Conn;
use crate::error::{Result, ServerError};
use crate::payment::Payment;
use crate::peer::PeerSession;
use crate::server::ServerInner;
use dashmap::DashMap;
use roaring::RoaringBitmap;
use rtdt_core::{ErrorCode, MAX_MESSAGE_SIZE, PeerId, SessionId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Mutable state of a session.
pub(crate) struct SessionState {
    pub(crate) sid: SessionId,
    pub(crate) peers: Vec<Arc<PeerSession>>,
    pub(crate) last_member_listing: Option<Instant>,
    members: RoaringBitmap,
    members_buf: Vec<u8>,
    bans: HashMap<PeerId, Instant>,
    /// Set once the last peer left; the session must not be bound again.
    closed: bool,
}

impl SessionState {
    /// Whether `id` is banned at `now`. Expired bans are cleared; the second
    /// value reports whether that happened.
    fn check_ban(&mut self, id: PeerId, now: Instant) -> (bool, bool) {
        match self.bans.get(&id) {
            None => (false, false),
            Some(&end) if now > end => {
                self.bans.remove(&id);
                (false, true)
            }
            Some(_) => (true, false),
        }
    }

    /// Rewrite the serialized membership bitmap, returning its size.
    ///
    /// A bitmap that cannot fit in one message leaves the buffer empty.
    fn reserialize_members(&mut self) -> std::io::Result<usize> {
        self.members_buf.clear();
        let n = self.members.serialized_size();
        if n > MAX_MESSAGE_SIZE {
            return Ok(n);
        }
        self.members.serialize_into(&mut self.members_buf)?;
        Ok(n)
    }

    fn position(&self, id: PeerId) -> Option<usize> {
        self.peers.iter().position(|ps| ps.peer_id == id)
    }
}

/// A relay session.
pub(crate) struct Session {
    state: Mutex<SessionState>,
}

/// One relay destination.
pub(crate) struct DestPeer {
    pub(crate) peer_id: PeerId,
    pub(crate) conn: Arc<Conn>,
}

/// Everything needed to send one membership listing.
pub(crate) struct MembersListing {
    pub(crate) sid: SessionId,
    pub(crate) dests: Vec<DestPeer>,
    pub(crate) bitmap: Vec<u8>,
}

impl Session {
    pub(crate) fn new(sid: SessionId) -> Self {
        Self {
            state: Mutex::new(SessionState {
                sid,
                peers: Vec::new(),
                last_member_listing: None,
                members: RoaringBitmap::new(),
                members_buf: Vec::new(),
                bans: HashMap::new(),
                closed: false,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> SessionId {
        self.lock().sid
    }

    /// Append every bound peer to `out`.
    pub(crate) fn dest_peers(&self, out: &mut Vec<DestPeer>) {
        let st = self.lock();
        out.extend(st.peers.iter().map(|ps| DestPeer {
            peer_id: ps.peer_id,
            conn: ps.conn.clone(),
        }));
    }

    /// Remove `id`. Returns whether the session became empty (and is now
    /// closed) along with its current id.
    pub(crate) fn remove_peer(&self, id: PeerId) -> (bool, SessionId) {
        let mut st = self.lock();
        st.peers.retain(|ps| ps.peer_id != id);
        st.members.remove(id.0);
        let _ = st.reserialize_members();
        let empty = st.peers.is_empty();
        if empty {
            st.closed = true;
        }
        (empty, st.sid)
    }

    pub(crate) fn peer_conn(&self, id: PeerId) -> Option<Arc<Conn>> {
        let st = self.lock();
        st.position(id).map(|i| st.peers[i].conn.clone())
    }

    pub(crate) fn ban(&self, id: PeerId, duration: Duration) {
        self.lock().bans.insert(id, Instant::now() + duration);
    }

    /// Snapshot a membership listing if none was sent within `min_interval`,
    /// marking the session as listed at `now`.
    pub(crate) fn listing_if_due(&self, now: Instant, min_interval: Duration) -> Option<MembersListing> {
        let mut st = self.lock();
        if st
            .last_member_listing
            .is_some_and(|last| now.saturating_duration_since(last) < min_interval)
        {
            return None;
        }
        st.last_member_listing = Some(now);

        if st.members_buf.is_empty() {
            debug!(
                "Skipping members listing of session {} without a members bitmap",
                st.sid
            );
            return None;
        }

        Some(MembersListing {
            sid: st.sid,
            dests: st
                .peers
                .iter()
                .map(|ps| DestPeer {
                    peer_id: ps.peer_id,
                    conn: ps.conn.clone(),
                })
                .collect(),
            bitmap: st.members_buf.clone(),
        })
    }

    #[cfg(test)]
    pub(crate) fn peer_count(&self) -> usize {
        self.lock().peers.len()
    }

    #[cfg(test)]
    pub(crate) fn members(&self) -> Vec<u32> {
        self.lock().members.iter().collect()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("Session");
        // Debug may be reached while the state is locked
        match self.state.try_lock() {
            Ok(st) => d
                .field("sid", &st.sid)
                .field("peers", &st.peers.len())
                .field("closed", &st.closed),
            Err(_) => d.field("state", &"<locked>"),
        };
        d.finish()
    }
}

/// Global session table.
#[derive(Default)]
pub(crate) struct Sessions {
    table: DashMap<SessionId, Arc<Session>>,
}

impl Sessions {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    pub(crate) fn get(&self, sid: &SessionId) -> Option<Arc<Session>> {
        self.table.get(sid).map(|s| s.clone())
    }

    /// Existing session for `sid` or a new one; the flag is `true` if created.
    fn get_or_create(&self, sid: SessionId) -> (Arc<Session>, bool) {
        let mut created = false;
        let sess = self
            .table
            .entry(sid)
            .or_insert_with(|| {
                created = true;
                Arc::new(Session::new(sid))
            })
            .clone();
        (sess, created)
    }

    /// Remove `sid` only if it still maps to `sess`.
    fn remove_if_same(&self, sid: &SessionId, sess: &Arc<Session>) -> bool {
        self.table
            .remove_if(sid, |_, s| Arc::ptr_eq(s, sess))
            .is_some()
    }

    /// Every session, for periodic listings.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Session>> {
        self.table.iter().map(|e| e.value().clone()).collect()
    }
}

/// Parameters of a join, from a validated (or simulated) cookie.
#[derive(Debug, Clone)]
pub(crate) struct JoinGrant {
    pub(crate) sid: SessionId,
    pub(crate) size: u32,
    pub(crate) is_admin: bool,
    pub(crate) payment: Arc<Payment>,
}

impl ServerInner {
    /// Bind `source` on `conn` into the session named by `grant`.
    pub(crate) fn bind_to_session(
        &self,
        conn: &Arc<Conn>,
        source: PeerId,
        grant: JoinGrant,
    ) -> Result<Arc<Session>> {
        let JoinGrant {
            sid,
            size,
            is_admin,
            payment,
        } = grant;
        let size_usize = size as usize;

        loop {
            let (sess, created) = self.sessions.get_or_create(sid);
            if created {
                info!("Created session {sid}");
                self.stats.sessions.inc();
            }

            let mut st = sess.lock();
            if st.closed {
                // Lost a race with the last peer leaving; drop the stale entry
                // and start over with a fresh session.
                drop(st);
                if self.sessions.remove_if_same(&sid, &sess) {
                    self.stats.sessions.dec();
                }
                continue;
            }

            let (banned, removed_ban) = st.check_ban(source, Instant::now());
            if banned {
                return Err(ErrorCode::Banned.into());
            }
            if removed_ban {
                info!("Removed ban of peer {source} from session {sid}");
            }

            let mut moved_from: Option<Arc<PeerSession>> = None;
            let refreshed;
            let bound = match st.position(source) {
                None => {
                    refreshed = false;
                    let ps = Arc::new(PeerSession::new(
                        source,
                        sess.clone(),
                        conn.clone(),
                        size_usize,
                        is_admin,
                    ));
                    st.peers.push(ps.clone());
                    match conn.sessions.insert(source, ps.clone()) {
                        Some(old) if !Arc::ptr_eq(&old.session, &sess) => {
                            info!(
                                "Peer {} with peer id {source} switching to session {sid} \
                                 allowance {} admin {is_admin}",
                                conn.addr,
                                payment.remaining()
                            );
                            moved_from = Some(old);
                        }
                        _ => {
                            self.stats.peers.inc();
                            info!(
                                "Bound peer {} with peer id {source} and allowance {} \
                                 for size {size} in session {sid} admin {is_admin}",
                                conn.addr,
                                payment.remaining()
                            );
                        }
                    }
                    ps
                }
                Some(idx) => {
                    refreshed = true;
                    let ps = st.peers[idx].clone();
                    if ps.size != size_usize {
                        return Err(ServerError::SessionSizeMismatch {
                            bound: ps.size,
                            requested: size_usize,
                        });
                    }

                    if Arc::ptr_eq(&ps.conn, conn) {
                        ps
                    } else {
                        let new_ps = Arc::new(ps.moved_to(conn.clone(), is_admin));
                        st.peers[idx] = new_ps.clone();
                        ps.conn
                            .sessions
                            .remove_if(&source, |_, v| Arc::ptr_eq(v, &ps));
                        if let Some(old) = conn.sessions.insert(source, new_ps.clone()) {
                            if !Arc::ptr_eq(&old.session, &sess) {
                                // The replaced binding stays counted, the one
                                // this conn had elsewhere goes away
                                self.stats.peers.dec();
                                moved_from = Some(old);
                            }
                        }
                        info!(
                            "Replacing old peer {} with {} peer id {source} and allowance {} \
                             for size {size} in session {sid} admin {is_admin}",
                            ps.conn.addr,
                            conn.addr,
                            payment.remaining()
                        );
                        new_ps
                    }
                }
            };

            st.members.insert(source.0);
            let serialized = st.reserialize_members();
            drop(st);

            match serialized {
                Ok(n) if n > MAX_MESSAGE_SIZE => warn!(
                    "Members serialized bitmap for session {sid} larger than max \
                     message size ({n} bytes)"
                ),
                Ok(_) => {}
                Err(e) => warn!(
                    "Unable to write members bitmap for session {sid} after peer \
                     {source} joined: {e}"
                ),
            }

            if let Some(old) = moved_from {
                let (empty, old_sid) = old.session.remove_peer(source);
                self.after_peer_removed(&old.session, empty, old_sid);
            }

            bound.add_payment(payment.clone());
            if refreshed {
                debug!(
                    "Refreshed peer session {source} with allowance {} for size {size}",
                    payment.remaining()
                );
            }
            return Ok(sess);
        }
    }

    /// Drop an emptied session from the table, or schedule a listing for the
    /// remaining members.
    fn after_peer_removed(&self, sess: &Arc<Session>, empty: bool, sid: SessionId) {
        if empty {
            if self.sessions.remove_if_same(&sid, sess) {
                self.stats.sessions.dec();
                debug!("Removing empty session {sid}");
            }
        } else {
            self.force_listing(sess.clone());
        }
    }

    pub(crate) fn remove_peer_session(&self, ps: &PeerSession, kicked: bool) {
        let (empty, sid) = ps.session.remove_peer(ps.peer_id);
        debug!(
            "Peer {} from {} left session {sid}{}",
            ps.peer_id,
            ps.conn.addr,
            if kicked { " (KICKED)" } else { "" }
        );
        self.stats.peers.dec();
        self.after_peer_removed(&ps.session, empty, sid);
    }

    /// Unbind `id` from whatever session it is bound to on `conn`.
    pub(crate) fn remove_from_session(&self, conn: &Conn, id: PeerId, kicked: bool) -> Result<()> {
        let (_, ps) = conn.sessions.remove(&id).ok_or(ServerError::NotInSession)?;
        self.remove_peer_session(&ps, kicked);
        Ok(())
    }

    /// Unbind every peer of a connection being dropped.
    pub(crate) fn remove_from_all_sessions(&self, conn: &Conn) {
        let ids: Vec<PeerId> = conn.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, ps)) = conn.sessions.remove(&id) {
                self.remove_peer_session(&ps, false);
            }
        }
    }

    /// Admin `source` on `conn` removes `target` from their shared session,
    /// optionally banning it. Returns the kicked peer's connection.
    pub(crate) fn kick_from_session(
        &self,
        conn: &Conn,
        source: PeerId,
        target: PeerId,
        ban_seconds: u32,
    ) -> Result<Arc<Conn>> {
        let ps = conn
            .sessions
            .get(&source)
            .map(|e| e.value().clone())
            .ok_or(ErrorCode::SourcePeerNotInSession)?;
        if !ps.is_admin {
            return Err(ErrorCode::SourcePeerNotAdmin.into());
        }

        let target_conn = ps
            .session
            .peer_conn(target)
            .ok_or(ErrorCode::TargetPeerNotInSession)?;

        if ban_seconds > 0 {
            let duration = Duration::from_secs(u64::from(ban_seconds));
            info!(
                "Admin {source} banning peer {target} in session {} for {duration:?}",
                ps.session.id()
            );
            ps.session.ban(target, duration);
        } else {
            info!(
                "Admin {source} kicking peer {target} from session {}",
                ps.session.id()
            );
        }

        self.remove_from_session(&target_conn, target, true)?;
        Ok(target_conn)
    }

    /// Move the session of admin `source` to the id derived from the new
    /// owner secret of a rotation cookie.
    pub(crate) fn rotate_session(&self, conn: &Conn, source: PeerId, cookie: &[u8]) -> Result<()> {
        let ps = conn
            .sessions
            .get(&source)
            .map(|e| e.value().clone())
            .ok_or(ErrorCode::SourcePeerNotInSession)?;
        if !ps.is_admin {
            return Err(ErrorCode::SourcePeerNotAdmin.into());
        }
        let sess = ps.session.clone();

        let key = self
            .cfg
            .cookie_key
            .as_ref()
            .ok_or(ErrorCode::InvalidRotCookie)?;
        let rc = rtdt_core::RotateCookie::decrypt(cookie, key, &self.cfg.decode_cookie_keys)
            .map_err(|_| ErrorCode::InvalidRotCookie)?;

        let now = crate::time::unix_now();
        let lifetime = i64::try_from(self.cfg.rotate_cookie_lifetime.as_secs()).unwrap_or(i64::MAX);
        if now.saturating_sub(rc.timestamp) > lifetime {
            return Err(ErrorCode::ExpiredRotCookie.into());
        }

        let old_sid = SessionId::from_bytes(self.hasher.session_id(
            &rc.old_owner_secret,
            &rc.server_secret,
            rc.size,
        ));
        if old_sid != sess.id() {
            return Err(ErrorCode::MismatchedOldSessId.into());
        }

        if !self
            .ledger
            .redeem_rotation(rc.payment_tag, rc.timestamp.saturating_add(lifetime))
        {
            return Err(ErrorCode::AlreadyUsedRotCookie.into());
        }

        let new_sid = SessionId::from_bytes(self.hasher.session_id(
            &rc.new_owner_secret,
            &rc.server_secret,
            rc.size,
        ));
        if new_sid == old_sid {
            return Ok(());
        }

        {
            let mut st = sess.lock();
            if st.closed {
                return Err(ServerError::NotInSession);
            }
            st.sid = new_sid;
        }
        self.sessions.table.insert(new_sid, sess.clone());
        self.sessions.remove_if_same(&old_sid, &sess);

        info!("Peer {source} rotated session id from {old_sid} to {new_sid}");
        Ok(())
    }
}
