//! Internal commands addressed to the server.
//!
//! A command arrives as a framed packet with `Target == 0` and a source
//! that names the calling peer. Replies reuse the inbound buffer: its header
//! is rewritten in place and the command payload replaced.

use crate::conn::Conn;
use crate::error::{Result, ServerError};
use crate::server::ServerInner;
use crate::session::JoinGrant;
use rtdt_core::{
    ErrorCode, FramedPktBuf, JoinCookie, MAX_PING_PAYLOAD_SIZE, PeerId, ServerCmd, ServerCmdType,
    SessionId,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Allowance of a simulated join (10 GB).
const SIMULATED_ALLOWANCE: u64 = 10_000_000_000;

/// Fan-out limit of a simulated join.
const SIMULATED_SIZE: u32 = 1 << 16;

impl ServerInner {
    /// Execute the command in `pkt`, sent by `conn`.
    ///
    /// An error means the caller misbehaved and should be ban-scored. Replies
    /// that report an error are sent before it is returned.
    pub(crate) async fn handle_internal_cmd(
        &self,
        conn: &Arc<Conn>,
        pkt: &mut FramedPktBuf,
        recv_time: Instant,
        scratch: &mut Vec<u8>,
    ) -> Result<()> {
        if !pkt.target().is_server() {
            return Err(ServerError::NonZeroTarget);
        }

        let source = pkt.source();
        let (cmd_type, payload) = pkt.server_cmd()?;

        match cmd_type {
            ServerCmdType::Ping => {
                if payload.len() > MAX_PING_PAYLOAD_SIZE {
                    return Err(ServerError::PingTooLarge(payload.len()));
                }
                if let Some(prev) = conn.last_ping.swap(recv_time) {
                    let since = recv_time.saturating_duration_since(prev);
                    if since < self.cfg.min_ping_interval {
                        return Err(ServerError::PingTooRecent(since));
                    }
                }

                // Pong echoes the ping payload already in the buffer
                pkt.set_cmd_type(ServerCmdType::Pong);
                self.reply(conn, pkt, source, scratch).await
            }

            ServerCmdType::Pong => {
                if payload.len() > MAX_PING_PAYLOAD_SIZE {
                    return Err(ServerError::PingTooLarge(payload.len()));
                }
                Ok(())
            }

            ServerCmdType::JoinSession => {
                let cookie = payload.to_vec();
                self.handle_join(conn, pkt, source, &cookie, scratch).await
            }

            ServerCmdType::LeaveSession => {
                let res = self.remove_from_session(conn, source, false);
                if let Err(e) = &res {
                    if self.cfg.log_read_loop_errors {
                        warn!("Error processing session leave command from {}: {e}", conn.addr);
                    }
                }

                let reply = ServerCmd::LeaveSessionReply {
                    err: self.disclosed(&res),
                };
                self.send_cmd(conn, pkt, source, &reply, scratch).await
            }

            ServerCmdType::KickPeer => {
                let ServerCmd::KickPeer {
                    target,
                    ban_seconds,
                } = ServerCmd::decode(cmd_type, payload)?
                else {
                    return Err(ServerError::InvalidCommand("kick payload".into()));
                };
                self.handle_kick(conn, pkt, source, target, ban_seconds, scratch)
                    .await
            }

            ServerCmdType::RotateCookies => {
                let cookie = payload.to_vec();
                let res = self.rotate_session(conn, source, &cookie);
                if let Err(e) = &res {
                    if self.cfg.log_read_loop_errors {
                        warn!("Error processing rotate cookies command from {}: {e}", conn.addr);
                    }
                }

                let reply = ServerCmd::RotateCookiesReply {
                    err: self.disclosed(&res),
                };
                self.send_cmd(conn, pkt, source, &reply, scratch).await?;
                res
            }

            other => Err(ServerError::InvalidCommand(
                format!("{other:?} is not accepted from clients").into(),
            )),
        }
    }

    async fn handle_join(
        &self,
        conn: &Arc<Conn>,
        pkt: &mut FramedPktBuf,
        source: PeerId,
        cookie: &[u8],
        scratch: &mut Vec<u8>,
    ) -> Result<()> {
        // Only a rejected cookie counts against the connection; a peer
        // refused by the session itself (ban, size mismatch) may retry.
        let (res, bad_cookie) = match self.join_grant(source, cookie) {
            Ok(grant) => (self.bind_to_session(conn, source, grant), false),
            Err(e) => (Err(e), true),
        };

        if let Err(e) = &res {
            if self.cfg.log_read_loop_errors {
                warn!("Error processing session bind command from {}: {e}", conn.addr);
            }
        }

        let reply = ServerCmd::JoinSessionReply {
            err: self.disclosed(&res),
        };
        let write_res = self.send_cmd(conn, pkt, source, &reply, scratch).await;

        // After the reply, so the joining peer also sees the new listing
        match res {
            Ok(sess) => {
                self.force_listing(sess);
                write_res
            }
            Err(e) if bad_cookie => Err(e),
            Err(_) => write_res,
        }
    }

    /// Validate a join cookie, or simulate one when cookie validation is
    /// disabled.
    pub(crate) fn join_grant(&self, source: PeerId, cookie: &[u8]) -> Result<JoinGrant> {
        let Some(key) = &self.cfg.cookie_key else {
            // Peers sharing the top 16 bits of their id share a session
            let mut sid = [0u8; 32];
            sid[28] = (source.0 >> 24) as u8;
            sid[29] = (source.0 >> 16) as u8;
            let end = crate::time::unix_now().saturating_add(
                i64::try_from(self.cfg.payment_sweep_interval.as_secs()).unwrap_or(i64::MAX),
            );

            return Ok(JoinGrant {
                sid: SessionId::from_bytes(sid),
                size: SIMULATED_SIZE,
                is_admin: source.0 & 1 == 1,
                payment: self.ledger.redeem(rand::random(), SIMULATED_ALLOWANCE, end),
            });
        };

        let jc = JoinCookie::decrypt(cookie, key, &self.cfg.decode_cookie_keys)
            .map_err(|_| ErrorCode::JoinCookieInvalid)?;
        if jc.peer_id != source {
            return Err(ErrorCode::JoinCookieWrongPeerId.into());
        }
        if crate::time::unix_now() > jc.end_timestamp {
            return Err(ErrorCode::JoinCookieExpired.into());
        }

        let payment = self
            .ledger
            .redeem(jc.payment_tag, jc.publish_allowance, jc.end_timestamp);
        let sid = SessionId::from_bytes(self.hasher.session_id(
            &jc.owner_secret,
            &jc.server_secret,
            jc.size,
        ));

        Ok(JoinGrant {
            sid,
            size: jc.size,
            is_admin: jc.is_admin,
            payment,
        })
    }

    async fn handle_kick(
        &self,
        conn: &Arc<Conn>,
        pkt: &mut FramedPktBuf,
        source: PeerId,
        target: PeerId,
        ban_seconds: u32,
        scratch: &mut Vec<u8>,
    ) -> Result<()> {
        let res = self.kick_from_session(conn, source, target, ban_seconds);
        match &res {
            Ok(target_conn) => {
                // Tell the kicked peer, numbered from its own counter
                let report = ServerCmd::KickPeer {
                    target,
                    ban_seconds,
                };
                match self
                    .send_cmd(target_conn, pkt, target, &report, scratch)
                    .await
                {
                    Ok(()) => debug!("Sent report to kicked target {target}"),
                    Err(e) => warn!(
                        "Unable to write report to kicked target {}: {e}",
                        target_conn.addr
                    ),
                }
            }
            Err(e) => {
                if self.cfg.log_read_loop_errors {
                    warn!("Error processing kick peer command from {}: {e}", conn.addr);
                }
            }
        }

        let reply = ServerCmd::KickPeerReply {
            target,
            err: self.disclosed(&res),
        };
        self.send_cmd(conn, pkt, source, &reply, scratch).await?;
        res.map(|_| ())
    }

    /// Error code to put in a reply, hidden unless disclosure is enabled.
    fn disclosed<T>(&self, res: &Result<T>) -> ErrorCode {
        match res {
            Err(e) if self.cfg.reply_error_codes => e.error_code(),
            _ => ErrorCode::NoError,
        }
    }

    /// Replace the command in `pkt` with `cmd` and send it to `target` on
    /// `conn`.
    async fn send_cmd(
        &self,
        conn: &Conn,
        pkt: &mut FramedPktBuf,
        target: PeerId,
        cmd: &ServerCmd,
        scratch: &mut Vec<u8>,
    ) -> Result<()> {
        let mut payload = Vec::with_capacity(16);
        cmd.write_payload(&mut payload);
        pkt.set_cmd_payload(cmd.cmd_type(), &payload)?;
        self.reply(conn, pkt, target, scratch).await
    }

    /// Send `pkt` as a server packet to `target`.
    async fn reply(
        &self,
        conn: &Conn,
        pkt: &mut FramedPktBuf,
        target: PeerId,
        scratch: &mut Vec<u8>,
    ) -> Result<()> {
        pkt.set_reply_header(target, conn.next_send_seq());
        self.write_to(conn, pkt.as_bytes(), scratch).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use rand::rngs::OsRng;
    use rtdt_core::{FramedPacket, FramedPktBuf};
    use rtdt_crypto::aead::AeadKey;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    /// A client socket and the server-side conn that writes to it.
    struct Peer {
        client: UdpSocket,
        conn: Arc<Conn>,
    }

    impl Peer {
        async fn new() -> Self {
            let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let conn = Arc::new(Conn::unencrypted(
                client.local_addr().unwrap(),
                crate::conn::tests::test_socket().await,
                Instant::now(),
            ));
            Self { client, conn }
        }

        async fn recv(&self) -> (FramedPacket, ServerCmd) {
            let mut buf = vec![0u8; 2048];
            let n = tokio::time::timeout(Duration::from_secs(2), self.client.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let pkt = FramedPacket::decode(&buf[..n]).unwrap();
            let cmd = ServerCmd::from_packet(&pkt).unwrap();
            (pkt, cmd)
        }
    }

    fn cmd_buf(source: u32, cmd: &ServerCmd) -> FramedPktBuf {
        let raw = cmd.to_packet(PeerId::SERVER, PeerId(source), 1).encode();
        let mut pkt = FramedPktBuf::new();
        pkt.set_full_data(&raw).unwrap();
        pkt
    }

    async fn run(inner: &ServerInner, peer: &Peer, source: u32, cmd: &ServerCmd) -> Result<()> {
        let mut pkt = cmd_buf(source, cmd);
        let mut scratch = Vec::new();
        inner
            .handle_internal_cmd(&peer.conn, &mut pkt, Instant::now(), &mut scratch)
            .await
    }

    fn debug_config() -> ServerConfig {
        ServerConfig::default().log_and_reply_errors()
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (inner, _rx) = ServerInner::for_tests(ServerConfig::default());
        let peer = Peer::new().await;

        run(&inner, &peer, 7, &ServerCmd::Ping(b"hello".to_vec()))
            .await
            .unwrap();
        let (pkt, cmd) = peer.recv().await;
        assert_eq!(cmd, ServerCmd::Pong(b"hello".to_vec()));
        assert_eq!(pkt.target, PeerId(7));
        assert_eq!(pkt.source, PeerId::SERVER);
        assert_eq!(pkt.sequence, 1);
    }

    #[tokio::test]
    async fn test_ping_too_recent() {
        let (inner, _rx) = ServerInner::for_tests(ServerConfig::default());
        let peer = Peer::new().await;

        run(&inner, &peer, 7, &ServerCmd::Ping(vec![])).await.unwrap();
        let err = run(&inner, &peer, 7, &ServerCmd::Ping(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::PingTooRecent(_)));
    }

    #[tokio::test]
    async fn test_ping_too_large() {
        let (inner, _rx) = ServerInner::for_tests(ServerConfig::default());
        let peer = Peer::new().await;

        let mut data = vec![ServerCmdType::Ping as u8];
        data.extend_from_slice(&[0u8; MAX_PING_PAYLOAD_SIZE + 1]);
        let raw = FramedPacket {
            target: PeerId::SERVER,
            source: PeerId(7),
            sequence: 1,
            data,
        }
        .encode();
        let mut pkt = FramedPktBuf::new();
        pkt.set_full_data(&raw).unwrap();

        let err = inner
            .handle_internal_cmd(&peer.conn, &mut pkt, Instant::now(), &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::PingTooLarge(65)));
    }

    #[tokio::test]
    async fn test_non_zero_target_rejected() {
        let (inner, _rx) = ServerInner::for_tests(ServerConfig::default());
        let peer = Peer::new().await;

        let raw = ServerCmd::Ping(vec![])
            .to_packet(PeerId(3), PeerId(7), 1)
            .encode();
        let mut pkt = FramedPktBuf::new();
        pkt.set_full_data(&raw).unwrap();
        let err = inner
            .handle_internal_cmd(&peer.conn, &mut pkt, Instant::now(), &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NonZeroTarget));
    }

    #[tokio::test]
    async fn test_reply_commands_rejected() {
        let (inner, _rx) = ServerInner::for_tests(ServerConfig::default());
        let peer = Peer::new().await;

        let err = run(
            &inner,
            &peer,
            7,
            &ServerCmd::JoinSessionReply {
                err: ErrorCode::NoError,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::InvalidCommand(_)));
    }

    #[tokio::test]
    async fn test_simulated_join_and_leave() {
        let (inner, mut rx) = ServerInner::for_tests(ServerConfig::default());
        let peer = Peer::new().await;

        let join = ServerCmd::JoinSession { cookie: vec![] };
        run(&inner, &peer, 0x0001_0001, &join).await.unwrap();
        let (_, cmd) = peer.recv().await;
        assert_eq!(
            cmd,
            ServerCmd::JoinSessionReply {
                err: ErrorCode::NoError
            }
        );
        assert_eq!(inner.sessions.len(), 1);
        assert!(peer.conn.sessions.get(&PeerId(0x0001_0001)).unwrap().is_admin);
        assert!(rx.try_recv().is_ok());

        run(&inner, &peer, 0x0001_0001, &ServerCmd::LeaveSession)
            .await
            .unwrap();
        let (_, cmd) = peer.recv().await;
        assert!(matches!(cmd, ServerCmd::LeaveSessionReply { .. }));
        assert_eq!(inner.sessions.len(), 0);
    }

    #[tokio::test]
    async fn test_leave_when_not_bound_replies() {
        let (inner, _rx) = ServerInner::for_tests(debug_config());
        let peer = Peer::new().await;

        run(&inner, &peer, 4, &ServerCmd::LeaveSession).await.unwrap();
        let (_, cmd) = peer.recv().await;
        assert!(matches!(cmd, ServerCmd::LeaveSessionReply { .. }));
    }

    fn cookie_config() -> (ServerConfig, AeadKey) {
        let key = AeadKey::generate(&mut OsRng);
        let config = ServerConfig {
            cookie_key: Some(key.clone()),
            ..debug_config()
        };
        (config, key)
    }

    fn join_cookie(key: &AeadKey, peer: u32, end_timestamp: i64, is_admin: bool) -> Vec<u8> {
        JoinCookie {
            server_secret: [1; 32],
            owner_secret: [2; 32],
            size: 8,
            peer_id: PeerId(peer),
            end_timestamp,
            payment_tag: rand::random(),
            publish_allowance: 1 << 20,
            is_admin,
        }
        .encrypt(key)
        .unwrap()
    }

    #[tokio::test]
    async fn test_join_cookie_errors_disclosed() {
        let (config, key) = cookie_config();
        let (inner, _rx) = ServerInner::for_tests(config);
        let peer = Peer::new().await;
        let future = crate::time::unix_now() + 3600;

        let cases = [
            (vec![0u8; 120], ErrorCode::JoinCookieInvalid),
            (join_cookie(&key, 9, future, false), ErrorCode::JoinCookieWrongPeerId),
            (join_cookie(&key, 5, 1, false), ErrorCode::JoinCookieExpired),
        ];
        for (cookie, code) in cases {
            let err = run(&inner, &peer, 5, &ServerCmd::JoinSession { cookie })
                .await
                .unwrap_err();
            assert_eq!(err.error_code(), code);
            let (_, cmd) = peer.recv().await;
            assert_eq!(cmd, ServerCmd::JoinSessionReply { err: code });
        }
        assert_eq!(inner.sessions.len(), 0);
    }

    #[tokio::test]
    async fn test_join_errors_hidden_by_default() {
        let key = AeadKey::generate(&mut OsRng);
        let config = ServerConfig {
            cookie_key: Some(key),
            ..ServerConfig::default()
        };
        let (inner, _rx) = ServerInner::for_tests(config);
        let peer = Peer::new().await;

        let cookie = vec![0u8; 120];
        assert!(run(&inner, &peer, 5, &ServerCmd::JoinSession { cookie })
            .await
            .is_err());
        let (_, cmd) = peer.recv().await;
        assert_eq!(
            cmd,
            ServerCmd::JoinSessionReply {
                err: ErrorCode::NoError
            }
        );
    }

    #[tokio::test]
    async fn test_same_cookie_twice() {
        let (config, key) = cookie_config();
        let (inner, _rx) = ServerInner::for_tests(config);
        let peer = Peer::new().await;
        let cookie = join_cookie(&key, 5, crate::time::unix_now() + 3600, false);

        for _ in 0..2 {
            run(
                &inner,
                &peer,
                5,
                &ServerCmd::JoinSession {
                    cookie: cookie.clone(),
                },
            )
            .await
            .unwrap();
            let (_, cmd) = peer.recv().await;
            assert_eq!(
                cmd,
                ServerCmd::JoinSessionReply {
                    err: ErrorCode::NoError
                }
            );
        }
        assert_eq!(inner.sessions.len(), 1);
        assert_eq!(inner.ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_kick_reports_to_target() {
        let (config, key) = cookie_config();
        let (inner, _rx) = ServerInner::for_tests(config);
        let admin = Peer::new().await;
        let victim = Peer::new().await;
        let end = crate::time::unix_now() + 3600;

        for (peer, id, is_admin) in [(&admin, 1, true), (&victim, 2, false)] {
            let cookie = join_cookie(&key, id, end, is_admin);
            run(&inner, peer, id, &ServerCmd::JoinSession { cookie })
                .await
                .unwrap();
            peer.recv().await;
        }

        // Non-admin cannot kick
        let kick_admin = ServerCmd::KickPeer {
            target: PeerId(1),
            ban_seconds: 0,
        };
        let err = run(&inner, &victim, 2, &kick_admin).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::SourcePeerNotAdmin);
        let (_, cmd) = victim.recv().await;
        assert_eq!(
            cmd,
            ServerCmd::KickPeerReply {
                target: PeerId(1),
                err: ErrorCode::SourcePeerNotAdmin
            }
        );

        let kick = ServerCmd::KickPeer {
            target: PeerId(2),
            ban_seconds: 30,
        };
        run(&inner, &admin, 1, &kick).await.unwrap();

        let (pkt, cmd) = victim.recv().await;
        assert_eq!(cmd, kick);
        assert_eq!(pkt.target, PeerId(2));
        // Join reply was 1, the failed kick reply 2
        assert_eq!(pkt.sequence, 3);

        let (_, cmd) = admin.recv().await;
        assert_eq!(
            cmd,
            ServerCmd::KickPeerReply {
                target: PeerId(2),
                err: ErrorCode::NoError
            }
        );

        // Banned from rejoining, without counting against the connection
        let cookie = join_cookie(&key, 2, end, false);
        run(&inner, &victim, 2, &ServerCmd::JoinSession { cookie })
            .await
            .unwrap();
        let (_, cmd) = victim.recv().await;
        assert_eq!(
            cmd,
            ServerCmd::JoinSessionReply {
                err: ErrorCode::Banned
            }
        );
    }

    #[tokio::test]
    async fn test_rotate_not_in_session() {
        let (config, _key) = cookie_config();
        let (inner, _rx) = ServerInner::for_tests(config);
        let peer = Peer::new().await;

        let err = run(
            &inner,
            &peer,
            3,
            &ServerCmd::RotateCookies {
                cookie: vec![0u8; 160],
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::SourcePeerNotInSession);
        let (_, cmd) = peer.recv().await;
        assert_eq!(
            cmd,
            ServerCmd::RotateCookiesReply {
                err: ErrorCode::SourcePeerNotInSession
            }
        );
    }
}
