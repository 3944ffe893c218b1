//! Relay server configuration.

use crate::error::ServerError;
use rtdt_crypto::aead::AeadKey;
use rtdt_crypto::kem::KemPrivateKey;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UDP addresses to listen on
    pub listen_addrs: Vec<SocketAddr>,

    /// KEM private key. `None` disables transport encryption.
    pub private_key: Option<Arc<KemPrivateKey>>,

    /// Key that opens join and rotation cookies. `None` disables cookie
    /// validation and grants simulated cookies.
    pub cookie_key: Option<AeadKey>,

    /// Retired cookie keys still accepted for decryption
    pub decode_cookie_keys: Vec<AeadKey>,

    /// Read tasks per listener
    pub read_routines: usize,

    /// Read silence after which a connection is dropped
    pub max_ping_interval: Duration,

    /// Minimum spacing between two pings from one connection
    pub min_ping_interval: Duration,

    /// Ban score at which a connection is dropped
    pub max_ban_score: u64,

    /// Interval of the stale connection sweep
    pub timeout_sweep_interval: Duration,

    /// Interval of the expired payment sweep
    pub payment_sweep_interval: Duration,

    /// Interval of periodic membership listings
    pub session_listing_interval: Duration,

    /// Minimum spacing between two listings of one session
    pub min_session_listing_interval: Duration,

    /// Lifetime of a rotation cookie after its timestamp
    pub rotate_cookie_lifetime: Duration,

    /// Interval of the stats report log. Zero disables it.
    pub stats_report_interval: Duration,

    /// Disclose error codes in join replies
    pub reply_error_codes: bool,

    /// Log remotely triggered errors
    pub log_read_loop_errors: bool,

    /// Skip forced membership listings
    pub disable_force_listing: bool,

    /// Do not read kernel socket statistics
    pub ignore_kernel_stats: bool,

    /// Requested SO_RCVBUF / SO_SNDBUF size
    pub socket_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addrs: Vec::new(),
            private_key: None,
            cookie_key: None,
            decode_cookie_keys: Vec::new(),
            read_routines: 1,
            max_ping_interval: Duration::from_secs(60),
            min_ping_interval: Duration::from_secs(5),
            max_ban_score: 50,
            timeout_sweep_interval: Duration::from_secs(10),
            payment_sweep_interval: Duration::from_secs(3600),
            session_listing_interval: Duration::from_secs(30),
            min_session_listing_interval: Duration::from_secs(5),
            rotate_cookie_lifetime: Duration::from_secs(300),
            stats_report_interval: Duration::from_secs(10),
            reply_error_codes: false,
            log_read_loop_errors: false,
            disable_force_listing: false,
            ignore_kernel_stats: false,
            socket_buffer_size: 2 * 1024 * 1024, // 2 MB
        }
    }
}

impl ServerConfig {
    /// Config listening on a single address.
    #[must_use]
    pub fn with_listen_addr(addr: SocketAddr) -> Self {
        Self {
            listen_addrs: vec![addr],
            ..Self::default()
        }
    }

    /// Disclose error codes and log remotely triggered errors.
    #[must_use]
    pub fn log_and_reply_errors(mut self) -> Self {
        self.log_read_loop_errors = true;
        self.reply_error_codes = true;
        self
    }

    /// Whether connections are encrypted.
    #[must_use]
    pub fn encrypted(&self) -> bool {
        self.private_key.is_some()
    }

    /// Check the configuration for values the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::InvalidConfig` describing the first bad value.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.listen_addrs.is_empty() {
            return Err(ServerError::InvalidConfig(
                "at least one listen address is required".into(),
            ));
        }
        if self.read_routines == 0 {
            return Err(ServerError::InvalidConfig(
                "read_routines must be at least 1".into(),
            ));
        }
        if self.max_ban_score == 0 {
            return Err(ServerError::InvalidConfig(
                "max_ban_score must be positive".into(),
            ));
        }

        let positive = [
            ("max_ping_interval", self.max_ping_interval),
            ("timeout_sweep_interval", self.timeout_sweep_interval),
            ("payment_sweep_interval", self.payment_sweep_interval),
            ("session_listing_interval", self.session_listing_interval),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(ServerError::InvalidConfig(
                    format!("{name} must be positive").into(),
                ));
            }
        }

        if self.cookie_key.is_none() && !self.decode_cookie_keys.is_empty() {
            return Err(ServerError::InvalidConfig(
                "decode_cookie_keys require a cookie_key".into(),
            ));
        }
        Ok(())
    }

    /// Tick of the stale connection sweep.
    pub(crate) fn timeout_tick(&self) -> Duration {
        self.max_ping_interval.min(self.timeout_sweep_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.read_routines, 1);
        assert_eq!(config.max_ban_score, 50);
        assert_eq!(config.max_ping_interval, Duration::from_secs(60));
        assert_eq!(config.rotate_cookie_lifetime, Duration::from_secs(300));
        assert!(!config.encrypted());
        assert!(!config.reply_error_codes);
    }

    #[test]
    fn test_validate_requires_listen_addr() {
        let config = ServerConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ServerError::InvalidConfig(_))
        ));

        let config = ServerConfig::with_listen_addr("127.0.0.1:0".parse().unwrap());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = ServerConfig::with_listen_addr("127.0.0.1:0".parse().unwrap());
        config.read_routines = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::with_listen_addr("127.0.0.1:0".parse().unwrap());
        config.max_ping_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_old_keys_without_current() {
        let mut config = ServerConfig::with_listen_addr("127.0.0.1:0".parse().unwrap());
        config.decode_cookie_keys = vec![AeadKey::generate(&mut OsRng)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_tick() {
        let mut config = ServerConfig::default();
        assert_eq!(config.timeout_tick(), Duration::from_secs(10));
        config.max_ping_interval = Duration::from_secs(2);
        assert_eq!(config.timeout_tick(), Duration::from_secs(2));
    }
}
