//! Configuration file for the relay binary.

use anyhow::Context;
use rtdt_crypto::aead::AeadKey;
use rtdt_crypto::kem::KemPrivateKey;
use rtdt_server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server tuning
    #[serde(default)]
    pub server: ServerSection,
    /// Key material
    #[serde(default)]
    pub keys: KeysSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// UDP listen addresses
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    /// Read tasks per listener
    #[serde(default = "default_read_routines")]
    pub read_routines: usize,
    /// Read silence (seconds) before a connection is dropped
    #[serde(default = "default_max_ping_interval")]
    pub max_ping_interval_secs: u64,
    /// Minimum seconds between two pings
    #[serde(default = "default_min_ping_interval")]
    pub min_ping_interval_secs: u64,
    /// Ban score at which a connection is dropped
    #[serde(default = "default_max_ban_score")]
    pub max_ban_score: u64,
    /// Seconds between stale connection sweeps
    #[serde(default = "default_timeout_sweep_interval")]
    pub timeout_sweep_interval_secs: u64,
    /// Seconds between expired payment sweeps
    #[serde(default = "default_payment_sweep_interval")]
    pub payment_sweep_interval_secs: u64,
    /// Seconds between periodic membership listings
    #[serde(default = "default_session_listing_interval")]
    pub session_listing_interval_secs: u64,
    /// Minimum seconds between two listings of one session
    #[serde(default = "default_min_session_listing_interval")]
    pub min_session_listing_interval_secs: u64,
    /// Rotation cookie lifetime in seconds
    #[serde(default = "default_rotate_cookie_lifetime")]
    pub rotate_cookie_lifetime_secs: u64,
    /// Seconds between traffic reports, 0 to disable
    #[serde(default = "default_stats_report_interval")]
    pub stats_report_interval_secs: u64,
    /// Disclose error codes in replies
    #[serde(default)]
    pub reply_error_codes: bool,
    /// Log remotely triggered errors
    #[serde(default)]
    pub log_read_loop_errors: bool,
    /// Skip forced membership listings
    #[serde(default)]
    pub disable_force_listing: bool,
    /// Do not read kernel socket statistics
    #[serde(default)]
    pub ignore_kernel_stats: bool,
    /// Requested socket buffer size in bytes
    #[serde(default = "default_socket_buffer_size")]
    pub socket_buffer_size: usize,
}

/// Key configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KeysSection {
    /// KEM private key file; unset disables transport encryption
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_file: Option<PathBuf>,
    /// Cookie key (hex); unset disables cookie validation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie_key: Option<String>,
    /// Retired cookie keys (hex) still accepted
    #[serde(default)]
    pub decode_cookie_keys: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_listen() -> Vec<String> {
    vec!["0.0.0.0:7010".to_string()]
}

fn default_read_routines() -> usize {
    1
}

fn default_max_ping_interval() -> u64 {
    60
}

fn default_min_ping_interval() -> u64 {
    5
}

fn default_max_ban_score() -> u64 {
    50
}

fn default_timeout_sweep_interval() -> u64 {
    10
}

fn default_payment_sweep_interval() -> u64 {
    3600 // 1 hour
}

fn default_session_listing_interval() -> u64 {
    30
}

fn default_min_session_listing_interval() -> u64 {
    5
}

fn default_rotate_cookie_lifetime() -> u64 {
    300 // 5 minutes
}

fn default_stats_report_interval() -> u64 {
    10
}

fn default_socket_buffer_size() -> usize {
    2 * 1024 * 1024 // 2 MB
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            read_routines: default_read_routines(),
            max_ping_interval_secs: default_max_ping_interval(),
            min_ping_interval_secs: default_min_ping_interval(),
            max_ban_score: default_max_ban_score(),
            timeout_sweep_interval_secs: default_timeout_sweep_interval(),
            payment_sweep_interval_secs: default_payment_sweep_interval(),
            session_listing_interval_secs: default_session_listing_interval(),
            min_session_listing_interval_secs: default_min_session_listing_interval(),
            rotate_cookie_lifetime_secs: default_rotate_cookie_lifetime(),
            stats_report_interval_secs: default_stats_report_interval(),
            reply_error_codes: false,
            log_read_loop_errors: false,
            disable_force_listing: false,
            ignore_kernel_stats: false,
            socket_buffer_size: default_socket_buffer_size(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Parse the listen addresses
    ///
    /// # Errors
    ///
    /// Returns an error if an address cannot be parsed.
    pub fn listen_addrs(&self) -> anyhow::Result<Vec<SocketAddr>> {
        self.server
            .listen
            .iter()
            .map(|a| {
                a.parse()
                    .with_context(|| format!("invalid listen address '{a}'"))
            })
            .collect()
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.listen.is_empty() {
            anyhow::bail!("At least one listen address is required");
        }
        self.listen_addrs()?;

        if self.server.read_routines == 0 || self.server.read_routines > 256 {
            anyhow::bail!("read_routines must be between 1 and 256");
        }

        if self.server.max_ping_interval_secs == 0 {
            anyhow::bail!("max_ping_interval_secs must be positive");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if let Some(key) = &self.keys.cookie_key {
            AeadKey::from_hex(key).context("invalid cookie_key")?;
        }
        for key in &self.keys.decode_cookie_keys {
            AeadKey::from_hex(key).context("invalid entry in decode_cookie_keys")?;
        }

        Ok(())
    }

    /// Build the server configuration, loading key files.
    ///
    /// # Errors
    ///
    /// Returns an error if an address or key cannot be parsed or a key file
    /// cannot be read.
    pub fn to_server_config(&self) -> anyhow::Result<ServerConfig> {
        let s = &self.server;

        let private_key = match &self.keys.private_key_file {
            Some(path) => Some(Arc::new(
                KemPrivateKey::load(path)
                    .with_context(|| format!("loading private key {}", path.display()))?,
            )),
            None => None,
        };
        let cookie_key = self
            .keys
            .cookie_key
            .as_deref()
            .map(AeadKey::from_hex)
            .transpose()
            .context("invalid cookie_key")?;
        let decode_cookie_keys = self
            .keys
            .decode_cookie_keys
            .iter()
            .map(|k| AeadKey::from_hex(k))
            .collect::<Result<Vec<_>, _>>()
            .context("invalid entry in decode_cookie_keys")?;

        Ok(ServerConfig {
            listen_addrs: self.listen_addrs()?,
            private_key,
            cookie_key,
            decode_cookie_keys,
            read_routines: s.read_routines,
            max_ping_interval: Duration::from_secs(s.max_ping_interval_secs),
            min_ping_interval: Duration::from_secs(s.min_ping_interval_secs),
            max_ban_score: s.max_ban_score,
            timeout_sweep_interval: Duration::from_secs(s.timeout_sweep_interval_secs),
            payment_sweep_interval: Duration::from_secs(s.payment_sweep_interval_secs),
            session_listing_interval: Duration::from_secs(s.session_listing_interval_secs),
            min_session_listing_interval: Duration::from_secs(
                s.min_session_listing_interval_secs,
            ),
            rotate_cookie_lifetime: Duration::from_secs(s.rotate_cookie_lifetime_secs),
            stats_report_interval: Duration::from_secs(s.stats_report_interval_secs),
            reply_error_codes: s.reply_error_codes,
            log_read_loop_errors: s.log_read_loop_errors,
            disable_force_listing: s.disable_force_listing,
            ignore_kernel_stats: s.ignore_kernel_stats,
            socket_buffer_size: s.socket_buffer_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.listen, vec!["0.0.0.0:7010"]);
        assert_eq!(config.server.max_ban_score, 50);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = ["127.0.0.1:9000", "[::1]:9000"]
            reply_error_codes = true
            "#,
        )
        .unwrap();

        assert_eq!(config.server.read_routines, 1);
        assert_eq!(config.server.min_ping_interval_secs, 5);
        assert_eq!(config.listen_addrs().unwrap().len(), 2);

        let server = config.to_server_config().unwrap();
        assert!(server.reply_error_codes);
        assert!(server.private_key.is_none());
        assert_eq!(server.max_ping_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.server.listen = vec!["not an address".into()];
        assert!(config.validate().is_err());

        config.server.listen = default_listen();
        config.server.read_routines = 0;
        assert!(config.validate().is_err());

        config.server.read_routines = 4;
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());

        config.logging.level = "debug".into();
        config.keys.cookie_key = Some("zz".into());
        assert!(config.validate().is_err());

        config.keys.cookie_key = Some("11".repeat(32));
        assert!(config.validate().is_ok());
        assert!(config.to_server_config().unwrap().cookie_key.is_some());
    }

    #[test]
    fn test_private_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.key");
        KemPrivateKey::generate().save(&path).unwrap();

        let mut config = Config::default();
        config.keys.private_key_file = Some(path);
        assert!(config.to_server_config().unwrap().encrypted());
    }

    #[test]
    fn test_toml_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.server.listen, deserialized.server.listen);
        assert_eq!(
            config.server.socket_buffer_size,
            deserialized.server.socket_buffer_size
        );
    }
}
