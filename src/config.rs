//! Pool configuration.
//!
//! Values come from defaults, then an optional TOML file, then environment
//! variables (read through `dotenvy`, so a `.env` file works too).
//!
//! ```toml
//! address = "127.0.0.1:7002"
//! size = 8
//! timeout_ms = 300
//! valid_secs = 60
//! codec = "pickle"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::conn::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_TIMEOUT};
use crate::error::ConfigError;
use crate::protocol::CodecKind;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:7002";
pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_VALID_DURATION: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(150);

/// Configuration for a [`crate::Pool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Daemon `host:port`.
    pub address: String,
    /// Number of persistent connections.
    pub size: usize,
    /// Read/write timeout for one request/reply cycle.
    pub timeout: Duration,
    /// Dial timeout.
    pub connect_timeout: Duration,
    /// How long a slot is trusted before it is revalidated on borrow.
    pub valid_duration: Duration,
    /// Backoff unit; the n-th consecutive failure waits n times this.
    pub base_retry_interval: Duration,
    /// Payload encoding spoken by the daemon.
    pub codec: CodecKind,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            size: DEFAULT_POOL_SIZE,
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            valid_duration: DEFAULT_VALID_DURATION,
            base_retry_interval: DEFAULT_RETRY_INTERVAL,
            codec: CodecKind::default(),
        }
    }
}

/// On-disk shape. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    address: Option<String>,
    size: Option<usize>,
    timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    valid_secs: Option<u64>,
    retry_base_ms: Option<u64>,
    codec: Option<CodecKind>,
}

impl PoolConfig {
    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    /// Defaults overridden by a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(s)?;
        let mut cfg = Self::default();
        cfg.apply_file(file);
        Ok(cfg)
    }

    /// Load `path`, then apply environment overrides, then validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut cfg = Self::from_toml_str(&content)?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(address) = file.address {
            self.address = address;
        }
        if let Some(size) = file.size {
            self.size = size;
        }
        if let Some(ms) = file.timeout_ms {
            self.timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.connect_timeout_ms {
            self.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = file.valid_secs {
            self.valid_duration = Duration::from_secs(secs);
        }
        if let Some(ms) = file.retry_base_ms {
            self.base_retry_interval = Duration::from_millis(ms);
        }
        if let Some(codec) = file.codec {
            self.codec = codec;
        }
    }

    /// Unparseable values are ignored and the current value kept.
    fn apply_env(&mut self) {
        if let Ok(addr) = dotenvy::var("CARBONLINK_ADDRESS") {
            self.address = addr;
        }

        if let Ok(val) = dotenvy::var("CARBONLINK_POOL_SIZE")
            && let Ok(n) = val.parse()
        {
            self.size = n;
        }

        if let Ok(val) = dotenvy::var("CARBONLINK_TIMEOUT_MS")
            && let Ok(ms) = val.parse()
        {
            self.timeout = Duration::from_millis(ms);
        }

        if let Ok(val) = dotenvy::var("CARBONLINK_CONNECT_TIMEOUT_MS")
            && let Ok(ms) = val.parse()
        {
            self.connect_timeout = Duration::from_millis(ms);
        }

        if let Ok(val) = dotenvy::var("CARBONLINK_VALID_SECS")
            && let Ok(secs) = val.parse()
        {
            self.valid_duration = Duration::from_secs(secs);
        }

        if let Ok(val) = dotenvy::var("CARBONLINK_RETRY_BASE_MS")
            && let Ok(ms) = val.parse()
        {
            self.base_retry_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = dotenvy::var("CARBONLINK_CODEC")
            && let Ok(codec) = val.parse()
        {
            self.codec = codec;
        }
    }

    /// Socket timeouts of zero are rejected by the OS, a zero TTL sends
    /// every borrowed slot to revalidation, and a zero backoff unit would
    /// make a dead daemon spin the reconnect loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::Invalid("address is empty".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid("timeout must be non-zero".to_string()));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "connect timeout must be non-zero".to_string(),
            ));
        }
        if self.valid_duration.is_zero() {
            return Err(ConfigError::Invalid(
                "slot validity must be non-zero".to_string(),
            ));
        }
        if self.base_retry_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "retry interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    struct EnvGuard(&'static str);

    impl EnvGuard {
        fn set(key: &'static str, val: &str) -> Self {
            unsafe { std::env::set_var(key, val) };
            Self(key)
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            unsafe { std::env::remove_var(self.0) };
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.address, "127.0.0.1:7002");
        assert_eq!(config.timeout, Duration::from_millis(300));
        assert_eq!(config.valid_duration, Duration::from_secs(60));
        assert_eq!(config.base_retry_interval, Duration::from_millis(150));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_overrides_subset() {
        let config = PoolConfig::from_toml_str(
            r#"
            address = "cache01:7002"
            size = 8
            timeout_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.address, "cache01:7002");
        assert_eq!(config.size, 8);
        assert_eq!(config.timeout, Duration::from_millis(500));
        assert_eq!(config.valid_duration, DEFAULT_VALID_DURATION);
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        let err = PoolConfig::from_toml_str("adress = \"typo:1\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = PoolConfig {
            timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let config = PoolConfig {
            valid_duration: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let from_file = PoolConfig::from_toml_str("valid_secs = 0").unwrap();
        assert!(from_file.validate().is_err());
    }

    #[test]
    fn test_toml_selects_codec() {
        let config = PoolConfig::from_toml_str("codec = \"msgpack\"").unwrap();
        assert_eq!(config.codec, CodecKind::Msgpack);
        assert_eq!(PoolConfig::default().codec, CodecKind::Pickle);
        assert!(PoolConfig::from_toml_str("codec = \"json\"").is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        let _size = EnvGuard::set("CARBONLINK_POOL_SIZE", "16");
        let _retry = EnvGuard::set("CARBONLINK_RETRY_BASE_MS", "not-a-number");
        let _codec = EnvGuard::set("CARBONLINK_CODEC", "msgpack");

        let config = PoolConfig::from_env();
        assert_eq!(config.size, 16);
        assert_eq!(config.codec, CodecKind::Msgpack);
        assert_eq!(config.base_retry_interval, DEFAULT_RETRY_INTERVAL);
    }

    #[test]
    #[serial]
    fn test_load_applies_env_after_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "size = 2\nvalid_secs = 10").unwrap();
        let _size = EnvGuard::set("CARBONLINK_POOL_SIZE", "3");

        let config = PoolConfig::load(file.path()).unwrap();
        assert_eq!(config.size, 3);
        assert_eq!(config.valid_duration, Duration::from_secs(10));
    }
}
