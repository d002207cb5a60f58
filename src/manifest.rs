//! Configuration file parsing for recordshell
//!
//! Parses the optional system-wide `/etc/recordshell.toml` using serde.
//! The path is fixed: the binary runs setuid root, so it never reads a file
//! named by the invoking user.

use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use nix::poll::PollTimeout;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Location of the system-wide configuration file
pub const SYSTEM_CONFIG: &str = "/etc/recordshell.toml";

/// Load the system-wide configuration, falling back to defaults when the
/// file does not exist
pub fn load_system() -> Result<SessionConfig> {
    let path = Path::new(SYSTEM_CONFIG);
    if !path.exists() {
        return Ok(SessionConfig::default());
    }
    load(path)
}

/// Load configuration from a file
pub fn load(path: &Path) -> Result<SessionConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: SessionConfig = toml::from_str(&content)?;
    config.validate()?;

    Ok(config)
}

/// Settings for one recording session
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Private IPv4 range scanned for the veth addresses
    pub address_pool: String,
    /// Text appended to `MAHIMAHI_SHELL_PREFIX` in the recorded shell
    pub shell_prefix: String,
    /// Idle ceiling of the event loop, in seconds
    pub idle_tick_secs: u64,
    /// Absolute path of ip(8)
    pub ip_command: PathBuf,
    /// Absolute path of iptables(8)
    pub iptables_command: PathBuf,
    /// Upstream timeout of the DNS proxy, in milliseconds
    pub dns_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address_pool: "100.64.0.0/10".to_string(),
            shell_prefix: "[record] ".to_string(),
            idle_tick_secs: 60,
            ip_command: PathBuf::from("/sbin/ip"),
            iptables_command: PathBuf::from("/sbin/iptables"),
            dns_timeout_ms: 2000,
        }
    }
}

impl SessionConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let pool = self.pool()?;
        if pool.prefix_len() > 30 {
            return Err(Error::ConfigValidation(format!(
                "address_pool {} is too small (needs at least 4 hosts)",
                pool
            )));
        }

        if self.idle_tick_secs == 0 {
            return Err(Error::ConfigValidation(
                "idle_tick_secs must be greater than zero".to_string(),
            ));
        }

        // The tick becomes a poll(2) timeout in milliseconds
        if let Err(e) = PollTimeout::try_from(self.idle_tick()) {
            return Err(Error::ConfigValidation(format!(
                "idle_tick_secs = {} is too long ({:?})",
                self.idle_tick_secs, e
            )));
        }

        for (key, path) in [
            ("ip_command", &self.ip_command),
            ("iptables_command", &self.iptables_command),
        ] {
            if !path.is_absolute() {
                return Err(Error::ConfigValidation(format!(
                    "{} must be an absolute path, got '{}'",
                    key,
                    path.display()
                )));
            }
        }

        Ok(())
    }

    /// The parsed private address pool
    pub fn pool(&self) -> Result<Ipv4Net> {
        self.address_pool.parse().map_err(|_| {
            Error::ConfigValidation(format!(
                "address_pool '{}' is not an IPv4 network",
                self.address_pool
            ))
        })
    }

    /// The event loop idle tick
    pub fn idle_tick(&self) -> Duration {
        Duration::from_secs(self.idle_tick_secs)
    }

    /// The DNS proxy upstream timeout
    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.idle_tick(), Duration::from_secs(60));
        assert_eq!(config.pool().unwrap().to_string(), "100.64.0.0/10");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: SessionConfig = toml::from_str(r#"shell_prefix = "[rec] ""#).unwrap();
        assert_eq!(config.shell_prefix, "[rec] ");
        assert_eq!(config.idle_tick_secs, 60);
        assert_eq!(config.ip_command, PathBuf::from("/sbin/ip"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result: std::result::Result<SessionConfig, _> = toml::from_str("colour = \"red\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_relative_tool_path_rejected() {
        let config = SessionConfig {
            iptables_command: PathBuf::from("iptables"),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigValidation(_))));
    }

    #[test]
    fn test_tiny_pool_rejected() {
        let config = SessionConfig {
            address_pool: "10.0.0.0/31".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ipv6_pool_rejected() {
        let config = SessionConfig {
            address_pool: "fd00::/64".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_tick_rejected() {
        let config = SessionConfig {
            idle_tick_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tick_beyond_poll_range_rejected() {
        let config = SessionConfig {
            idle_tick_secs: u64::MAX / 1000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigValidation(_))));

        let hour = SessionConfig {
            idle_tick_secs: 3600,
            ..Default::default()
        };
        assert!(hour.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recordshell.toml");
        fs::write(&path, "idle_tick_secs = 30\naddress_pool = \"10.99.0.0/16\"\n").unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.idle_tick_secs, 30);
        assert_eq!(config.pool().unwrap().to_string(), "10.99.0.0/16");
    }

    #[test]
    fn test_load_missing_file() {
        let err = load(Path::new("/nonexistent/recordshell.toml")).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }
}
