//! Daemon runtime configuration, loaded from YAML at startup.
//!
//! This configures the process (listen addresses, budgets, timeouts), not
//! the metrics to collect; those arrive as [`crate::schema::MetricsConfig`]
//! messages over the config ingest surface.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the metricsd daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Health/metrics HTTP server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Uid map budgets.
    #[serde(default)]
    pub uid_map: UidMapConfig,

    /// Puller behavior.
    #[serde(default)]
    pub pullers: PullerConfig,

    /// Metric configurations loaded at startup, keyed by config id, each a
    /// path to a YAML metrics-config file. More can be installed at runtime.
    #[serde(default)]
    pub bootstrap_configs: Vec<BootstrapConfig>,
}

/// One metrics config installed at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapConfig {
    pub uid: i32,
    pub id: i64,
    pub path: String,
}

/// Health/metrics HTTP server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: "127.0.0.1:9464".
    #[serde(default = "default_health_addr")]
    pub addr: String,

    /// Enable the server. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Uid map budgets.
#[derive(Debug, Deserialize)]
pub struct UidMapConfig {
    /// Change-log byte budget. Default: 100 KiB.
    #[serde(default = "default_uid_map_bytes")]
    pub max_bytes: usize,
}

/// Puller behavior.
#[derive(Debug, Deserialize)]
pub struct PullerConfig {
    /// Per-atom pull deadline. Default: 10s.
    #[serde(default = "default_pull_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_health_addr() -> String {
    "127.0.0.1:9464".to_string()
}

fn default_true() -> bool {
    true
}

fn default_uid_map_bytes() -> usize {
    100 * 1024
}

fn default_pull_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            health: HealthConfig::default(),
            uid_map: UidMapConfig::default(),
            pullers: PullerConfig::default(),
            bootstrap_configs: Vec::new(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
            enabled: true,
        }
    }
}

impl Default for UidMapConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_uid_map_bytes(),
        }
    }
}

impl Default for PullerConfig {
    fn default() -> Self {
        Self {
            timeout: default_pull_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.uid_map.max_bytes == 0 {
            bail!("uid_map.max_bytes must be positive");
        }
        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when health.enabled");
        }
        if self.pullers.timeout.is_zero() {
            bail!("pullers.timeout must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.health.addr, "127.0.0.1:9464");
        assert_eq!(cfg.uid_map.max_bytes, 100 * 1024);
        assert_eq!(cfg.pullers.timeout, Duration::from_secs(10));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
log_level: debug
health:
  addr: "0.0.0.0:9999"
uid_map:
  max_bytes: 4096
pullers:
  timeout: 2s
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parses");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.health.addr, "0.0.0.0:9999");
        assert_eq!(cfg.uid_map.max_bytes, 4096);
        assert_eq!(cfg.pullers.timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_validation_rejects_zero_budget() {
        let mut cfg = Config::default();
        cfg.uid_map.max_bytes = 0;
        let err = cfg.validate().expect_err("rejects");
        assert!(err.to_string().contains("max_bytes"));
    }

    #[test]
    fn test_validation_rejects_empty_health_addr() {
        let mut cfg = Config::default();
        cfg.health.addr = String::new();
        let err = cfg.validate().expect_err("rejects");
        assert!(err.to_string().contains("health.addr"));
    }
}
