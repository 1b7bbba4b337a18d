//! Runtime settings: defaults, then an optional YAML file, then `PORTAL_*`
//! environment variables.
use crate::archive::DEFAULT_RETENTION_DAYS;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Longest archive retention accepted, ten years.
pub const MAX_RETENTION_DAYS: i64 = 3650;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortalConfig {
    pub db_path: PathBuf,
    pub bind_addr: SocketAddr,
    /// Days between archive and hard delete.
    pub retention_days: i64,
    pub sweep_interval_secs: u64,
    /// Default and ceiling for activity feed pages.
    pub feed_limit: usize,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("portal.db"),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            retention_days: DEFAULT_RETENTION_DAYS,
            sweep_interval_secs: 3600,
            feed_limit: 50,
        }
    }
}

impl PortalConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw).context("parse portal config yaml")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read portal config {}", path.display()))?;
        Self::from_yaml_str(&raw)
    }

    /// Apply `PORTAL_*` overrides read through `lookup`.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PORTAL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("PORTAL_BIND_ADDR") {
            self.bind_addr = v.parse().with_context(|| format!("PORTAL_BIND_ADDR '{v}'"))?;
        }
        if let Some(v) = lookup("PORTAL_RETENTION_DAYS") {
            self.retention_days = v.parse().with_context(|| format!("PORTAL_RETENTION_DAYS '{v}'"))?;
        }
        if let Some(v) = lookup("PORTAL_SWEEP_INTERVAL_SECS") {
            self.sweep_interval_secs = v
                .parse()
                .with_context(|| format!("PORTAL_SWEEP_INTERVAL_SECS '{v}'"))?;
        }
        if let Some(v) = lookup("PORTAL_FEED_LIMIT") {
            self.feed_limit = v.parse().with_context(|| format!("PORTAL_FEED_LIMIT '{v}'"))?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Process entry point: `.env.local` if present, the file named by
    /// `PORTAL_CONFIG` if set, then the environment.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::from_filename(".env.local");
        let base = match std::env::var("PORTAL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        base.with_env(|key| std::env::var(key).ok())
    }

    fn validate(&self) -> Result<()> {
        if self.retention_days < 1 {
            bail!("retention_days must be at least 1, got {}", self.retention_days);
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            bail!(
                "retention_days must be at most {MAX_RETENTION_DAYS}, got {}",
                self.retention_days
            );
        }
        if self.sweep_interval_secs == 0 {
            bail!("sweep_interval_secs must be positive");
        }
        if self.feed_limit == 0 {
            bail!("feed_limit must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_yaml_is_defaults() {
        let config = PortalConfig::from_yaml_str("").unwrap();
        assert_eq!(config, PortalConfig::default());
        assert_eq!(config.retention_days, 30);
    }

    #[test]
    fn yaml_overrides_only_what_it_names() {
        let config = PortalConfig::from_yaml_str("retention_days: 7\nfeed_limit: 20\n").unwrap();
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.feed_limit, 20);
        assert_eq!(config.sweep_interval_secs, 3600);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(PortalConfig::from_yaml_str("retention: 7\n").is_err());
    }

    #[test]
    fn env_wins_over_file() {
        let env = HashMap::from([
            ("PORTAL_RETENTION_DAYS", "14"),
            ("PORTAL_BIND_ADDR", "0.0.0.0:9000"),
        ]);
        let config = PortalConfig::from_yaml_str("retention_days: 7\n")
            .unwrap()
            .with_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.retention_days, 14);
        assert_eq!(config.bind_addr, "0.0.0.0:9000".parse().unwrap());
    }

    #[test]
    fn bad_env_values_are_errors() {
        let result = PortalConfig::default().with_env(|k| {
            (k == "PORTAL_RETENTION_DAYS").then(|| "0".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn oversized_retention_is_rejected() {
        let result = PortalConfig::default().with_env(|k| {
            (k == "PORTAL_RETENTION_DAYS").then(|| "10000000".to_string())
        });
        assert!(result.is_err());

        assert!(PortalConfig::from_yaml_str("retention_days: 3650\n").is_ok());
        assert!(PortalConfig::from_yaml_str("retention_days: 3651\n").is_err());
    }
}
