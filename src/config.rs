// src/config.rs
//! Runtime configuration: scrape intervals, fetch tuning, retention, and
//! the configured feed list. TOML files with env-var path overrides; every
//! field has a default so a bare deployment still boots.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::ingest::fetch::RetryPolicy;
use crate::registry::SourceTier;

pub const ENV_APP_CONFIG_PATH: &str = "APP_CONFIG_PATH";
pub const ENV_SOURCES_CONFIG_PATH: &str = "SOURCES_CONFIG_PATH";
pub const DEFAULT_APP_CONFIG_PATH: &str = "config/app.toml";
pub const DEFAULT_SOURCES_CONFIG_PATH: &str = "config/sources.toml";

/// Compiled-in source list, used when no file is present.
const DEFAULT_SOURCES_TOML: &str = include_str!("../config/sources.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Quick cycle period (primary sources only).
    #[serde(default = "default_quick_interval_secs")]
    pub quick_interval_secs: u64,
    /// Full cycle period (all sources).
    #[serde(default = "default_full_interval_secs")]
    pub full_interval_secs: u64,
    /// Delay before the startup Quick cycle.
    #[serde(default = "default_startup_delay_secs")]
    pub startup_delay_secs: u64,
    /// Simultaneous per-source fetches within one cycle.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default = "default_fetch_max_attempts")]
    pub fetch_max_attempts: u32,
    #[serde(default = "default_fetch_base_delay_ms")]
    pub fetch_base_delay_ms: u64,
    #[serde(default = "default_fetch_max_delay_ms")]
    pub fetch_max_delay_ms: u64,
    /// Consecutive failures before a source is auto-blacklisted.
    #[serde(default = "default_blacklist_threshold")]
    pub blacklist_threshold: u32,
    /// Articles older than this are removed by the daily purge.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_quick_interval_secs() -> u64 {
    15 * 60
}
fn default_full_interval_secs() -> u64 {
    12 * 3600
}
fn default_startup_delay_secs() -> u64 {
    120
}
fn default_fetch_concurrency() -> usize {
    5
}
fn default_fetch_max_attempts() -> u32 {
    5
}
fn default_fetch_base_delay_ms() -> u64 {
    1_000
}
fn default_fetch_max_delay_ms() -> u64 {
    30_000
}
fn default_blacklist_threshold() -> u32 {
    5
}
fn default_retention_days() -> i64 {
    180
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            quick_interval_secs: default_quick_interval_secs(),
            full_interval_secs: default_full_interval_secs(),
            startup_delay_secs: default_startup_delay_secs(),
            fetch_concurrency: default_fetch_concurrency(),
            fetch_max_attempts: default_fetch_max_attempts(),
            fetch_base_delay_ms: default_fetch_base_delay_ms(),
            fetch_max_delay_ms: default_fetch_max_delay_ms(),
            blacklist_threshold: default_blacklist_threshold(),
            retention_days: default_retention_days(),
        }
    }
}

impl AppConfig {
    /// Load from `$APP_CONFIG_PATH`, then `config/app.toml`, then defaults.
    pub fn load() -> anyhow::Result<Self> {
        if let Ok(p) = std::env::var(ENV_APP_CONFIG_PATH) {
            return Self::from_file(Path::new(&p));
        }
        let default_path = Path::new(DEFAULT_APP_CONFIG_PATH);
        if default_path.exists() {
            return Self::from_file(default_path);
        }
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading app config at {}: {e}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.fetch_max_attempts.max(1),
            base_delay: Duration::from_millis(self.fetch_base_delay_ms),
            max_delay: Duration::from_millis(self.fetch_max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_tier")]
    pub tier: SourceTier,
}

fn default_tier() -> SourceTier {
    SourceTier::Secondary
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesFile {
    pub sources: Vec<SourceConfig>,
}

impl SourcesFile {
    /// Load from `$SOURCES_CONFIG_PATH`, then `config/sources.toml`, then
    /// the compiled-in list.
    pub fn load() -> anyhow::Result<Self> {
        if let Ok(p) = std::env::var(ENV_SOURCES_CONFIG_PATH) {
            return Self::from_file(Path::new(&p));
        }
        let default_path = Path::new(DEFAULT_SOURCES_CONFIG_PATH);
        if default_path.exists() {
            return Self::from_file(default_path);
        }
        Self::from_toml_str(DEFAULT_SOURCES_TOML)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading sources at {}: {e}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_toml_yields_all_defaults() {
        let cfg = AppConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.quick_interval_secs, 900);
        assert_eq!(cfg.full_interval_secs, 43_200);
        assert_eq!(cfg.fetch_concurrency, 5);
        assert_eq!(cfg.fetch_max_attempts, 5);
        assert_eq!(cfg.blacklist_threshold, 5);
        assert_eq!(cfg.retention_days, 180);
    }

    #[test]
    fn file_values_override_defaults() {
        let content = r#"
            quick_interval_secs = 60
            fetch_concurrency = 2
            retention_days = 30
        "#;
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();

        let cfg = AppConfig::from_file(f.path()).unwrap();
        assert_eq!(cfg.quick_interval_secs, 60);
        assert_eq!(cfg.fetch_concurrency, 2);
        assert_eq!(cfg.retention_days, 30);
        // Untouched fields keep defaults.
        assert_eq!(cfg.full_interval_secs, 43_200);
    }

    #[test]
    fn retry_policy_clamps_attempts_to_at_least_one() {
        let cfg = AppConfig::from_toml_str("fetch_max_attempts = 0").unwrap();
        assert_eq!(cfg.retry_policy().max_attempts, 1);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(AppConfig::from_toml_str("this is not {{ toml").is_err());
        assert!(SourcesFile::from_toml_str("sources = 3").is_err());
    }

    #[test]
    fn sources_parse_with_default_tier() {
        let content = r#"
            [[sources]]
            name = "WHO News"
            url = "https://who.example/rss"
            tier = "primary"

            [[sources]]
            name = "Niche Blog"
            url = "https://blog.example/rss"
        "#;
        let file = SourcesFile::from_toml_str(content).unwrap();
        assert_eq!(file.sources.len(), 2);
        assert_eq!(file.sources[0].tier, SourceTier::Primary);
        assert_eq!(file.sources[1].tier, SourceTier::Secondary);
    }

    #[serial_test::serial]
    #[test]
    fn env_path_takes_precedence_for_sources() {
        let content = r#"
            [[sources]]
            name = "Env Feed"
            url = "https://env.example/rss"
            tier = "primary"
        "#;
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();

        std::env::set_var(ENV_SOURCES_CONFIG_PATH, f.path());
        let file = SourcesFile::load().unwrap();
        std::env::remove_var(ENV_SOURCES_CONFIG_PATH);

        assert_eq!(file.sources.len(), 1);
        assert_eq!(file.sources[0].name, "Env Feed");
    }

    #[serial_test::serial]
    #[test]
    fn env_path_pointing_nowhere_is_an_error() {
        std::env::set_var(ENV_SOURCES_CONFIG_PATH, "/nonexistent/sources.toml");
        let res = SourcesFile::load();
        std::env::remove_var(ENV_SOURCES_CONFIG_PATH);
        assert!(res.is_err());
    }

    #[test]
    fn shipped_sources_file_parses() {
        let file = SourcesFile::from_toml_str(DEFAULT_SOURCES_TOML).unwrap();
        assert!(!file.sources.is_empty());
        assert!(file
            .sources
            .iter()
            .any(|s| s.tier == SourceTier::Primary));
    }
}
