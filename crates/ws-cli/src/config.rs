//! Configuration loading and management.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use chrono::{FixedOffset, Local, Offset};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use regex::Regex;
use serde::{Deserialize, Serialize};
use ws_db::EngineSettings;

/// `+08:00`, `-0530`, `Z` or `UTC`.
static UTC_OFFSET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:(Z|UTC)|([+-])(\d{2}):?(\d{2}))$").unwrap());

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,
    /// Offset whose calendar days bucket statistics; host offset when unset.
    pub utc_offset: Option<String>,
    pub idle_threshold_seconds: i64,
    pub heartbeat_interval_seconds: i64,
    pub offline_threshold_seconds: i64,
    pub sweep_interval_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub raw_event_retention_days: i64,
    pub live_send_timeout_ms: u64,
    /// JSONL file that receives live updates while serving.
    pub live_feed_path: Option<PathBuf>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("utc_offset", &self.utc_offset)
            .field("offline_threshold_seconds", &self.offline_threshold_seconds)
            .field("sweep_interval_seconds", &self.sweep_interval_seconds)
            .field("live_feed_path", &self.live_feed_path)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("worksentry.db"),
            utc_offset: None,
            idle_threshold_seconds: 300,
            heartbeat_interval_seconds: 300,
            offline_threshold_seconds: 600,
            sweep_interval_seconds: 60,
            cleanup_interval_seconds: 6 * 60 * 60,
            raw_event_retention_days: 7,
            live_send_timeout_ms: 2000,
            live_feed_path: None,
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        // Load from default config location
        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        // Load from specified config file
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Load from environment variables (WS_*)
        figment = figment.merge(Env::prefixed("WS_"));

        figment.extract()
    }

    /// Engine thresholds and calendar offset for the storage layer.
    pub fn engine_settings(&self) -> anyhow::Result<EngineSettings> {
        let utc_offset = match self.utc_offset.as_deref() {
            Some(value) => parse_utc_offset(value)
                .with_context(|| format!("invalid utc_offset: {value}"))?,
            None => Local::now().offset().fix(),
        };
        Ok(EngineSettings {
            utc_offset,
            idle_threshold_seconds: self.idle_threshold_seconds,
            heartbeat_interval_seconds: self.heartbeat_interval_seconds,
            offline_threshold_seconds: self.offline_threshold_seconds,
        })
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub const fn live_send_timeout(&self) -> Duration {
        Duration::from_millis(self.live_send_timeout_ms)
    }
}

/// Parses a fixed UTC offset such as `+08:00`.
pub fn parse_utc_offset(value: &str) -> anyhow::Result<FixedOffset> {
    let Some(caps) = UTC_OFFSET_RE.captures(value.trim()) else {
        anyhow::bail!("expected an offset like +08:00, -05:30 or Z");
    };
    if caps.get(1).is_some() {
        return FixedOffset::east_opt(0).context("zero offset");
    }
    let hours: i32 = caps[3].parse().context("failed to parse offset hours")?;
    let minutes: i32 = caps[4].parse().context("failed to parse offset minutes")?;
    if hours > 23 || minutes > 59 {
        anyhow::bail!("offset out of range");
    }
    let seconds = (hours * 60 + minutes) * 60;
    let seconds = if &caps[2] == "-" { -seconds } else { seconds };
    FixedOffset::east_opt(seconds).context("offset out of range")
}

/// Returns the platform-specific config directory for worksentry.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("worksentry"))
}

/// Returns the platform-specific data directory for worksentry.
///
/// On Linux: `~/.local/share/worksentry`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("worksentry"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirs_data_path_ends_with_worksentry() {
        let path = dirs_data_path().unwrap();
        assert_eq!(path.file_name().unwrap(), "worksentry");
    }

    #[test]
    fn test_default_config_uses_data_dir_for_db() {
        let config = Config::default();
        let data_dir = dirs_data_path().unwrap();
        assert_eq!(config.database_path, data_dir.join("worksentry.db"));
        assert_eq!(config.offline_threshold_seconds, 600);
        assert_eq!(config.cleanup_interval(), Duration::from_secs(21_600));
    }

    #[test]
    fn test_config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "database_path = \"/tmp/ws-test.db\"\nutc_offset = \"+08:00\"\noffline_threshold_seconds = 900\n",
        )
        .unwrap();

        let config = Config::load_from(Some(&path)).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/ws-test.db"));
        assert_eq!(config.offline_threshold_seconds, 900);
        assert_eq!(config.idle_threshold_seconds, 300);

        let settings = config.engine_settings().unwrap();
        assert_eq!(settings.utc_offset.local_minus_utc(), 8 * 3600);
        assert_eq!(settings.offline_threshold_seconds, 900);
    }

    #[test]
    fn test_parse_utc_offset() {
        assert_eq!(parse_utc_offset("+08:00").unwrap().local_minus_utc(), 28_800);
        assert_eq!(parse_utc_offset("-0530").unwrap().local_minus_utc(), -19_800);
        assert_eq!(parse_utc_offset("Z").unwrap().local_minus_utc(), 0);
        assert!(parse_utc_offset("+25:00").is_err());
        assert!(parse_utc_offset("Asia/Shanghai").is_err());
    }
}
