//! Engine and service configuration.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::directory::DirectoryConfig;
use crate::label::PrintingConfig;

/// Configuration for the scan engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lifetime of a supervisor grant, and of a request waiting for a PIN
    pub authorization_ttl_secs: u64,

    /// Wrong PINs allowed per branch within `pin_failure_window_secs`
    pub pin_max_failures: u32,

    /// Sliding window for counting wrong PINs
    pub pin_failure_window_secs: u64,

    /// Sessions without activity for this long are purged
    pub session_idle_timeout_secs: u64,

    /// Produce a domestic label on intake of an external-express shipment
    pub relabel_external_express: bool,

    /// Service type given to external-express packages created on first contact
    pub external_express_service_type: String,

    /// Offset of the business day from UTC, in minutes
    pub business_utc_offset_minutes: i32,

    /// Interval for rebuilding today's stats from the event log (milliseconds)
    /// Set to None to disable the rebuild loop
    pub stats_rebuild_interval_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            authorization_ttl_secs: 180,
            pin_max_failures: 5,
            pin_failure_window_secs: 300,
            session_idle_timeout_secs: 8 * 60 * 60,
            relabel_external_express: true,
            external_express_service_type: "EXPRESS".to_string(),
            business_utc_offset_minutes: 0,
            stats_rebuild_interval_ms: Some(300_000), // every 5 minutes
        }
    }
}

/// Longest accepted TTL, window or idle timeout.
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 60 * 60;

/// Widest real UTC offset is +14:00.
pub const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

fn bounded_secs(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

impl EngineConfig {
    /// Reject values the engine cannot turn into durations or windows.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, secs) in [
            ("authorization_ttl_secs", self.authorization_ttl_secs),
            ("pin_failure_window_secs", self.pin_failure_window_secs),
            ("session_idle_timeout_secs", self.session_idle_timeout_secs),
        ] {
            anyhow::ensure!(
                (1..=MAX_DURATION_SECS).contains(&secs),
                "engine.{name} must be between 1 and {MAX_DURATION_SECS}, got {secs}"
            );
        }
        anyhow::ensure!(
            self.pin_max_failures >= 1,
            "engine.pin_max_failures must be at least 1"
        );
        anyhow::ensure!(
            self.business_utc_offset_minutes.unsigned_abs() <= MAX_UTC_OFFSET_MINUTES.unsigned_abs(),
            "engine.business_utc_offset_minutes must be within ±{MAX_UTC_OFFSET_MINUTES}, got {}",
            self.business_utc_offset_minutes
        );
        if let Some(ms) = self.stats_rebuild_interval_ms {
            anyhow::ensure!(
                (1..=MAX_DURATION_SECS * 1000).contains(&ms),
                "engine.stats_rebuild_interval_ms must be between 1 and {}, got {ms}",
                MAX_DURATION_SECS * 1000
            );
        }
        Ok(())
    }

    // Accessors clamp so a config built in code without `validate` cannot
    // overflow chrono arithmetic.

    pub fn authorization_ttl(&self) -> Duration {
        bounded_secs(self.authorization_ttl_secs)
    }

    pub fn pin_failure_window(&self) -> Duration {
        bounded_secs(self.pin_failure_window_secs)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        bounded_secs(self.session_idle_timeout_secs)
    }

    fn business_offset(&self) -> Duration {
        Duration::minutes(
            self.business_utc_offset_minutes
                .clamp(-MAX_UTC_OFFSET_MINUTES, MAX_UTC_OFFSET_MINUTES) as i64,
        )
    }

    /// Business day a timestamp falls on.
    pub fn business_date(&self, at: DateTime<Utc>) -> NaiveDate {
        (at + self.business_offset()).date_naive()
    }

    /// UTC window `[from, to)` covering one business day.
    pub fn business_day_window(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let from = date.and_time(NaiveTime::MIN).and_utc() - self.business_offset();
        (from, from + Duration::days(1))
    }
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// PostgreSQL connection string; in-memory storage when absent
    pub database_url: Option<String>,
    /// Emit logs as JSON lines
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            json_logs: false,
        }
    }
}

/// Full service configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Printing bridge; labels are returned without a URL when absent
    #[serde(default)]
    pub printing: Option<PrintingConfig>,
    #[serde(default)]
    pub directory: DirectoryConfig,
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.engine.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_business_date_uses_offset() {
        let config = EngineConfig {
            business_utc_offset_minutes: -6 * 60,
            ..Default::default()
        };
        // 03:00 UTC is still the previous evening six hours west
        let at = Utc.with_ymd_and_hms(2024, 3, 19, 3, 0, 0).unwrap();
        assert_eq!(
            config.business_date(at),
            NaiveDate::from_ymd_opt(2024, 3, 18).unwrap()
        );

        let (from, to) = config.business_day_window(NaiveDate::from_ymd_opt(2024, 3, 18).unwrap());
        assert_eq!(from, Utc.with_ymd_and_hms(2024, 3, 18, 6, 0, 0).unwrap());
        assert_eq!(to - from, Duration::days(1));
        assert!(at >= from && at < to);
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [engine]
            authorization_ttl_secs = 120

            [server]
            listen_addr = "127.0.0.1:9000"

            [[directory.operators]]
            id = 11
            branch_id = 7

            [[directory.supervisors]]
            id = 3
            branch_id = 7
            role = "supervisor"
            pin_sha256 = "03ac674216f3e15c761ee1a5e255f067953623c8b388b4459e13f978d7c846f4"
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.authorization_ttl_secs, 120);
        assert_eq!(config.engine.pin_max_failures, 5);
        assert_eq!(config.server.listen_addr, "127.0.0.1:9000");
        assert!(config.server.database_url.is_none());
        assert!(config.printing.is_none());
        assert_eq!(config.directory.operators.len(), 1);
        assert_eq!(config.directory.supervisors.len(), 1);
    }

    #[test]
    fn test_bundled_config_parses() {
        let config = AppConfig::from_toml(include_str!("../config/scan-engine.toml")).unwrap();
        assert_eq!(config.engine.business_utc_offset_minutes, -240);
        assert_eq!(config.directory.operators.len(), 2);
    }

    #[test]
    fn test_out_of_range_durations_are_rejected() {
        let err = AppConfig::from_toml(
            r#"
            [engine]
            authorization_ttl_secs = 9223372036854775807
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("authorization_ttl_secs"));

        let err = AppConfig::from_toml(
            r#"
            [engine]
            business_utc_offset_minutes = 100000
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("business_utc_offset_minutes"));

        assert!(AppConfig::from_toml("[engine]\nstats_rebuild_interval_ms = 0\n").is_err());
        assert!(AppConfig::from_toml("[engine]\npin_max_failures = 0\n").is_err());
    }

    #[test]
    fn test_accessors_clamp_unvalidated_values() {
        let config = EngineConfig {
            authorization_ttl_secs: u64::MAX,
            business_utc_offset_minutes: i32::MIN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(
            config.authorization_ttl(),
            Duration::seconds(MAX_DURATION_SECS as i64)
        );
        let at = Utc::now();
        assert!(config.business_date(at) <= at.date_naive());
    }
}
