//! Configuration management
//!
//! Loads `AppConfig` from a TOML file. Every section and field has a default,
//! so an absent file (or a partial one) yields a working configuration.

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `[auth].token_secret`.
pub const TOKEN_SECRET_ENV: &str = "FIELDWATCH_TOKEN_SECRET";

/// Upper bounds for duration settings; larger values overflow timestamp math.
pub const MAX_CLOCK_SKEW_SECS: u64 = 86_400;
pub const MAX_COOLDOWN_SECS: u64 = 30 * 86_400;
pub const MAX_CACHE_TTL_SECS: u64 = 86_400;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub api: ApiSection,
    pub auth: AuthConfig,
    pub geofence: GeofenceConfig,
    pub compliance: ComplianceConfig,
    pub anomaly: AnomalyConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = ProjectDirs::from("dev", "fieldwatch", "fieldwatch")
            .map(|dirs| dirs.data_dir().join("fieldwatch.duckdb"))
            .unwrap_or_else(|| PathBuf::from("fieldwatch.duckdb"));
        Self { path }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            enable_cors: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Secret for signing bearer tokens; random per process when unset.
    pub token_secret: Option<String>,
    pub token_expiry_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: None,
            token_expiry_secs: 86_400,
        }
    }
}

/// Accuracy gate and containment thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeofenceConfig {
    /// Readings reporting worse accuracy than this are position-only.
    pub accuracy_threshold_meters: f64,
    /// Margin added to the zone radius for live tracking.
    pub safety_buffer_meters: f64,
    /// Radius applied to zones stored without one.
    pub default_radius_meters: f64,
    /// How far a client `recorded_at` may run ahead of server time.
    pub max_clock_skew_secs: u64,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            accuracy_threshold_meters: 50.0,
            safety_buffer_meters: 30.0,
            default_radius_meters: 100.0,
            max_clock_skew_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    /// Distance beyond radius+buffer before a breach is worth recording.
    pub escalation_margin_meters: f64,
    /// Distance beyond radius+buffer at which a breach is CRITICAL.
    pub critical_margin_meters: f64,
    /// Minimum spacing between records for a continuous breach.
    pub standing_breach_cooldown_secs: u64,
    pub queue_capacity: usize,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            escalation_margin_meters: 100.0,
            critical_margin_meters: 500.0,
            standing_breach_cooldown_secs: 900,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub teleport_speed_kmh: f64,
    pub rapid_fire_interval_ms: u64,
    /// Amount deviation (as a multiple of the average) that adds `amount_weight`.
    pub amount_multiplier: f64,
    pub amount_weight: u32,
    /// Drift from the zone center that adds `drift_weight`.
    pub drift_meters: f64,
    pub drift_weight: u32,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            teleport_speed_kmh: 300.0,
            rapid_fire_interval_ms: 2_000,
            amount_multiplier: 5.0,
            amount_weight: 50,
            drift_meters: 200.0,
            drift_weight: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 60 }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.min(MAX_CACHE_TTL_SECS))
    }
}

impl GeofenceConfig {
    pub fn max_clock_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_clock_skew_secs.min(MAX_CLOCK_SKEW_SECS) as i64)
    }
}

impl ComplianceConfig {
    pub fn standing_breach_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.standing_breach_cooldown_secs.min(MAX_COOLDOWN_SECS) as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `path`, or from the default location when
    /// `path` is `None`. A missing default file yields defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration file without env overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// `<config dir>/fieldwatch/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "fieldwatch", "fieldwatch")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var(TOKEN_SECRET_ENV) {
            if !secret.is_empty() {
                self.auth.token_secret = Some(secret);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let distances = [
            ("geofence.accuracy_threshold_meters", self.geofence.accuracy_threshold_meters),
            ("geofence.safety_buffer_meters", self.geofence.safety_buffer_meters),
            ("geofence.default_radius_meters", self.geofence.default_radius_meters),
            ("compliance.escalation_margin_meters", self.compliance.escalation_margin_meters),
            ("compliance.critical_margin_meters", self.compliance.critical_margin_meters),
            ("anomaly.teleport_speed_kmh", self.anomaly.teleport_speed_kmh),
            ("anomaly.amount_multiplier", self.anomaly.amount_multiplier),
            ("anomaly.drift_meters", self.anomaly.drift_meters),
        ];
        for (name, value) in distances {
            if !value.is_finite() || value < 0.0 {
                bail!("{} must be a non-negative number, got {}", name, value);
            }
        }
        if self.compliance.queue_capacity == 0 {
            bail!("compliance.queue_capacity must be at least 1");
        }
        let bounded = [
            ("geofence.max_clock_skew_secs", self.geofence.max_clock_skew_secs, 0, MAX_CLOCK_SKEW_SECS),
            (
                "compliance.standing_breach_cooldown_secs",
                self.compliance.standing_breach_cooldown_secs,
                0,
                MAX_COOLDOWN_SECS,
            ),
            ("cache.ttl_secs", self.cache.ttl_secs, 1, MAX_CACHE_TTL_SECS),
        ];
        for (name, value, min, max) in bounded {
            if !(min..=max).contains(&value) {
                bail!("{} must be between {} and {}, got {}", name, min, max, value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_reference_thresholds() {
        let config = AppConfig::default();
        assert_eq!(config.geofence.accuracy_threshold_meters, 50.0);
        assert_eq!(config.geofence.safety_buffer_meters, 30.0);
        assert_eq!(config.compliance.escalation_margin_meters, 100.0);
        assert_eq!(config.compliance.critical_margin_meters, 500.0);
        assert_eq!(config.anomaly.teleport_speed_kmh, 300.0);
        assert_eq!(config.anomaly.rapid_fire_interval_ms, 2_000);
        assert_eq!(config.cache.ttl(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [geofence]
            safety_buffer_meters = 45.0

            [api]
            port = 8080
            "#,
        )
        .unwrap();
        assert_eq!(config.geofence.safety_buffer_meters, 45.0);
        assert_eq!(config.geofence.accuracy_threshold_meters, 50.0);
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.api.host, "127.0.0.1");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.geofence.safety_buffer_meters = -1.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.anomaly.teleport_speed_kmh = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.compliance.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_durations() {
        let mut config = AppConfig::default();
        config.compliance.standing_breach_cooldown_secs = u64::MAX;
        assert!(config.validate().is_err());
        // Accessors stay panic-free even without validation.
        assert_eq!(
            config.compliance.standing_breach_cooldown(),
            chrono::Duration::seconds(MAX_COOLDOWN_SECS as i64)
        );

        let mut config = AppConfig::default();
        config.cache.ttl_secs = u64::MAX;
        assert!(config.validate().is_err());
        assert_eq!(config.cache.ttl(), Duration::from_secs(MAX_CACHE_TTL_SECS));

        let mut config = AppConfig::default();
        config.cache.ttl_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.geofence.max_clock_skew_secs = MAX_CLOCK_SKEW_SECS + 1;
        assert!(config.validate().is_err());
        assert_eq!(config.geofence.max_clock_skew(), chrono::Duration::days(1));
        assert_eq!(AppConfig::default().geofence.max_clock_skew(), chrono::Duration::minutes(5));
    }

    #[test]
    #[serial]
    fn test_load_explicit_file_with_env_override() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[auth]\ntoken_secret = \"from-file\"\n").unwrap();

        unsafe {
            std::env::remove_var(TOKEN_SECRET_ENV);
        }
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.auth.token_secret.as_deref(), Some("from-file"));

        unsafe {
            std::env::set_var(TOKEN_SECRET_ENV, "from-env");
        }
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.auth.token_secret.as_deref(), Some("from-env"));
        unsafe {
            std::env::remove_var(TOKEN_SECRET_ENV);
        }
    }

    #[test]
    #[serial]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempdir().unwrap();
        assert!(AppConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
