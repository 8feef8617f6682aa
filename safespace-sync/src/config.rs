//! Configuration loading for the sync layer.
//!
//! Loaded from TOML via `--config <path>` or `SAFESPACE_CONFIG`, then
//! validated. `SyncConfig::default()` exists for programmatic construction.

use safespace_core::DatasetKind;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub request_timeout_ms: u64,
    pub credential_path: PathBuf,
    pub tenant_hint_path: PathBuf,
    pub notifications: NotificationConfig,
    pub cache: CacheSettings,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationConfig {
    /// Default lifetime of non-error notifications. Must be > 0; sticky
    /// notifications are opted into per notification, not by config.
    pub info_ttl_ms: u64,
    pub error_ttl_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    pub backoff: BackoffConfig,
    pub evict_after_ms: u64,
    /// Per-dataset overrides keyed by dataset name (`violations`,
    /// `health_score`, ...); kinds not listed keep their built-in policy.
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetSettings {
    pub stale_after_ms: u64,
    pub refresh_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` is used when absent.
    pub filter: Option<String>,
    pub json: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or SAFESPACE_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            request_timeout_ms: 10_000,
            credential_path: PathBuf::from(".safespace/credential.json"),
            tenant_hint_path: PathBuf::from(".safespace/tenant.json"),
            notifications: NotificationConfig {
                info_ttl_ms: 5_000,
                error_ttl_ms: 8_000,
            },
            cache: CacheSettings {
                backoff: BackoffConfig {
                    initial_ms: 1_000,
                    max_ms: 30_000,
                    multiplier: 2.0,
                    max_retries: 3,
                },
                evict_after_ms: 600_000,
                datasets: BTreeMap::new(),
            },
            log: LogConfig {
                filter: None,
                json: false,
            },
        }
    }
}

impl SyncConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api_base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.credential_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "credential_path",
                reason: "must not be empty".to_string(),
            });
        }
        if self.tenant_hint_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "tenant_hint_path",
                reason: "must not be empty".to_string(),
            });
        }
        if self.notifications.info_ttl_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "notifications.info_ttl_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.notifications.error_ttl_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "notifications.error_ttl_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.cache.backoff.initial_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.backoff.initial_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.cache.backoff.max_ms < self.cache.backoff.initial_ms {
            return Err(ConfigError::InvalidValue {
                field: "cache.backoff.max_ms",
                reason: "must be >= initial_ms".to_string(),
            });
        }
        if self.cache.backoff.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.backoff.multiplier",
                reason: "must be >= 1.0".to_string(),
            });
        }
        for (name, settings) in &self.cache.datasets {
            if name.parse::<DatasetKind>().is_err() {
                return Err(ConfigError::InvalidValue {
                    field: "cache.datasets",
                    reason: format!("unknown dataset '{}'", name),
                });
            }
            if settings.refresh_interval_ms == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: "cache.datasets.refresh_interval_ms",
                    reason: "must be > 0 when set".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Dataset overrides with their names resolved. Unknown names are skipped;
    /// `validate` reports them.
    pub fn dataset_overrides(&self) -> impl Iterator<Item = (DatasetKind, &DatasetSettings)> {
        self.cache
            .datasets
            .iter()
            .filter_map(|(name, settings)| name.parse().ok().map(|kind| (kind, settings)))
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("SAFESPACE_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
api_base_url = "https://api.safespace.example"
request_timeout_ms = 5000
credential_path = "/tmp/safespace/credential.json"
tenant_hint_path = "/tmp/safespace/tenant.json"

[notifications]
info_ttl_ms = 4000
error_ttl_ms = 9000

[cache]
evict_after_ms = 60000

[cache.backoff]
initial_ms = 500
max_ms = 8000
multiplier = 2.0
max_retries = 4

[cache.datasets.violations]
stale_after_ms = 60000
refresh_interval_ms = 15000

[log]
filter = "safespace_sync=debug"
json = true
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = SyncConfig::from_toml(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.cache.backoff.max_retries, 4);
        let (kind, violations) = config.dataset_overrides().next().unwrap();
        assert_eq!(kind, DatasetKind::Violations);
        assert_eq!(violations.stale_after_ms, 60_000);
        assert_eq!(violations.refresh_interval_ms, Some(15_000));
        assert!(config.log.json);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let with_extra = SAMPLE.replace("[notifications]", "bogus = true\n\n[notifications]");
        assert!(matches!(
            SyncConfig::from_toml(&with_extra),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_default_config_is_valid() {
        SyncConfig::default().validate().unwrap();
    }

    #[test]
    fn test_unknown_dataset_name_rejected() {
        let mut config = SyncConfig::default();
        config.cache.datasets.insert(
            "settings".to_string(),
            DatasetSettings {
                stale_after_ms: 1_000,
                refresh_interval_ms: None,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_notification_ttl_rejected() {
        let mut config = SyncConfig::default();
        config.notifications.error_ttl_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "notifications.error_ttl_ms",
                ..
            })
        ));

        let mut config = SyncConfig::default();
        config.notifications.info_ttl_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "notifications.info_ttl_ms",
                ..
            })
        ));
    }

    #[test]
    fn test_zero_refresh_interval_rejected() {
        let mut config = SyncConfig::default();
        config.cache.datasets.insert(
            "stats".to_string(),
            DatasetSettings {
                stale_after_ms: 1_000,
                refresh_interval_ms: Some(0),
            },
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
