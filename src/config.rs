// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// TOML file parsing with environment overrides (CEREBRO_ prefix, `__` as the
// section separator), validation and sensible defaults.
// ============================================================================

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::ConfigError;
use crate::logging::LoggingConfig;
use crate::model::project::{BasicAuth, PrometheusIntegration};
use crate::model::{Project, ProjectId};

// ----------------------------------------------------------------------------
// 1. Root configuration
// ----------------------------------------------------------------------------

/// Root configuration of the observability core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserveConfig {
    /// HTTP listen address (OTLP, /metrics, /health)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// OTLP gRPC listen address
    #[serde(default = "default_grpc_listen_address")]
    pub grpc_listen_address: String,

    /// Prefix for UI links in notifications
    #[serde(default)]
    pub url_base_path: String,

    /// Root of the metric cache and the sqlite database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub traces: RetentionConfig,

    #[serde(default)]
    pub logs: RetentionConfig,

    #[serde(default)]
    pub profiles: RetentionConfig,

    #[serde(default)]
    pub metrics: RetentionConfig,

    #[serde(default)]
    pub collector: CollectorConfig,

    /// Metric source used by projects without their own
    #[serde(default)]
    pub global_prometheus: Option<PrometheusIntegration>,

    #[serde(default)]
    pub global_clickhouse: Option<ClickHouseConfig>,

    #[serde(default)]
    pub clickhouse_space_manager: SpaceManagerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub projects: Vec<Project>,

    #[serde(default)]
    pub watchers: WatchersConfig,

    #[serde(default)]
    pub notifications: NotificationsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            grpc_listen_address: default_grpc_listen_address(),
            url_base_path: String::new(),
            data_dir: default_data_dir(),
            cache: CacheConfig::default(),
            traces: RetentionConfig::default(),
            logs: RetentionConfig::default(),
            profiles: RetentionConfig::default(),
            metrics: RetentionConfig::default(),
            collector: CollectorConfig::default(),
            global_prometheus: None,
            global_clickhouse: None,
            clickhouse_space_manager: SpaceManagerConfig::default(),
            auth: AuthConfig::default(),
            projects: Vec::new(),
            watchers: WatchersConfig::default(),
            notifications: NotificationsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".into()
}

fn default_grpc_listen_address() -> String {
    "0.0.0.0:4317".into()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_true() -> bool {
    true
}

impl ObserveConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CEREBRO_").split("__"));

        let mut config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
            source: None,
        })?;

        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
            source: None,
        })?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Projects declared in the file get their name as id.
    fn normalize(&mut self) {
        for p in &mut self.projects {
            if p.id.as_str().is_empty() {
                p.id = ProjectId::new(p.name.clone());
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, address) in [
            ("listen_address", &self.listen_address),
            ("grpc_listen_address", &self.grpc_listen_address),
        ] {
            if address.parse::<std::net::SocketAddr>().is_err() {
                return Err(ConfigError::invalid_value(
                    field,
                    format!("'{address}' is not a socket address"),
                ));
            }
        }

        for (field, v) in [
            ("cache", self.cache.validate()),
            ("collector", self.collector.validate()),
            ("clickhouse_space_manager", self.clickhouse_space_manager.validate()),
        ] {
            v.map_err(|e| ConfigError::invalid_value(field, e.to_string()))?;
        }

        if let Some(prom) = &self.global_prometheus {
            validate_url("global_prometheus.url", &prom.url)?;
        }
        if let Some(ch) = &self.global_clickhouse {
            if ch.address.is_empty() {
                return Err(ConfigError::missing_field("global_clickhouse.address"));
            }
        }

        let mut names = HashSet::new();
        let mut keys = HashSet::new();
        for p in &self.projects {
            if p.name.is_empty() {
                return Err(ConfigError::missing_field("projects.name"));
            }
            if !names.insert(p.name.as_str()) {
                return Err(ConfigError::invalid_value(
                    "projects",
                    format!("duplicate project name '{}'", p.name),
                ));
            }
            for k in &p.api_keys {
                if !keys.insert(k.as_str()) {
                    return Err(ConfigError::invalid_value(
                        "projects.api_keys",
                        format!("api key of project '{}' is used by another project", p.name),
                    ));
                }
            }
            if let Some(prom) = &p.prometheus {
                validate_url(&format!("projects.{}.prometheus.url", p.name), &prom.url)?;
            }
        }
        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// Projects with the global metric source applied where missing.
    pub fn effective_projects(&self) -> Vec<Project> {
        self.projects
            .iter()
            .cloned()
            .map(|mut p| {
                if p.prometheus.is_none() {
                    p.prometheus = self.global_prometheus.clone();
                }
                if p.integrations.base_url.is_empty() {
                    p.integrations.base_url = self.url_base_path.clone();
                }
                p
            })
            .collect()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("cerebro.db")
    }
}

fn validate_url(field: &str, value: &str) -> Result<(), ConfigError> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|e| ConfigError::invalid_value(field, format!("'{value}': {e}")))
}

// ----------------------------------------------------------------------------
// 2. Metric cache
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CacheConfig {
    /// Chunks older than this are garbage collected
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub ttl: std::time::Duration,

    #[serde(default = "default_gc_interval", with = "humantime_serde")]
    pub gc_interval: std::time::Duration,

    #[serde(default = "default_compaction_interval", with = "humantime_serde")]
    pub compaction_interval: std::time::Duration,

    #[serde(default = "default_compaction_workers")]
    #[validate(range(min = 1, max = 64))]
    pub compaction_workers: usize,

    /// How far back a new query is downloaded
    #[serde(default = "default_backfill_window", with = "humantime_serde")]
    pub backfill_window: std::time::Duration,

    #[serde(default = "default_query_concurrency")]
    #[validate(range(min = 1, max = 256))]
    pub query_concurrency: usize,

    /// Move chunks that fail to decode into `quarantine/` instead of skipping
    #[serde(default)]
    pub quarantine_corrupt_chunks: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
            gc_interval: default_gc_interval(),
            compaction_interval: default_compaction_interval(),
            compaction_workers: default_compaction_workers(),
            backfill_window: default_backfill_window(),
            query_concurrency: default_query_concurrency(),
            quarantine_corrupt_chunks: false,
        }
    }
}

fn default_cache_ttl() -> std::time::Duration {
    std::time::Duration::from_secs(30 * 24 * 3600)
}

fn default_gc_interval() -> std::time::Duration {
    std::time::Duration::from_secs(600)
}

fn default_compaction_interval() -> std::time::Duration {
    std::time::Duration::from_secs(10)
}

fn default_compaction_workers() -> usize {
    1
}

fn default_backfill_window() -> std::time::Duration {
    crate::constants::DEFAULT_BACKFILL_WINDOW.to_std()
}

fn default_query_concurrency() -> usize {
    crate::constants::QUERY_CONCURRENCY
}

// ----------------------------------------------------------------------------
// 3. Signal retention
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_signal_ttl", with = "humantime_serde")]
    pub ttl: std::time::Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            ttl: default_signal_ttl(),
        }
    }
}

fn default_signal_ttl() -> std::time::Duration {
    std::time::Duration::from_secs(7 * 24 * 3600)
}

// ----------------------------------------------------------------------------
// 4. Ingestion
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CollectorConfig {
    /// Rows per batch before a size-triggered flush
    #[serde(default = "default_batch_limit")]
    #[validate(range(min = 1))]
    pub batch_limit: usize,

    #[serde(default = "default_batch_timeout", with = "humantime_serde")]
    pub batch_timeout: std::time::Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            batch_limit: default_batch_limit(),
            batch_timeout: default_batch_timeout(),
        }
    }
}

fn default_batch_limit() -> usize {
    crate::constants::DEFAULT_BATCH_LIMIT
}

fn default_batch_timeout() -> std::time::Duration {
    std::time::Duration::from_secs(crate::constants::DEFAULT_BATCH_TIMEOUT_SECS)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClickHouseConfig {
    /// `host:port` of the HTTP interface
    pub address: String,
    #[serde(default = "default_clickhouse_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_clickhouse_database")]
    pub database: String,
    #[serde(default)]
    pub tls_enable: bool,
    #[serde(default)]
    pub tls_skip_verify: bool,
}

fn default_clickhouse_user() -> String {
    "default".into()
}

fn default_clickhouse_database() -> String {
    "default".into()
}

impl ClickHouseConfig {
    pub fn http_url(&self) -> String {
        let scheme = if self.tls_enable { "https" } else { "http" };
        format!("{}://{}/", scheme, self.address)
    }

    pub fn basic_auth(&self) -> BasicAuth {
        BasicAuth {
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SpaceManagerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Disk usage that triggers dropping old partitions
    #[serde(default = "default_usage_threshold")]
    #[validate(range(min = 1, max = 100))]
    pub usage_threshold_percent: u64,

    /// Tables with this many partitions or fewer are never pruned
    #[serde(default = "default_min_partitions")]
    pub min_partitions: u64,

    #[serde(default = "default_space_manager_interval", with = "humantime_serde")]
    pub interval: std::time::Duration,
}

impl Default for SpaceManagerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            usage_threshold_percent: default_usage_threshold(),
            min_partitions: default_min_partitions(),
            interval: default_space_manager_interval(),
        }
    }
}

fn default_usage_threshold() -> u64 {
    70
}

fn default_min_partitions() -> u64 {
    1
}

fn default_space_manager_interval() -> std::time::Duration {
    crate::constants::SPACE_MANAGER_INTERVAL.to_std()
}

// ----------------------------------------------------------------------------
// 5. Auth, watchers, notifications
// ----------------------------------------------------------------------------

/// Carried for the UI layer; the core never reads it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub anonymous_role: String,
    #[serde(default)]
    pub bootstrap_admin_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchersConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub check_deployments: bool,
}

impl Default for WatchersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_deployments: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: std::time::Duration,
    #[serde(default = "default_retry_window", with = "humantime_serde")]
    pub retry_window: std::time::Duration,
    #[serde(default = "default_send_timeout", with = "humantime_serde")]
    pub send_timeout: std::time::Duration,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            retry_interval: default_retry_interval(),
            retry_window: default_retry_window(),
            send_timeout: default_send_timeout(),
        }
    }
}

fn default_retry_interval() -> std::time::Duration {
    std::time::Duration::from_secs(crate::constants::NOTIFICATION_RETRY_INTERVAL_SECS)
}

fn default_retry_window() -> std::time::Duration {
    crate::constants::NOTIFICATION_RETRY_WINDOW.to_std()
}

fn default_send_timeout() -> std::time::Duration {
    std::time::Duration::from_secs(crate::constants::NOTIFICATION_SEND_TIMEOUT_SECS)
}

// ----------------------------------------------------------------------------
// 6. Hot-swappable handle
// ----------------------------------------------------------------------------

/// Shared configuration with atomic replacement on reload.
#[derive(Debug)]
pub struct ConfigManager {
    config: ArcSwap<ObserveConfig>,
    path: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new(config: ObserveConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            path: None,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = ObserveConfig::load(&path)?;
        let mut manager = Self::new(config);
        manager.path = Some(path.as_ref().to_path_buf());
        Ok(manager)
    }

    pub fn get(&self) -> Arc<ObserveConfig> {
        self.config.load_full()
    }

    /// Re-read the file; the previous configuration stays active on error.
    pub fn reload(&self) -> Result<Arc<ObserveConfig>, ConfigError> {
        if let Some(path) = &self.path {
            let config = ObserveConfig::load(path)?;
            self.config.store(Arc::new(config));
        }
        Ok(self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = ObserveConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.compaction_workers, 1);
        assert_eq!(config.collector.batch_limit, 10_000);
        assert_eq!(config.notifications.retry_interval.as_secs(), 60);
        assert_eq!(config.clickhouse_space_manager.usage_threshold_percent, 70);
    }

    #[test]
    fn test_generated_config_parses() {
        let generated = ObserveConfig::generate_default_config();
        let parsed = ObserveConfig::from_str(&generated).unwrap();
        assert_eq!(parsed.listen_address, "0.0.0.0:8080");
        assert_eq!(parsed.cache.ttl, default_cache_ttl());
    }

    #[test]
    fn test_projects_and_global_prometheus() {
        let config = ObserveConfig::from_str(
            r#"
            url_base_path = "https://cerebro.example.com"

            [cache]
            ttl = "7d"
            backfill_window = "2h"

            [global_prometheus]
            url = "http://prometheus:9090"
            refresh_interval = "15s"

            [[projects]]
            name = "prod"
            api_keys = ["k1"]

            [[projects]]
            name = "staging"
            api_keys = ["k2"]
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.ttl.as_secs(), 7 * 24 * 3600);
        let projects = config.effective_projects();
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].id.as_str(), "prod");
        assert_eq!(projects[1].integrations.base_url, "https://cerebro.example.com");
        let prom = projects[0].prometheus.as_ref().unwrap();
        assert_eq!(prom.step().0, 15);
    }

    #[test]
    fn test_duplicate_api_keys_are_rejected() {
        let err = ObserveConfig::from_str(
            r#"
            [[projects]]
            name = "a"
            api_keys = ["same"]

            [[projects]]
            name = "b"
            api_keys = ["same"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_threshold_range() {
        let err = ObserveConfig::from_str(
            r#"
            [clickhouse_space_manager]
            usage_threshold_percent = 150
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("clickhouse_space_manager"));
    }

    #[test]
    fn test_invalid_prometheus_url() {
        let err = ObserveConfig::from_str(
            r#"
            [global_prometheus]
            url = "not a url"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let err = ObserveConfig::load("/nonexistent/cerebro.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_load_with_file_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cerebro.toml");
        std::fs::write(&path, "data_dir = \"/var/lib/cerebro\"\n").unwrap();
        let manager = ConfigManager::from_file(&path).unwrap();
        assert_eq!(manager.get().data_dir, PathBuf::from("/var/lib/cerebro"));

        std::fs::write(&path, "data_dir = \"/srv/cerebro\"\n").unwrap();
        let reloaded = manager.reload().unwrap();
        assert_eq!(reloaded.db_path(), PathBuf::from("/srv/cerebro/cerebro.db"));
    }
}
