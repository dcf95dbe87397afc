use famsync_core::{ConnectivityConfig, EngineConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Remote store connection
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncConfig {
    /// Base URL of the record server (e.g., "http://localhost:8080")
    pub server_url: Option<String>,
    /// API key for bearer authentication
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl SyncConfig {
    /// Returns true if sync is configured (has both server_url and api_key)
    pub fn is_configured(&self) -> bool {
        self.server_url.is_some() && self.api_key.is_some()
    }
}

/// Orchestrator tunables as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    pub batch_size: usize,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub call_timeout_secs: u64,
    pub periodic_sync_secs: u64,
    pub reconcile_interval_secs: u64,
    pub long_disconnect_secs: u64,
    /// `null` keeps finished entries forever
    pub completed_retention_secs: Option<u64>,
    /// `null` parks manual conflicts until resolved by hand
    pub manual_conflict_expiry_secs: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_engine_config(&EngineConfig::default())
    }
}

impl EngineSettings {
    pub fn from_engine_config(defaults: &EngineConfig) -> Self {
        Self {
            batch_size: defaults.batch_size,
            max_retries: defaults.retry.max_retries,
            base_delay_ms: millis(defaults.retry.base_delay),
            call_timeout_secs: defaults.call_timeout.as_secs(),
            periodic_sync_secs: defaults.periodic_sync_interval.as_secs(),
            reconcile_interval_secs: defaults.reconcile_interval.as_secs(),
            long_disconnect_secs: defaults.long_disconnect.as_secs(),
            completed_retention_secs: defaults.completed_retention.map(|d| d.as_secs()),
            manual_conflict_expiry_secs: defaults.manual_conflict_expiry.map(|d| d.as_secs()),
        }
    }

    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            batch_size: self.batch_size.max(1),
            retry: RetryPolicy {
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_retries: self.max_retries,
            },
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            periodic_sync_interval: Duration::from_secs(self.periodic_sync_secs),
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
            long_disconnect: Duration::from_secs(self.long_disconnect_secs),
            completed_retention: self.completed_retention_secs.map(Duration::from_secs),
            manual_conflict_expiry: self.manual_conflict_expiry_secs.map(Duration::from_secs),
            ..EngineConfig::default()
        }
    }
}

/// Reachability probing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectivitySettings {
    pub poll_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub slow_threshold_ms: u64,
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self::from_connectivity_config(&ConnectivityConfig::default())
    }
}

impl ConnectivitySettings {
    pub fn from_connectivity_config(defaults: &ConnectivityConfig) -> Self {
        Self {
            poll_interval_secs: defaults.poll_interval.as_secs(),
            probe_timeout_secs: defaults.probe_timeout.as_secs(),
            slow_threshold_ms: millis(defaults.slow_threshold),
        }
    }

    pub fn to_connectivity_config(&self) -> ConnectivityConfig {
        ConnectivityConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            slow_threshold: Duration::from_millis(self.slow_threshold_ms),
        }
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the SQLite database
    pub database_path: ConfigValue<PathBuf>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    pub sync: SyncConfig,
    pub engine: EngineSettings,
    pub connectivity: ConnectivitySettings,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    sync: Option<SyncConfig>,
    engine: Option<EngineSettings>,
    connectivity: Option<ConnectivitySettings>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut database_path = ConfigValue::new(
            Self::default_data_dir().join("famsync.db"),
            ConfigSource::Default,
        );
        let mut config_file = None;
        let mut sync = SyncConfig::default();
        let mut engine = EngineSettings::default();
        let mut connectivity = ConnectivitySettings::default();

        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(db_path) = file_config.database_path {
                // Relative paths are relative to the config file
                let resolved_path = if db_path.is_relative() {
                    path.parent().map(|p| p.join(&db_path)).unwrap_or(db_path)
                } else {
                    db_path
                };
                database_path = ConfigValue::new(resolved_path, ConfigSource::File);
            }
            if let Some(sync_config) = file_config.sync {
                sync = sync_config;
            }
            if let Some(engine_settings) = file_config.engine {
                engine = engine_settings;
            }
            if let Some(connectivity_settings) = file_config.connectivity {
                connectivity = connectivity_settings;
            }
        }

        if let Ok(db_path) = std::env::var("FAMSYNC_DATABASE_PATH") {
            database_path = ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("FAMSYNC_SYNC_URL") {
            sync.server_url = Some(url);
        }
        if let Ok(key) = std::env::var("FAMSYNC_SYNC_API_KEY") {
            sync.api_key = Some(key);
        }

        Ok(Self {
            database_path,
            config_file,
            sync,
            engine,
            connectivity,
        })
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/famsync/
    /// - macOS: ~/Library/Application Support/famsync/
    /// - Windows: %APPDATA%/famsync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("famsync")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/famsync/
    /// - macOS: ~/Library/Application Support/famsync/
    /// - Windows: %APPDATA%/famsync/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("famsync")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadError(_, e) => Some(e),
            ConfigError::ParseError(_, e) => Some(e),
        }
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nonexistent.yaml");

        let config = Config::load(Some(config_path)).unwrap();
        assert!(config
            .database_path
            .value
            .to_string_lossy()
            .contains("famsync.db"));
        assert_eq!(config.database_path.source, ConfigSource::Default);
        assert!(config.config_file.is_none());
        assert_eq!(config.engine, EngineSettings::default());
        assert_eq!(config.engine.batch_size, 5);
        assert_eq!(config.engine.max_retries, 3);
        assert_eq!(config.connectivity.slow_threshold_ms, 2000);
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: /custom/path/db.sqlite").unwrap();
        writeln!(file, "engine:").unwrap();
        writeln!(file, "  batch_size: 10").unwrap();
        writeln!(file, "  manual_conflict_expiry_secs: 3600").unwrap();
        writeln!(file, "connectivity:").unwrap();
        writeln!(file, "  slow_threshold_ms: 500").unwrap();

        let config = Config::load(Some(config_path.clone())).unwrap();
        assert_eq!(
            config.database_path.value,
            PathBuf::from("/custom/path/db.sqlite")
        );
        assert_eq!(config.database_path.source, ConfigSource::File);
        assert_eq!(config.config_file, Some(config_path));

        // Unset keys keep their defaults
        assert_eq!(config.engine.batch_size, 10);
        assert_eq!(config.engine.max_retries, 3);
        assert_eq!(config.connectivity.slow_threshold_ms, 500);
        assert_eq!(config.connectivity.poll_interval_secs, 30);

        let engine = config.engine.to_engine_config();
        assert_eq!(engine.batch_size, 10);
        assert_eq!(
            engine.manual_conflict_expiry,
            Some(Duration::from_secs(3600))
        );
        assert_eq!(
            config.connectivity.to_connectivity_config().slow_threshold,
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_relative_database_path_resolves_against_config_dir() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "database_path: data/famsync.db\n").unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(
            config.database_path.value,
            temp_dir.path().join("data/famsync.db")
        );
    }

    #[test]
    fn test_sync_section() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(
            &config_path,
            "sync:\n  server_url: http://localhost:8080\n  api_key: secret\n",
        )
        .unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        assert!(config.sync.is_configured());
        assert_eq!(
            config.sync.server_url.as_deref(),
            Some("http://localhost:8080")
        );
    }

    #[test]
    fn test_retention_can_be_disabled() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "engine:\n  completed_retention_secs: null\n").unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.engine.to_engine_config().completed_retention, None);
    }

    #[test]
    #[ignore] // Run with --ignored; env vars can pollute parallel tests
    fn test_env_var_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "database_path: /from/file.db\n").unwrap();

        std::env::set_var("FAMSYNC_DATABASE_PATH", "/from/env.db");

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.database_path.value, PathBuf::from("/from/env.db"));
        assert_eq!(config.database_path.source, ConfigSource::Environment);

        std::env::remove_var("FAMSYNC_DATABASE_PATH");
    }

    #[test]
    fn test_invalid_yaml_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(Some(config_path));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_oversized_durations_saturate() {
        let engine = EngineConfig {
            retry: RetryPolicy {
                base_delay: Duration::MAX,
                max_retries: 3,
            },
            ..EngineConfig::default()
        };
        assert_eq!(EngineSettings::from_engine_config(&engine).base_delay_ms, u64::MAX);

        let connectivity = ConnectivityConfig {
            slow_threshold: Duration::MAX,
            ..ConnectivityConfig::default()
        };
        let settings = ConnectivitySettings::from_connectivity_config(&connectivity);
        assert_eq!(settings.slow_threshold_ms, u64::MAX);

        let normal = ConnectivitySettings::from_connectivity_config(&ConnectivityConfig::default());
        assert_eq!(normal.slow_threshold_ms, 2000);
    }
}
