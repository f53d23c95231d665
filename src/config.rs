use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Environment override tracking
// ---------------------------------------------------------------------------

/// Tracks which configuration settings are overridden by environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    overrides: HashMap<String, String>,
}

impl EnvOverrides {
    /// Check whether a setting key (e.g. "sync.frequency_secs") is overridden.
    pub fn is_overridden(&self, key: &str) -> bool {
        self.overrides.contains_key(key)
    }

    /// Get the env var name that overrides the given setting key.
    pub fn env_var_for(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    /// Number of settings currently pinned by the environment.
    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }

    fn record(&mut self, key: &str, env_var: &str) {
        self.overrides.insert(key.to_string(), env_var.to_string());
    }
}

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub balance: BalanceConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub bulk: BulkConfig,
    #[serde(default)]
    pub leadership: LeadershipConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Env var overrides are not serialized to TOML.
    #[serde(skip)]
    pub env_overrides: EnvOverrides,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Cadence shared by the ability cache resync and the option/pricing sync.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_frequency")]
    pub frequency_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            frequency_secs: default_sync_frequency(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    /// The health prober only runs when explicitly enabled.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_frequency")]
    pub frequency_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
    /// Consecutive probe failures before a route is auto-disabled.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency_secs: default_health_frequency(),
            timeout_secs: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BalanceConfig {
    #[serde(default = "default_balance_frequency")]
    pub frequency_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            frequency_secs: default_balance_frequency(),
            timeout_secs: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UsageConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BulkConfig {
    /// Bulk job reconciliation only runs when explicitly enabled.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bulk_frequency")]
    pub frequency_secs: u64,
    #[serde(default = "default_bulk_timeout")]
    pub timeout_secs: u64,
    /// Jobs older than this are force-expired.
    #[serde(default = "default_max_job_age")]
    pub max_job_age_hours: u64,
    /// Jobs polled more than this many times are force-expired.
    #[serde(default = "default_max_poll_count")]
    pub max_poll_count: u32,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency_secs: default_bulk_frequency(),
            timeout_secs: default_bulk_timeout(),
            max_job_age_hours: default_max_job_age(),
            max_poll_count: default_max_poll_count(),
        }
    }
}

/// Whether this instance holds cluster leadership. In a single-instance
/// deployment this stays true; multi-instance deployments set it on exactly
/// one node (or wire an external elector through `leadership::SharedFlag`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LeadershipConfig {
    #[serde(default = "default_true")]
    pub is_leader: bool,
}

impl Default for LeadershipConfig {
    fn default() -> Self {
        Self { is_leader: true }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

fn default_db_path() -> PathBuf {
    PathBuf::from("wayline.db")
}
const fn default_sync_frequency() -> u64 {
    60
}
const fn default_health_frequency() -> u64 {
    300
}
const fn default_balance_frequency() -> u64 {
    900
}
const fn default_probe_timeout() -> u64 {
    10
}
const fn default_failure_threshold() -> u32 {
    3
}
const fn default_batch_size() -> usize {
    100
}
const fn default_flush_interval() -> u64 {
    5
}
const fn default_bulk_frequency() -> u64 {
    15
}
const fn default_bulk_timeout() -> u64 {
    30
}
const fn default_max_job_age() -> u64 {
    24
}
const fn default_max_poll_count() -> u32 {
    48
}
const fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Config loading and env overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a TOML file, then apply environment variable
    /// overrides. Any setting prefixed with `WAYLINE_` takes precedence over
    /// the file value and is tracked in `env_overrides`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.frequency_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.health.timeout_secs.max(1))
    }

    pub fn balance_timeout(&self) -> Duration {
        Duration::from_secs(self.balance.timeout_secs.max(1))
    }

    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_secs(self.bulk.timeout_secs.max(1))
    }

    /// Apply environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        let mut ov = EnvOverrides::default();

        macro_rules! env_bool {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_parse {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    if let Ok(parsed) = val.parse() {
                        $field = parsed;
                        ov.record($key, $env);
                    }
                }
            };
        }
        macro_rules! env_str {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = val;
                    ov.record($key, $env);
                }
            };
        }

        // -- Database --
        if let Ok(val) = std::env::var("WAYLINE_DATABASE_PATH") {
            self.database.path = PathBuf::from(val);
            ov.record("database.path", "WAYLINE_DATABASE_PATH");
        }

        // -- Sync --
        env_parse!(
            "sync.frequency_secs",
            "WAYLINE_SYNC_FREQUENCY",
            self.sync.frequency_secs
        );

        // -- Health prober --
        env_bool!("health.enabled", "WAYLINE_HEALTH_ENABLED", self.health.enabled);
        env_parse!(
            "health.frequency_secs",
            "WAYLINE_HEALTH_FREQUENCY",
            self.health.frequency_secs
        );
        env_parse!(
            "health.timeout_secs",
            "WAYLINE_HEALTH_TIMEOUT",
            self.health.timeout_secs
        );
        env_parse!(
            "health.failure_threshold",
            "WAYLINE_HEALTH_FAILURE_THRESHOLD",
            self.health.failure_threshold
        );

        // -- Balance prober --
        env_parse!(
            "balance.frequency_secs",
            "WAYLINE_BALANCE_FREQUENCY",
            self.balance.frequency_secs
        );
        env_parse!(
            "balance.timeout_secs",
            "WAYLINE_BALANCE_TIMEOUT",
            self.balance.timeout_secs
        );

        // -- Usage batch writer --
        env_parse!("usage.batch_size", "WAYLINE_BATCH_SIZE", self.usage.batch_size);
        env_parse!(
            "usage.flush_interval_secs",
            "WAYLINE_BATCH_INTERVAL",
            self.usage.flush_interval_secs
        );

        // -- Bulk reconciler --
        env_bool!("bulk.enabled", "WAYLINE_BULK_ENABLED", self.bulk.enabled);
        env_parse!(
            "bulk.frequency_secs",
            "WAYLINE_BULK_FREQUENCY",
            self.bulk.frequency_secs
        );
        env_parse!("bulk.timeout_secs", "WAYLINE_BULK_TIMEOUT", self.bulk.timeout_secs);
        env_parse!(
            "bulk.max_job_age_hours",
            "WAYLINE_BULK_MAX_JOB_AGE",
            self.bulk.max_job_age_hours
        );
        env_parse!(
            "bulk.max_poll_count",
            "WAYLINE_BULK_MAX_POLLS",
            self.bulk.max_poll_count
        );

        // -- Leadership --
        env_bool!(
            "leadership.is_leader",
            "WAYLINE_IS_LEADER",
            self.leadership.is_leader
        );

        // -- Logging --
        env_str!("logging.level", "WAYLINE_LOG_LEVEL", self.logging.level);
        env_bool!("logging.json", "WAYLINE_LOG_JSON", self.logging.json);

        self.env_overrides = ov;
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            sync: SyncConfig::default(),
            health: HealthConfig::default(),
            balance: BalanceConfig::default(),
            usage: UsageConfig::default(),
            bulk: BulkConfig::default(),
            leadership: LeadershipConfig::default(),
            logging: LoggingConfig::default(),
            env_overrides: EnvOverrides::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sync.frequency_secs, 60);
        assert!(!config.health.enabled);
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.usage.batch_size, 100);
        assert!(!config.bulk.enabled);
        assert!(config.leadership.is_leader);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_intervals_never_zero() {
        let mut config = Config::default();
        config.sync.frequency_secs = 0;
        config.health.timeout_secs = 0;
        assert_eq!(config.sync_interval(), Duration::from_secs(1));
        assert_eq!(config.probe_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_env_overrides_tracking() {
        let mut ov = EnvOverrides::default();
        assert!(!ov.is_overridden("sync.frequency_secs"));
        assert!(ov.env_var_for("sync.frequency_secs").is_none());

        ov.record("sync.frequency_secs", "WAYLINE_SYNC_FREQUENCY");
        assert!(ov.is_overridden("sync.frequency_secs"));
        assert_eq!(
            ov.env_var_for("sync.frequency_secs"),
            Some("WAYLINE_SYNC_FREQUENCY")
        );
        assert_eq!(ov.len(), 1);
    }

    #[test]
    fn test_env_override_applies() {
        // SAFETY: Tests are run sequentially for env-mutating tests.
        unsafe {
            std::env::set_var("WAYLINE_SYNC_FREQUENCY", "30");
            std::env::set_var("WAYLINE_HEALTH_ENABLED", "true");
            std::env::set_var("WAYLINE_IS_LEADER", "false");
        }

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.sync.frequency_secs, 30);
        assert!(config.health.enabled);
        assert!(!config.leadership.is_leader);

        assert!(config.env_overrides.is_overridden("sync.frequency_secs"));
        assert!(config.env_overrides.is_overridden("health.enabled"));
        assert!(config.env_overrides.is_overridden("leadership.is_leader"));
        assert!(!config.env_overrides.is_overridden("usage.batch_size"));

        unsafe {
            std::env::remove_var("WAYLINE_SYNC_FREQUENCY");
            std::env::remove_var("WAYLINE_HEALTH_ENABLED");
            std::env::remove_var("WAYLINE_IS_LEADER");
        }
    }

    #[test]
    fn test_env_bool_variants() {
        for (val, expected) in [
            ("1", true),
            ("true", true),
            ("yes", true),
            ("on", true),
            ("0", false),
            ("false", false),
            ("no", false),
            ("off", false),
        ] {
            // SAFETY: Tests are run sequentially for env-mutating tests.
            unsafe {
                std::env::set_var("WAYLINE_LOG_JSON", val);
            }
            let mut config = Config::default();
            config.apply_env_overrides();
            assert_eq!(config.logging.json, expected, "WAYLINE_LOG_JSON={val}");
        }
        unsafe {
            std::env::remove_var("WAYLINE_LOG_JSON");
        }
    }

    #[test]
    fn test_config_load_missing_file() {
        let path = Path::new("/tmp/nonexistent_wayline_config_test.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.usage.batch_size, 100);
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.toml");
        std::fs::write(
            &path,
            r#"
[sync]
frequency_secs = 10

[health]
enabled = true
failure_threshold = 5

[usage]
batch_size = 200

[bulk]
enabled = true

[leadership]
is_leader = false
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.sync.frequency_secs, 10);
        assert!(config.health.enabled);
        assert_eq!(config.health.failure_threshold, 5);
        assert_eq!(config.usage.batch_size, 200);
        assert!(config.bulk.enabled);
        assert!(!config.leadership.is_leader);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.sync.frequency_secs, config.sync.frequency_secs);
        assert_eq!(parsed.health.enabled, config.health.enabled);
        assert_eq!(parsed.usage.batch_size, config.usage.batch_size);
    }
}
