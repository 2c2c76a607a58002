//! Layered configuration loading utilities.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::NaiveTime;
use chrono_tz::Tz;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading or validating configuration. Fatal at
/// startup; the error names the offending key.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),
    #[error("missing required configuration key '{0}'")]
    MissingKey(&'static str),
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Trading environment selector.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TradingEnvironment {
    Live,
    #[default]
    Paper,
}

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub environment: TradingEnvironment,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub broker: BrokerConfig,
    pub sheet: SheetConfig,
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    /// Overrides the environment-derived base URL when set.
    #[serde(default)]
    pub base_url: Option<String>,
    pub consumer_key: String,
    pub access_token: String,
    /// Base64 ciphertext; decrypted with the private encryption key.
    pub access_token_secret: String,
    /// Hex-encoded Diffie-Hellman prime.
    pub dh_prime: String,
    #[serde(default = "default_realm")]
    pub realm: String,
    pub signature_key_path: PathBuf,
    pub encryption_key_path: PathBuf,
    /// Discovered via `/iserver/accounts` when absent.
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_tickler_interval_secs")]
    pub tickler_interval_secs: u64,
}

impl BrokerConfig {
    /// Resolve the effective base URL. Live and paper sessions share the
    /// same gateway host; the environment is decided by the credentials.
    #[must_use]
    pub fn resolved_base_url(&self, _environment: TradingEnvironment) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => "https://api.ibkr.com/v1/api".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SheetConfig {
    pub spreadsheet_id: String,
    /// Worksheet title. The values API addresses ranges by title.
    pub worksheet: String,
    /// Service-account credentials JSON (client_email, private_key, token_uri).
    pub credentials_path: PathBuf,
    /// First column used for sequential log writes (1-based; 7 = G).
    #[serde(default = "default_log_start_column")]
    pub log_start_column: usize,
    #[serde(default = "default_max_log_columns")]
    pub max_log_columns: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifierConfig {
    pub webhook_url: String,
    #[serde(default = "default_notifier_username")]
    pub username: String,
    #[serde(default = "default_notifier_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Daily fire time, `HH:MM` in the business timezone.
    #[serde(default = "default_fire_time")]
    pub fire_time: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    /// Fire instants missed by more than this are skipped, never replayed.
    #[serde(default = "default_misfire_grace_secs")]
    pub misfire_grace_secs: u64,
    #[serde(default = "default_inter_order_pause_ms")]
    pub inter_order_pause_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fire_time: default_fire_time(),
            timezone: default_timezone(),
            health_interval_secs: default_health_interval_secs(),
            misfire_grace_secs: default_misfire_grace_secs(),
            inter_order_pause_ms: default_inter_order_pause_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn fire_time(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(&self.fire_time, "%H:%M").map_err(|err| {
            ConfigError::InvalidValue {
                key: "scheduler.fire_time",
                reason: format!("expected HH:MM, got '{}': {err}", self.fire_time),
            }
        })
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        Tz::from_str(&self.timezone).map_err(|_| ConfigError::InvalidValue {
            key: "scheduler.timezone",
            reason: format!("unknown IANA timezone '{}'", self.timezone),
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_log_rotate_bytes")]
    pub log_rotate_bytes: u64,
    #[serde(default = "default_log_keep_files")]
    pub log_keep_files: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            pid_file: default_pid_file(),
            log_path: default_log_path(),
            log_rotate_bytes: default_log_rotate_bytes(),
            log_keep_files: default_log_keep_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_realm() -> String {
    "limited_poa".to_string()
}

fn default_call_timeout_secs() -> u64 {
    15
}

fn default_tickler_interval_secs() -> u64 {
    60
}

fn default_log_start_column() -> usize {
    7
}

fn default_max_log_columns() -> usize {
    20
}

fn default_notifier_username() -> String {
    "Cadence".to_string()
}

fn default_notifier_timeout_secs() -> u64 {
    5
}

fn default_fire_time() -> String {
    "09:00".to_string()
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

fn default_health_interval_secs() -> u64 {
    300
}

fn default_misfire_grace_secs() -> u64 {
    300
}

fn default_inter_order_pause_ms() -> u64 {
    1_000
}

fn default_listen_addr() -> String {
    "127.0.0.1:8385".to_string()
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("./logs/cadence.pid")
}

fn default_log_path() -> PathBuf {
    PathBuf::from("./logs/cadence.log")
}

fn default_log_rotate_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_log_keep_files() -> usize {
    5
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `env` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `CADENCE_`
pub fn load_config(env: Option<&str>) -> Result<AppConfig, ConfigError> {
    load_config_from(Path::new("config"), env)
}

/// Same as [`load_config`] but rooted at an explicit directory.
pub fn load_config_from(base_path: &Path, env: Option<&str>) -> Result<AppConfig, ConfigError> {
    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(true));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }
    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));
    builder = builder.add_source(
        Environment::with_prefix("CADENCE")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    let app: AppConfig = config.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

impl AppConfig {
    /// Semantic checks beyond deserialization. No defaults mask absent
    /// credentials.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.consumer_key.trim().is_empty() {
            return Err(ConfigError::MissingKey("broker.consumer_key"));
        }
        if self.broker.access_token.trim().is_empty() {
            return Err(ConfigError::MissingKey("broker.access_token"));
        }
        if self.broker.access_token_secret.trim().is_empty() {
            return Err(ConfigError::MissingKey("broker.access_token_secret"));
        }
        if self.broker.dh_prime.trim().is_empty() {
            return Err(ConfigError::MissingKey("broker.dh_prime"));
        }
        if self.sheet.spreadsheet_id.trim().is_empty() {
            return Err(ConfigError::MissingKey("sheet.spreadsheet_id"));
        }
        if !self.notifier.webhook_url.starts_with("http") {
            return Err(ConfigError::InvalidValue {
                key: "notifier.webhook_url",
                reason: format!("expected an http(s) URL, got '{}'", self.notifier.webhook_url),
            });
        }
        if self.sheet.log_start_column == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sheet.log_start_column",
                reason: "columns are 1-based".into(),
            });
        }
        self.scheduler.fire_time()?;
        self.scheduler.timezone()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_config(dir: &Path, body: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("default.toml"), body).unwrap();
    }

    const MINIMAL: &str = r#"
[broker]
consumer_key = "CK123"
access_token = "token"
access_token_secret = "c2VjcmV0"
dh_prime = "f51d"
signature_key_path = "keys/sig.pem"
encryption_key_path = "keys/enc.pem"

[sheet]
spreadsheet_id = "sheet-id"
worksheet = "Recurring Orders"
credentials_path = "keys/service-account.json"

[notifier]
webhook_url = "https://discord.example/api/webhooks/1/x"
"#;

    #[test]
    fn minimal_config_loads_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), MINIMAL);
        let cfg = load_config_from(dir.path(), None).unwrap();
        assert_eq!(cfg.environment, TradingEnvironment::Paper);
        assert_eq!(cfg.scheduler.fire_time, "09:00");
        assert_eq!(cfg.scheduler.timezone, "America/New_York");
        assert_eq!(cfg.broker.realm, "limited_poa");
        assert_eq!(cfg.broker.tickler_interval_secs, 60);
        assert_eq!(cfg.sheet.log_start_column, 7);
        assert_eq!(cfg.service.log_keep_files, 5);
        assert!(cfg.scheduler.timezone().is_ok());
    }

    #[test]
    fn missing_consumer_key_names_the_key() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            &MINIMAL.replace("consumer_key = \"CK123\"", "consumer_key = \"\""),
        );
        let err = load_config_from(dir.path(), None).unwrap_err();
        assert!(err.to_string().contains("broker.consumer_key"), "{err}");
    }

    #[test]
    fn bad_fire_time_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            &format!("{MINIMAL}\n[scheduler]\nfire_time = \"25:99\"\n"),
        );
        let err = load_config_from(dir.path(), None).unwrap_err();
        assert!(err.to_string().contains("scheduler.fire_time"), "{err}");
    }

    #[test]
    fn bad_timezone_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            &format!("{MINIMAL}\n[scheduler]\ntimezone = \"Mars/Olympus\"\n"),
        );
        let err = load_config_from(dir.path(), None).unwrap_err();
        assert!(err.to_string().contains("scheduler.timezone"), "{err}");
    }
}
