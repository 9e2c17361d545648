//! Configuration loaded from TOML with environment overrides.
//!
//! Every section has defaults, so an empty file (or no file) is a valid config.

use crate::domain::PriceField;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the upstream API key.
pub const API_KEY_ENV: &str = "ALPHA_VANTAGE_API_KEY";
/// Environment variable overriding the database path.
pub const DB_PATH_ENV: &str = "QUANTSIM_DB_PATH";

/// Upper bound on upstream calls per logical fetch.
pub const MAX_ATTEMPTS: u32 = 5;
/// Upper bound on the first backoff wait.
pub const MAX_BASE_DELAY_MS: u64 = 60_000;
/// Upper bound on the breaker failure window (one day).
pub const MAX_FAILURE_WINDOW_SECS: i64 = 24 * 60 * 60;
/// Upper bound on the breaker cooldown (one week).
pub const MAX_COOLDOWN_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantsimConfig {
    pub database_path: PathBuf,
    pub api: ApiConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub validation: ValidationConfig,
}

impl Default for QuantsimConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("db/quantsim.db"),
            api: ApiConfig::default(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl QuantsimConfig {
    /// Load a config file, apply environment overrides, and validate.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a config from a TOML string (no environment overrides).
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Defaults plus environment overrides, for running without a config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Overlay `ALPHA_VANTAGE_API_KEY` and `QUANTSIM_DB_PATH` when set.
    pub fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var(API_KEY_ENV).ok(),
            std::env::var(DB_PATH_ENV).ok(),
        );
    }

    fn apply_overrides(&mut self, api_key: Option<String>, db_path: Option<String>) {
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            self.api.api_key = Some(key);
        }
        if let Some(path) = db_path.filter(|p| !p.trim().is_empty()) {
            self.database_path = PathBuf::from(path);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_ATTEMPTS).contains(&self.retry.max_attempts) {
            return Err(ConfigError::Invalid(format!(
                "retry.max_attempts must be between 1 and {MAX_ATTEMPTS}, got {}",
                self.retry.max_attempts
            )));
        }
        if !(1..=MAX_BASE_DELAY_MS).contains(&self.retry.base_delay_ms) {
            return Err(ConfigError::Invalid(format!(
                "retry.base_delay_ms must be between 1 and {MAX_BASE_DELAY_MS}, got {}",
                self.retry.base_delay_ms
            )));
        }
        if !(1..=MAX_FAILURE_WINDOW_SECS).contains(&self.breaker.failure_window_secs) {
            return Err(ConfigError::Invalid(format!(
                "breaker.failure_window_secs must be between 1 and {MAX_FAILURE_WINDOW_SECS}, got {}",
                self.breaker.failure_window_secs
            )));
        }
        if !(1..=MAX_COOLDOWN_SECS).contains(&self.breaker.cooldown_secs) {
            return Err(ConfigError::Invalid(format!(
                "breaker.cooldown_secs must be between 1 and {MAX_COOLDOWN_SECS}, got {}",
                self.breaker.cooldown_secs
            )));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.validation.price_fields.is_empty() {
            return Err(ConfigError::Invalid(
                "validation.price_fields must name at least one column".into(),
            ));
        }
        if self.api.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("api.base_url is empty".into()));
        }
        Ok(())
    }
}

/// Upstream market-data API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Usually supplied through `ALPHA_VANTAGE_API_KEY` rather than the file.
    pub api_key: Option<String>,
    /// Exchange suffix appended to the ticker, e.g. `.BSE`.
    pub symbol_suffix: Option<String>,
    pub output_size: OutputSize,
    pub connect_timeout_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.alphavantage.co".into(),
            api_key: None,
            symbol_suffix: None,
            output_size: OutputSize::Full,
            connect_timeout_secs: 5,
            timeout_secs: 20,
        }
    }
}

/// `compact` returns the latest 100 bars, `full` the whole history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSize {
    Compact,
    Full,
}

impl OutputSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputSize::Compact => "compact",
            OutputSize::Full => "full",
        }
    }
}

/// Bounded retry with exponential backoff: wait `base_delay * 2^attempt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
        }
    }
}

impl RetryConfig {
    /// Backoff after the failed attempt with this 0-based index.
    pub fn backoff(&self, attempt_index: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt_index);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures within one sequence that open the circuit.
    pub failure_threshold: u32,
    /// A failure later than this after the previous one starts a new sequence.
    pub failure_window_secs: i64,
    pub cooldown_secs: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window_secs: 5 * 60,
            cooldown_secs: 60 * 60,
        }
    }
}

impl BreakerConfig {
    /// Saturates at `Duration::MAX` for values chrono cannot represent.
    pub fn failure_window(&self) -> chrono::Duration {
        saturating_seconds(self.failure_window_secs)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        saturating_seconds(self.cooldown_secs)
    }
}

fn saturating_seconds(secs: i64) -> chrono::Duration {
    chrono::Duration::try_seconds(secs).unwrap_or(if secs < 0 {
        chrono::Duration::MIN
    } else {
        chrono::Duration::MAX
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Price columns audited for 5σ outliers.
    pub price_fields: Vec<PriceField>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            price_fields: vec![PriceField::Close],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = QuantsimConfig::from_toml("").unwrap();
        assert_eq!(config, QuantsimConfig::default());
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.failure_window_secs, 300);
        assert_eq!(config.breaker.cooldown_secs, 3600);
        assert_eq!(config.validation.price_fields, vec![PriceField::Close]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = QuantsimConfig::from_toml(
            r#"
            database_path = "/tmp/q.db"

            [api]
            symbol_suffix = ".BSE"
            output_size = "compact"

            [validation]
            price_fields = ["close", "open"]
            "#,
        )
        .unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/q.db"));
        assert_eq!(config.api.symbol_suffix.as_deref(), Some(".BSE"));
        assert_eq!(config.api.output_size, OutputSize::Compact);
        assert_eq!(config.api.timeout_secs, 20);
        assert_eq!(
            config.validation.price_fields,
            vec![PriceField::Close, PriceField::Open]
        );
    }

    #[test]
    fn backoff_doubles_from_base() {
        let retry = RetryConfig::default();
        let waits: Vec<u64> = (0..5).map(|i| retry.backoff(i).as_secs()).collect();
        assert_eq!(waits, vec![1, 2, 4, 8, 16]);
        assert_eq!(waits.iter().sum::<u64>(), 31);
    }

    #[test]
    fn overrides_replace_key_and_path() {
        let mut config = QuantsimConfig::default();
        config.apply_overrides(Some("demo".into()), Some("other.db".into()));
        assert_eq!(config.api.api_key.as_deref(), Some("demo"));
        assert_eq!(config.database_path, PathBuf::from("other.db"));

        // Blank values are ignored
        config.apply_overrides(Some("  ".into()), None);
        assert_eq!(config.api.api_key.as_deref(), Some("demo"));
    }

    #[test]
    fn validate_rejects_degenerate_settings() {
        let mut config = QuantsimConfig::default();
        config.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = QuantsimConfig::default();
        config.validation.price_fields.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn retry_budget_above_five_is_rejected() {
        let config = QuantsimConfig::from_toml("[retry]\nmax_attempts = 12").unwrap();
        match config.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("max_attempts")),
            other => panic!("expected Invalid, got {other:?}"),
        }

        let config = QuantsimConfig::from_toml("[retry]\nmax_attempts = 5").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn out_of_range_durations_are_rejected() {
        let cases = [
            "[breaker]\nfailure_window_secs = 9223372036854775807",
            "[breaker]\nfailure_window_secs = 0",
            "[breaker]\nfailure_window_secs = -300",
            "[breaker]\ncooldown_secs = 0",
            "[breaker]\ncooldown_secs = 9223372036854775807",
            "[retry]\nbase_delay_ms = 0",
            "[retry]\nbase_delay_ms = 600000",
        ];
        for toml in cases {
            let config = QuantsimConfig::from_toml(toml).unwrap();
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "{toml}"
            );
        }
    }

    #[test]
    fn unrepresentable_breaker_durations_saturate() {
        let breaker = BreakerConfig {
            failure_threshold: 3,
            failure_window_secs: i64::MAX,
            cooldown_secs: i64::MIN,
        };
        assert_eq!(breaker.failure_window(), chrono::Duration::MAX);
        assert_eq!(breaker.cooldown(), chrono::Duration::MIN);
        assert_eq!(
            BreakerConfig::default().cooldown(),
            chrono::Duration::hours(1)
        );
    }

    #[test]
    fn unknown_price_field_fails_to_parse() {
        let result = QuantsimConfig::from_toml("[validation]\nprice_fields = [\"vwap\"]");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn from_file_reports_missing_path() {
        let result = QuantsimConfig::from_file(Path::new("/definitely/not/here.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
