use crate::channel::RetryPolicy;
use crate::error::ConfigError;
use crate::polling::PollPolicy;
use crate::SubscriptionId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 2_000;
const DEFAULT_POLL_BASE_MS: u64 = 30_000;
const DEFAULT_POLL_MAX_MS: u64 = 300_000;
const DEFAULT_QUERY_TIMEOUT_MS: u64 = 10_000;
/// Upper bound for any configured delay or interval: one day.
const MAX_CONFIGURED_MS: u64 = 86_400_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub base_interval_ms: u64,
    pub max_interval_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            base_interval_ms: DEFAULT_POLL_BASE_MS,
            max_interval_ms: DEFAULT_POLL_MAX_MS,
        }
    }
}

impl PollingSettings {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy {
            base_interval: Duration::from_millis(self.base_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub channel: RetrySettings,
    pub unread: RetrySettings,
    pub polling: PollingSettings,
    /// Subscriptions that must be ready before forms are considered safe.
    pub required: Vec<String>,
    pub query_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: RetrySettings::default(),
            unread: RetrySettings::default(),
            polling: PollingSettings::default(),
            required: vec![SubscriptionId::RealtimeChannel.as_str().to_string()],
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.base_delay_ms == 0 || self.unread.base_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "retry base_delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.polling.base_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "polling base_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.polling.max_interval_ms < self.polling.base_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "polling max_interval_ms ({}) is below base_interval_ms ({})",
                self.polling.max_interval_ms, self.polling.base_interval_ms
            )));
        }
        for (name, value) in [
            ("channel.base_delay_ms", self.channel.base_delay_ms),
            ("unread.base_delay_ms", self.unread.base_delay_ms),
            ("polling.max_interval_ms", self.polling.max_interval_ms),
            ("query_timeout_ms", self.query_timeout_ms),
        ] {
            if value > MAX_CONFIGURED_MS {
                return Err(ConfigError::Invalid(format!(
                    "{name} ({value}) exceeds {MAX_CONFIGURED_MS}"
                )));
            }
        }
        if self.query_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "query_timeout_ms must be greater than zero".to_string(),
            ));
        }
        for name in &self.required {
            if name.parse::<SubscriptionId>().is_err() {
                return Err(ConfigError::Invalid(format!(
                    "unknown required subscription: {name}"
                )));
            }
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert!(config.enabled);
        assert_eq!(config.channel.max_retries, 3);
        assert_eq!(config.channel.policy().base_delay, Duration::from_secs(2));
        assert_eq!(config.required, vec!["realtime-channel".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            required = ["tour-requests-poll"]

            [polling]
            base_interval_ms = 5000
            "#,
        )
        .expect("parse config");
        assert_eq!(config.polling.base_interval_ms, 5_000);
        assert_eq!(config.polling.max_interval_ms, DEFAULT_POLL_MAX_MS);
        assert_eq!(config.channel, RetrySettings::default());
        assert_eq!(config.required, vec!["tour-requests-poll".to_string()]);
    }

    #[test]
    fn rejects_inverted_polling_bounds() {
        let err = SyncConfig::from_toml_str(
            r#"
            [polling]
            base_interval_ms = 60000
            max_interval_ms = 1000
            "#,
        )
        .expect_err("inverted bounds");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_delays_beyond_one_day() {
        let err = SyncConfig::from_toml_str(
            r#"
            [channel]
            base_delay_ms = 100000000000
            "#,
        )
        .expect_err("oversized delay");
        assert!(err.to_string().contains("channel.base_delay_ms"));

        let mut config = SyncConfig::default();
        config.polling.max_interval_ms = MAX_CONFIGURED_MS;
        assert!(config.validate().is_ok());
        config.polling.max_interval_ms = MAX_CONFIGURED_MS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_required_name() {
        let err = SyncConfig::from_toml_str(r#"required = ["listings"]"#).expect_err("unknown");
        assert!(err.to_string().contains("listings"));
    }

    #[test]
    fn load_reads_file_and_tolerates_missing_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("absent.toml");
        assert_eq!(SyncConfig::load(&missing).expect("defaults"), SyncConfig::default());

        let path = dir.path().join("showsync.toml");
        let mut file = std::fs::File::create(&path).expect("create");
        writeln!(file, "enabled = false\nquery_timeout_ms = 2500").expect("write");
        let config = SyncConfig::load(&path).expect("load");
        assert!(!config.enabled);
        assert_eq!(config.query_timeout(), Duration::from_millis(2_500));
    }
}
