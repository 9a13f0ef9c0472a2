use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::types::WebhookSource;

/// Service configuration. Loaded from environment variables with the
/// prefix `WEBHOOKS__`, e.g. `WEBHOOKS__SECRETS__PAYMENT`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub log_json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Keep events in memory only.
    #[serde(default)]
    pub in_memory: bool,
}

/// Shared secrets per provider. A source without a secret rejects
/// deliveries with 503.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecretsConfig {
    pub payment: Option<String>,
    pub training_provider_a: Option<String>,
    pub training_provider_b: Option<String>,
}

impl SecretsConfig {
    pub fn for_source(&self, source: WebhookSource) -> Option<&str> {
        let secret = match source {
            WebhookSource::Payment => &self.payment,
            WebhookSource::TrainingProviderA => &self.training_provider_a,
            WebhookSource::TrainingProviderB => &self.training_provider_b,
        };
        secret.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_stale_processing_secs")]
    pub stale_processing_secs: u64,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: self.backoff_ms.iter().copied().map(Duration::from_millis).collect(),
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_processing_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminConfig {
    /// Bearer token for the admin routes; unset disables them.
    pub token: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_max_retries() -> u32 {
    crate::retry::DEFAULT_MAX_RETRIES
}
fn default_backoff_ms() -> Vec<u64> {
    vec![1_000, 5_000, 15_000]
}
fn default_cooldown_ms() -> u64 {
    60_000
}
fn default_batch_size() -> usize {
    10
}
fn default_interval_secs() -> u64 {
    30
}
fn default_stale_processing_secs() -> u64 {
    600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            in_memory: false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            cooldown_ms: default_cooldown_ms(),
            batch_size: default_batch_size(),
            interval_secs: default_interval_secs(),
            stale_processing_secs: default_stale_processing_secs(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            secrets: SecretsConfig::default(),
            retry: RetryConfig::default(),
            admin: AdminConfig::default(),
            log_json: false,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::from_source(
            config::Environment::with_prefix("WEBHOOKS")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("retry.backoff_ms"),
        )
    }

    fn from_source(
        source: impl config::Source + Send + Sync + 'static,
    ) -> Result<Self, config::ConfigError> {
        let cfg: Self = config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.retry.max_retries == 0 {
            return Err(config::ConfigError::Message(
                "retry.max_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix("WEBHOOKS")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("retry.backoff_ms")
            .source(Some(map))
    }

    #[test]
    fn defaults_match_retry_policy() {
        let cfg = AppConfig::from_source(env(&[])).unwrap();
        assert_eq!(cfg.retry.policy(), RetryPolicy::default());
        assert_eq!(cfg.server.bind_addr, "0.0.0.0:8080");
        assert!(cfg.admin.token.is_none());
        assert!(cfg.secrets.for_source(WebhookSource::Payment).is_none());
    }

    #[test]
    fn environment_overrides_nested_values() {
        let cfg = AppConfig::from_source(env(&[
            ("WEBHOOKS__SECRETS__PAYMENT", "whsec_abc"),
            ("WEBHOOKS__SECRETS__TRAINING_PROVIDER_B", ""),
            ("WEBHOOKS__RETRY__MAX_RETRIES", "5"),
            ("WEBHOOKS__RETRY__BACKOFF_MS", "100,200"),
            ("WEBHOOKS__ADMIN__TOKEN", "admin-token"),
        ]))
        .unwrap();

        assert_eq!(cfg.secrets.for_source(WebhookSource::Payment), Some("whsec_abc"));
        assert_eq!(cfg.secrets.for_source(WebhookSource::TrainingProviderB), None);
        let policy = cfg.retry.policy();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(
            policy.backoff,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert_eq!(cfg.admin.token.as_deref(), Some("admin-token"));
    }

    #[test]
    fn zero_max_retries_is_rejected() {
        let err = AppConfig::from_source(env(&[("WEBHOOKS__RETRY__MAX_RETRIES", "0")])).unwrap_err();
        assert!(err.to_string().contains("max_retries"));
    }

    #[test]
    fn malformed_values_are_errors() {
        assert!(AppConfig::from_source(env(&[("WEBHOOKS__RETRY__MAX_RETRIES", "abc")])).is_err());
    }
}
