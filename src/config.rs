//! # Config: TOML Settings with Environment Overrides
//!
//! The control plane reads `fleetmeter.toml` (path from `--config` or
//! `FLEETMETER_CONFIG`). A missing file is not an error: every section has
//! defaults matching the reference deployment. Secrets and connection URLs
//! are usually injected through the environment instead:
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `DATABASE_URL` | `database.url` |
//! | `REDIS_URL` | `settlement.redis_url` |
//! | `BALANCE_API_URL` | `balance.api_url` |
//! | `INTERNAL_SERVICE_KEY` | `balance.internal_key` |

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub reconciler: ReconcilerConfig,
    pub endpoint_sync: EndpointSyncConfig,
    pub billing: BillingConfig,
    pub health: HealthConfig,
    pub remote: RemoteConfig,
    pub balance: BalanceConfig,
    pub settlement: SettlementConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7100,
            shutdown_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub interval_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSyncConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for EndpointSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Running workers are not charged for slices shorter than this.
    pub min_billing_secs: i64,
    pub idempotency_prefix: String,
    pub service_tag: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            min_billing_secs: 60,
            idempotency_prefix: "portal".to_string(),
            service_tag: "fleetmeter".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub offline_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            offline_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    /// Base URL of the balance authority. Balance checks are skipped when unset.
    pub api_url: Option<String>,
    pub service_name: String,
    pub internal_key: String,
    pub timeout_secs: u64,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            service_name: "fleetmeter".to_string(),
            internal_key: String::new(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Redis used for the settlement stream. Unset means log-only publishing.
    pub redis_url: Option<String>,
    pub stream: String,
    pub max_len: usize,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            stream: "metering:billing".to_string(),
            max_len: 100_000,
        }
    }
}

impl Config {
    /// Load from `path` (defaults when the file does not exist), apply process
    /// environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::parse(&content)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.settlement.redis_url = Some(url);
        }
        if let Some(url) = lookup("BALANCE_API_URL") {
            self.balance.api_url = Some(url);
        }
        if let Some(key) = lookup("INTERNAL_SERVICE_KEY") {
            self.balance.internal_key = key;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("reconciler.interval_secs", self.reconciler.interval_secs),
            ("endpoint_sync.interval_secs", self.endpoint_sync.interval_secs),
            ("billing.interval_secs", self.billing.interval_secs),
            ("health.interval_secs", self.health.interval_secs),
            ("health.offline_timeout_secs", self.health.offline_timeout_secs),
            ("remote.timeout_secs", self.remote.timeout_secs),
            ("balance.timeout_secs", self.balance.timeout_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        if self.billing.min_billing_secs < 0 {
            bail!("billing.min_billing_secs must not be negative");
        }
        if self.billing.idempotency_prefix.trim().is_empty() {
            bail!("billing.idempotency_prefix must not be empty");
        }
        if self.balance.api_url.is_some() && self.balance.internal_key.is_empty() {
            bail!("balance.internal_key (or INTERNAL_SERVICE_KEY) is required when balance.api_url is set");
        }
        Ok(())
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database.url.as_deref().ok_or_else(|| {
            anyhow::anyhow!("DATABASE_URL is required (set via --database-url, env or config file)")
        })
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_reference_deployment() {
        let config = Config::default();
        assert_eq!(config.server.port, 7100);
        assert_eq!(config.reconciler.interval_secs, 10);
        assert_eq!(config.billing.interval_secs, 60);
        assert_eq!(config.billing.min_billing_secs, 60);
        assert_eq!(config.billing.idempotency_prefix, "portal");
        assert_eq!(config.health.offline_timeout_secs, 120);
        assert_eq!(config.remote.timeout_secs, 30);
        assert_eq!(config.balance.timeout_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = Config::parse(
            r#"
            [billing]
            min_billing_secs = 30

            [health]
            offline_timeout_secs = 300
            "#,
        )
        .unwrap();
        assert_eq!(config.billing.min_billing_secs, 30);
        assert_eq!(config.billing.interval_secs, 60);
        assert_eq!(config.health.offline_timeout_secs, 300);
        assert_eq!(config.health.interval_secs, 60);
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = Config::parse(
            r#"
            [database]
            url = "postgres://file/db"
            "#,
        )
        .unwrap();
        let env: HashMap<&str, &str> = [
            ("DATABASE_URL", "postgres://env/db"),
            ("REDIS_URL", "redis://localhost:6379"),
            ("INTERNAL_SERVICE_KEY", "secret"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.database.url.as_deref(), Some("postgres://env/db"));
        assert_eq!(
            config.settlement.redis_url.as_deref(),
            Some("redis://localhost:6379")
        );
        assert_eq!(config.balance.internal_key, "secret");
        assert!(config.balance.api_url.is_none());
    }

    #[test]
    fn zero_interval_rejected() {
        let config = Config::parse("[reconciler]\ninterval_secs = 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reconciler.interval_secs"));
    }

    #[test]
    fn empty_prefix_rejected() {
        let config = Config::parse("[billing]\nidempotency_prefix = \"\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn balance_url_requires_key() {
        let mut config = Config::default();
        config.balance.api_url = Some("http://balance".into());
        assert!(config.validate().is_err());
        config.balance.internal_key = "k".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 7100);
    }
}
