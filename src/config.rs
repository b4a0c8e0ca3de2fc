//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! The database URL is referenced by env-var name in the config and
//! resolved at runtime, falling back to `default_database_url`.

use anyhow::{ensure, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub service: ServiceConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    pub storage: StorageConfig,
    pub events: EventsConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub currency: String,
    /// How often the background reconciliation pass runs.
    pub reconcile_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerConfig {
    pub min_withdrawal: Decimal,
    pub max_withdrawal: Decimal,
    pub daily_withdrawal_limit: Decimal,
    pub max_deposit: Decimal,
    pub lock_timeout_ms: u64,
    pub busy_retries: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            min_withdrawal: dec!(1),
            max_withdrawal: dec!(100000),
            daily_withdrawal_limit: dec!(50000),
            max_deposit: dec!(100000),
            lock_timeout_ms: 250,
            busy_retries: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SettlementConfig {
    /// Attempts for a settlement run that left bets unsettled.
    pub max_retries: u32,
    pub retry_delay_secs: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url_env: String,
    pub default_database_url: String,
}

impl StorageConfig {
    /// Database URL from the configured env var, else the default.
    pub fn database_url(&self) -> SecretString {
        let url = AppConfig::resolve_env(&self.database_url_env)
            .unwrap_or_else(|_| self.default_database_url.clone());
        SecretString::new(url)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Fixture,
    Http,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventsConfig {
    pub source: EventSource,
    #[serde(default)]
    pub fixture_path: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        ensure!(
            config.service.reconcile_interval_secs > 0,
            "service.reconcile_interval_secs must be at least 1"
        );
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const MINIMAL: &str = r#"
        [service]
        name = "wallet-test"
        currency = "USD"
        reconcile_interval_secs = 60

        [storage]
        backend = "memory"
        database_url_env = "LOOSELINE_TEST_UNSET_DATABASE_URL"
        default_database_url = "sqlite::memory:"

        [events]
        source = "fixture"
        fixture_path = "fixtures/events.json"

        [api]
        enabled = false
        port = 8080
    "#;

    #[test]
    fn test_parse_minimal_uses_defaults() {
        let cfg = AppConfig::parse(MINIMAL).unwrap();
        assert_eq!(cfg.service.currency, "USD");
        assert_eq!(cfg.ledger.min_withdrawal, dec!(1));
        assert_eq!(cfg.ledger.daily_withdrawal_limit, dec!(50000));
        assert_eq!(cfg.settlement.max_retries, 5);
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert_eq!(cfg.events.source, EventSource::Fixture);
        assert!(cfg.events.base_url.is_none());
    }

    #[test]
    fn test_database_url_falls_back_to_default() {
        let cfg = AppConfig::parse(MINIMAL).unwrap();
        assert_eq!(cfg.storage.database_url().expose_secret(), "sqlite::memory:");
    }

    #[test]
    fn test_ledger_overrides() {
        let toml = format!(
            "{MINIMAL}\n[ledger]\nmin_withdrawal = 10.0\nbusy_retries = 1\n"
        );
        let cfg = AppConfig::parse(&toml).unwrap();
        assert_eq!(cfg.ledger.min_withdrawal, dec!(10));
        assert_eq!(cfg.ledger.busy_retries, 1);
        assert_eq!(cfg.ledger.max_deposit, dec!(100000));
    }

    #[test]
    fn test_load_config() {
        let cfg = AppConfig::load("config.toml").unwrap();
        assert_eq!(cfg.service.name, "looseline-wallet");
        assert!(cfg.ledger.max_withdrawal >= cfg.ledger.min_withdrawal);
    }

    #[test]
    fn test_zero_reconcile_interval_rejected() {
        let toml = MINIMAL.replace("reconcile_interval_secs = 60", "reconcile_interval_secs = 0");
        let err = AppConfig::parse(&toml).unwrap_err();
        assert!(err.to_string().contains("reconcile_interval_secs"), "{err}");
    }
}
