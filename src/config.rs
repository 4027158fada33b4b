use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::backends::{CredentialProvider, Credentials};
use crate::descriptor::SecretDescriptor;
use crate::engine::EngineOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_environment")]
    pub default_environment: String,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub secrets: Vec<SecretDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub address: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_reconcile_debounce_ms")]
    pub reconcile_debounce_ms: u64,
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,
}

fn default_environment() -> String {
    "default".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_reconcile_debounce_ms() -> u64 {
    500
}

fn default_persist_debounce_ms() -> u64 {
    300
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconcile_debounce_ms: default_reconcile_debounce_ms(),
            persist_debounce_ms: default_persist_debounce_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_environment: default_environment(),
            environments: BTreeMap::new(),
            sync: SyncConfig::default(),
            secrets: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let mut config: Self = toml::from_str(&contents).context("Failed to parse config file")?;
        config.secrets = config
            .secrets
            .into_iter()
            .map(SecretDescriptor::normalized)
            .collect();
        Ok(config)
    }

    /// Load a single environment from environment variables
    pub fn from_env() -> Result<Self> {
        let name = std::env::var("VSYNC_ENV").unwrap_or_else(|_| default_environment());
        let environment = EnvironmentConfig {
            address: std::env::var("VAULT_ADDR")
                .context("VAULT_ADDR environment variable not set")?,
            token: std::env::var("VAULT_TOKEN")
                .context("VAULT_TOKEN environment variable not set")?,
            namespace: std::env::var("VAULT_NAMESPACE").ok().filter(|n| !n.is_empty()),
            timeout_seconds: std::env::var("VAULT_TIMEOUT_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_timeout_seconds),
        };

        Ok(Self::default().with_environment(&name, environment))
    }

    /// Add or replace an environment and make it the default
    pub fn with_environment(mut self, name: &str, environment: EnvironmentConfig) -> Self {
        self.environments.insert(name.to_string(), environment);
        self.default_environment = name.to_string();
        self
    }

    /// Create a sample configuration file
    pub fn create_sample<P: AsRef<Path>>(path: P) -> Result<()> {
        let mut sample = Self::default().with_environment(
            "dev",
            EnvironmentConfig {
                address: "http://127.0.0.1:8200".to_string(),
                token: "your-vault-token-here".to_string(),
                namespace: None,
                timeout_seconds: default_timeout_seconds(),
            },
        );
        sample.secrets = vec![SecretDescriptor::new(
            "DB_PASS",
            "kv/acme/dev/0/app",
            "db_pass",
        )];

        let toml_string =
            toml::to_string_pretty(&sample).context("Failed to serialize sample config")?;
        fs::write(path.as_ref(), toml_string)
            .with_context(|| format!("Failed to write sample config to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// HTTP timeout for an environment, falling back to the default
    pub fn timeout(&self, environment: &str) -> Duration {
        let seconds = self
            .environments
            .get(environment)
            .map(|e| e.timeout_seconds)
            .unwrap_or_else(default_timeout_seconds);
        Duration::from_secs(seconds)
    }

    /// Engine options derived from the `[sync]` section
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            reconcile_debounce: Duration::from_millis(self.sync.reconcile_debounce_ms),
            persist_debounce: Duration::from_millis(self.sync.persist_debounce_ms),
            ..EngineOptions::default()
        }
    }
}

impl CredentialProvider for Config {
    fn get_credentials(&self, environment: &str) -> Option<Credentials> {
        let env = self.environments.get(environment)?;
        if env.address.trim().is_empty() || env.token.trim().is_empty() {
            return None;
        }
        Some(Credentials {
            url: env.address.trim().to_string(),
            token: env.token.trim().to_string(),
            namespace: env.namespace.clone().filter(|n| !n.is_empty()),
        })
    }
}
