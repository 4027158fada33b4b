//! CLI parsing and command execution
//!
//! This module handles command-line argument parsing and drives the sync engine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use vault_sync::backends::VaultHttpClient;
use vault_sync::config::{Config, EnvironmentConfig};
use vault_sync::engine::SyncEngine;
use vault_sync::metadata::SecretMetadata;
use vault_sync::reconcile::{ReconcileReport, SyncStatus};
use vault_sync::store::{load_drafts, save_drafts};

#[derive(Parser)]
#[command(name = "vsync")]
#[command(about = "Reconcile locally edited secrets against HashiCorp Vault", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "VSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Environment to use (overrides default_environment)
    #[arg(short, long, global = true, env = "VSYNC_ENV")]
    pub env: Option<String>,

    /// Vault address (overrides config file)
    #[arg(long, env = "VAULT_ADDR")]
    pub vault_addr: Option<String>,

    /// Vault token (overrides config file)
    #[arg(long, env = "VAULT_TOKEN")]
    pub vault_token: Option<String>,

    /// Vault namespace (overrides config file)
    #[arg(long, env = "VAULT_NAMESPACE")]
    pub vault_namespace: Option<String>,

    /// File holding locally entered values
    #[arg(long, global = true)]
    pub drafts: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a sample configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "vsync.toml")]
        output: PathBuf,
    },

    /// Test the connection to Vault
    Check,

    /// Read remote values for every configured secret; with --drafts, store
    /// values that have no local draft yet
    Pull,

    /// Compare local drafts with Vault
    Status,

    /// Write a secret to Vault
    Push {
        /// Secret name
        name: String,

        /// Value to write (defaults to the local draft)
        #[arg(long)]
        value: Option<String>,

        /// Metadata to store with the value, as a JSON object
        #[arg(long)]
        metadata: Option<String>,
    },
}

const DEFAULT_DRAFTS: &str = "vsync-drafts.toml";

impl Cli {
    /// Drafts file for commands that always use one
    fn drafts_path(&self) -> PathBuf {
        self.drafts
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DRAFTS))
    }
}

/// Execute a CLI command
pub async fn execute(cli: Cli) -> Result<()> {
    // Handle init command separately as it doesn't need Vault
    if let Commands::Init { output } = &cli.command {
        Config::create_sample(output)
            .with_context(|| format!("Failed to create sample config at {:?}", output))?;
        info!("Sample configuration created at {:?}", output);
        return Ok(());
    }

    let mut config = if let Some(config_path) = &cli.config {
        Config::from_file(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        Config::from_env().context("Failed to load config from environment")?
    };

    let environment = cli
        .env
        .clone()
        .unwrap_or_else(|| config.default_environment.clone());
    apply_overrides(&mut config, &environment, &cli);

    let engine = create_engine(&config, &environment)?;
    let result = run(&engine, &cli, &config).await;
    engine.shutdown();
    result
}

async fn run(engine: &SyncEngine, cli: &Cli, config: &Config) -> Result<()> {
    match &cli.command {
        Commands::Init { .. } => unreachable!(), // Handled above

        Commands::Check => {
            engine
                .check_connection()
                .await
                .context("Connection check failed")?;
            println!("✓ Connected to Vault ({})", engine.environment());
        }

        Commands::Pull => {
            engine
                .check_connection()
                .await
                .context("Connection check failed")?;
            let values = engine.load_values().await;

            println!("Remote values in {}:", engine.environment());
            for descriptor in &config.secrets {
                let marker = if !descriptor.is_addressable() {
                    "skipped (no path or key)"
                } else if values.contains_key(&descriptor.name) {
                    "found"
                } else {
                    "missing"
                };
                println!("  {:<24} {}", descriptor.name, marker);
            }

            if let Some(path) = &cli.drafts {
                let mut drafts = load_drafts(path)?;
                let filled = drafts.fill_missing(values);
                save_drafts(path, &drafts)?;
                println!("✓ Stored {} new value(s) in {:?}", filled, path);
            }
        }

        Commands::Status => {
            engine
                .check_connection()
                .await
                .context("Connection check failed")?;
            engine.restore_local_values(load_drafts(cli.drafts_path())?);
            let report = engine
                .reconcile_now()
                .await
                .context("Not connected to Vault")?;
            print_report(&report);
        }

        Commands::Push {
            name,
            value,
            metadata,
        } => {
            let drafts_path = cli.drafts_path();
            let mut drafts = load_drafts(&drafts_path)?;
            let name = name.trim().to_uppercase();
            let value = match value {
                Some(value) => value.clone(),
                None => drafts
                    .get(&name)
                    .map(str::to_string)
                    .with_context(|| format!("No value given and no draft for {}", name))?,
            };
            let metadata = metadata
                .as_deref()
                .map(SecretMetadata::from_json)
                .transpose()
                .context("Invalid --metadata")?;

            engine
                .check_connection()
                .await
                .context("Connection check failed")?;
            engine
                .save_secret(&name, &value, metadata.as_ref())
                .await
                .context("Failed to write secret")?;
            println!("✓ Saved {} to Vault ({})", name, engine.environment());

            drafts.insert(name.clone(), value);
            save_drafts(&drafts_path, &drafts)?;
            engine.restore_local_values(drafts);
            if let Some(report) = engine.reconcile_now().await {
                print_report(&report);
            }
        }
    }

    Ok(())
}

fn print_report(report: &ReconcileReport) {
    for outcome in &report.outcomes {
        let status = outcome
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        match &outcome.error {
            Some(error) => println!("  {:<24} {} ({})", outcome.name, status, error),
            None => println!("  {:<24} {}", outcome.name, status),
        }
    }
    println!(
        "{} synced, {} out of sync, {} error(s)",
        report.count(SyncStatus::Synced),
        report.count(SyncStatus::OutOfSync),
        report.count(SyncStatus::Error)
    );
}

/// Apply command-line Vault settings to the selected environment
fn apply_overrides(config: &mut Config, environment: &str, cli: &Cli) {
    if cli.vault_addr.is_none() && cli.vault_token.is_none() && cli.vault_namespace.is_none() {
        return;
    }
    let entry = config
        .environments
        .entry(environment.to_string())
        .or_insert_with(|| EnvironmentConfig {
            address: String::new(),
            token: String::new(),
            namespace: None,
            timeout_seconds: 30,
        });
    if let Some(addr) = &cli.vault_addr {
        entry.address = addr.clone();
    }
    if let Some(token) = &cli.vault_token {
        entry.token = token.clone();
    }
    if let Some(namespace) = &cli.vault_namespace {
        entry.namespace = Some(namespace.clone());
    }
}

/// Create the engine over an HTTP transport
fn create_engine(config: &Config, environment: &str) -> Result<SyncEngine> {
    let credentials = Arc::new(config.clone());
    let client = VaultHttpClient::new(credentials.clone(), config.timeout(environment))
        .context("Failed to create Vault client")?;

    Ok(SyncEngine::with_options(
        Arc::new(client),
        credentials,
        environment,
        config.secrets.clone(),
        config.engine_options(),
    ))
}
