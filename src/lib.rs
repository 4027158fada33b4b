//! Vault Secret Sync Library
//!
//! Keeps locally edited secret values in step with HashiCorp Vault and
//! reports a per-secret synchronization status.

pub mod backends;
pub mod config;
pub mod connection;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod loader;
pub mod metadata;
pub mod reconcile;
pub mod scheduler;
pub mod store;
pub mod strategy;
pub mod writer;

pub use backends::{CredentialProvider, Credentials, MemoryTransport, VaultHttpClient, VaultTransport};
pub use config::Config;
pub use connection::{ConnectionState, ConnectionStatus};
pub use descriptor::{LocalValueCache, SecretDescriptor};
pub use engine::{EngineOptions, SyncEngine};
pub use error::SyncError;
pub use metadata::SecretMetadata;
pub use reconcile::{ReconcileReport, SyncStatus};
