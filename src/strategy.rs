//! Ordered read strategies
//!
//! Secrets written before metadata support exist only in the value-only
//! format, so a read tries each strategy in turn until one yields a value.

use anyhow::Result;
use tracing::debug;

use crate::backends::VaultTransport;
use crate::descriptor::SecretDescriptor;

/// One way of reading a secret's value from the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    /// Value plus metadata
    Structured,
    /// Value only
    Legacy,
}

/// Structured first, then legacy
pub const DEFAULT_READ_ORDER: &[ReadStrategy] = &[ReadStrategy::Structured, ReadStrategy::Legacy];

impl ReadStrategy {
    pub async fn read(
        self,
        transport: &dyn VaultTransport,
        environment: &str,
        descriptor: &SecretDescriptor,
    ) -> Result<Option<String>> {
        let path = &descriptor.remote_path;
        let key = &descriptor.remote_key;
        let value = match self {
            ReadStrategy::Structured => {
                transport
                    .read_secret_with_metadata(environment, path, key)
                    .await?
                    .value
            }
            ReadStrategy::Legacy => transport.read_secret(environment, path, key).await?,
        };
        Ok(value.filter(|v| !v.is_empty()))
    }
}

/// Read the current remote value for `descriptor`, trying `strategies` in order.
///
/// Returns the first non-empty value. An error from any strategy stops the
/// chain and is returned.
pub async fn fetch_remote(
    transport: &dyn VaultTransport,
    environment: &str,
    descriptor: &SecretDescriptor,
    strategies: &[ReadStrategy],
) -> Result<Option<String>> {
    for strategy in strategies {
        if let Some(value) = strategy.read(transport, environment, descriptor).await? {
            debug!("Read {} using {:?} format", descriptor.location(), strategy);
            return Ok(Some(value));
        }
    }
    Ok(None)
}
