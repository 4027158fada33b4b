use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::backends::VaultTransport;
use crate::connection::ConnectionStatus;
use crate::descriptor::{addressable, SecretDescriptor};
use crate::strategy::{fetch_remote, ReadStrategy};

/// Bulk-read remote values for `descriptors`.
///
/// Returns nothing until `connection` is successful. Reads run one after
/// another; a failing read is logged and skipped, so the result holds every
/// secret that yielded a value.
pub async fn load_values(
    transport: &dyn VaultTransport,
    connection: &ConnectionStatus,
    descriptors: &[SecretDescriptor],
    strategies: &[ReadStrategy],
) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    let environment = match connection.environment.as_deref() {
        Some(environment) if connection.is_connected() => environment,
        _ => {
            debug!("Not connected, skipping bulk load");
            return values;
        }
    };
    let mut failures = 0usize;

    for descriptor in addressable(descriptors) {
        match fetch_remote(transport, environment, descriptor, strategies).await {
            Ok(Some(value)) => {
                values.insert(descriptor.name.clone(), value);
            }
            Ok(None) => {
                debug!("No remote value for {} at {}", descriptor.name, descriptor.location());
            }
            Err(e) => {
                failures += 1;
                warn!(
                    "Failed to load {} from {}: {:#}",
                    descriptor.name,
                    descriptor.location(),
                    e
                );
            }
        }
    }

    info!(
        "Loaded {} remote value(s) from {} ({} failed)",
        values.len(),
        environment,
        failures
    );
    values
}
