use tracing::{info, warn};

use crate::backends::VaultTransport;
use crate::connection::ConnectionStatus;
use crate::descriptor::SecretDescriptor;
use crate::error::{describe, SyncError};
use crate::metadata::SecretMetadata;

/// Persist one secret to the remote store.
///
/// Validation happens before anything else, then the connection is
/// required. Exactly one write call is made. The local cache is never
/// touched here; on success the caller records the value and schedules a
/// reconciliation.
pub async fn write_secret(
    transport: &dyn VaultTransport,
    connection: &ConnectionStatus,
    descriptor: &SecretDescriptor,
    value: &str,
    metadata: Option<&SecretMetadata>,
) -> Result<(), SyncError> {
    validate(descriptor, value)?;

    let environment = match connection.environment.as_deref() {
        Some(environment) if connection.is_connected() => environment,
        _ => return Err(SyncError::ConnectionRequired),
    };

    let path = &descriptor.remote_path;
    let key = &descriptor.remote_key;
    let result = match metadata {
        Some(metadata) => {
            transport
                .write_secret_with_metadata(environment, path, key, value, metadata)
                .await
        }
        None => transport.write_secret(environment, path, key, value).await,
    };

    match result {
        Ok(()) => {
            info!("Saved {} to {}", descriptor.name, descriptor.location());
            Ok(())
        }
        Err(e) => {
            warn!("Failed to save {}: {:#}", descriptor.name, e);
            Err(SyncError::WriteFailure {
                name: descriptor.name.clone(),
                message: describe(&e),
            })
        }
    }
}

fn validate(descriptor: &SecretDescriptor, value: &str) -> Result<(), SyncError> {
    if descriptor.remote_path.is_empty() {
        return Err(SyncError::Validation(format!(
            "secret '{}' has no path",
            descriptor.name
        )));
    }
    if descriptor.remote_key.is_empty() {
        return Err(SyncError::Validation(format!(
            "secret '{}' has no key",
            descriptor.name
        )));
    }
    if descriptor.name.is_empty() {
        return Err(SyncError::Validation("secret has no name".to_string()));
    }
    if value.is_empty() {
        return Err(SyncError::Validation(format!(
            "secret '{}' has no value",
            descriptor.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryTransport;
    use crate::connection::ConnectionState;

    fn connected() -> ConnectionStatus {
        ConnectionStatus {
            state: ConnectionState::Success,
            credentials_present: true,
            environment: Some("dev".to_string()),
            ..ConnectionStatus::default()
        }
    }

    fn descriptor() -> SecretDescriptor {
        SecretDescriptor::new("DB_PASS", "kv/acme/dev/0/app", "db_pass")
    }

    #[tokio::test]
    async fn test_value_only_write() {
        let store = MemoryTransport::new();
        write_secret(&store, &connected(), &descriptor(), "abc", None)
            .await
            .unwrap();
        assert_eq!(store.value("kv/acme/dev/0/app", "db_pass").as_deref(), Some("abc"));
        assert_eq!(store.calls().write, 1);
        assert_eq!(store.calls().write_with_metadata, 0);
    }

    #[tokio::test]
    async fn test_metadata_forwarded_verbatim() {
        let store = MemoryTransport::new();
        let meta = SecretMetadata::new()
            .with("type", "certificate")
            .with("fingerprint", "AB:CD");
        write_secret(&store, &connected(), &descriptor(), "pem", Some(&meta))
            .await
            .unwrap();
        assert_eq!(store.metadata("kv/acme/dev/0/app", "db_pass"), Some(meta));
        assert_eq!(store.calls().write_with_metadata, 1);
    }

    #[tokio::test]
    async fn test_validation_before_network() {
        let store = MemoryTransport::new();
        let cases = [
            (SecretDescriptor::new("A", "", "k"), "v"),
            (SecretDescriptor::new("A", "kv/a", ""), "v"),
            (SecretDescriptor::new("A", "kv/a", "k"), ""),
        ];
        for (descriptor, value) in cases {
            let err = write_secret(&store, &connected(), &descriptor, value, None)
                .await
                .unwrap_err();
            assert!(matches!(err, SyncError::Validation(_)));
        }
        assert_eq!(store.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let store = MemoryTransport::new();
        let err = write_secret(&store, &ConnectionStatus::default(), &descriptor(), "abc", None)
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::ConnectionRequired);
        assert_eq!(store.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_write_failure_reported() {
        let store = MemoryTransport::new();
        store.set_fail_writes(true);
        let err = write_secret(&store, &connected(), &descriptor(), "abc", None)
            .await
            .unwrap_err();
        match err {
            SyncError::WriteFailure { name, message } => {
                assert_eq!(name, "DB_PASS");
                assert!(message.contains("simulated"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
