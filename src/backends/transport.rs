use anyhow::Result;
use serde_json::{json, Map, Value};
use std::fmt;

use crate::metadata::SecretMetadata;

/// Connection details for one environment
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub url: String,
    pub token: String,
    pub namespace: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// Resolves stored credentials for an environment
pub trait CredentialProvider: Send + Sync {
    fn get_credentials(&self, environment: &str) -> Option<Credentials>;
}

/// Result of a structured read: the value plus any metadata stored with it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuredSecret {
    pub value: Option<String>,
    pub metadata: Option<SecretMetadata>,
}

/// Trait for the remote store the engine reads from and writes to.
///
/// Reads of a missing secret return an empty result, not an error.
#[async_trait::async_trait]
pub trait VaultTransport: Send + Sync {
    /// Check reachability and authentication with explicit credentials
    async fn test_connection(&self, environment: &str, credentials: &Credentials) -> Result<()>;

    /// Value-only read of secrets written before metadata support
    async fn read_secret(&self, environment: &str, path: &str, key: &str) -> Result<Option<String>>;

    /// Read value and metadata
    async fn read_secret_with_metadata(
        &self,
        environment: &str,
        path: &str,
        key: &str,
    ) -> Result<StructuredSecret>;

    /// Value-only write
    async fn write_secret(&self, environment: &str, path: &str, key: &str, value: &str)
        -> Result<()>;

    /// Write value with metadata
    async fn write_secret_with_metadata(
        &self,
        environment: &str,
        path: &str,
        key: &str,
        value: &str,
        metadata: &SecretMetadata,
    ) -> Result<()>;

    /// Get the transport type name for display purposes
    fn transport_type(&self) -> &'static str;
}

// Field encodings inside a secret's data map. A structured field is an object
// `{"value": "...", "metadata": {...}}`; a legacy field is a bare string.

pub(crate) fn decode_structured(field: Option<&Value>) -> StructuredSecret {
    let Some(Value::Object(obj)) = field else {
        return StructuredSecret::default();
    };
    let value = obj
        .get("value")
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    let metadata = obj
        .get("metadata")
        .cloned()
        .and_then(|m| SecretMetadata::try_from(m).ok());
    StructuredSecret { value, metadata }
}

pub(crate) fn decode_legacy(field: Option<&Value>) -> Option<String> {
    field
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub(crate) fn encode_structured(value: &str, metadata: &SecretMetadata) -> Value {
    json!({
        "value": value,
        "metadata": metadata.clone().into_value(),
    })
}

pub(crate) fn encode_legacy(value: &str) -> Value {
    Value::String(value.to_string())
}

pub(crate) type SecretFields = Map<String, Value>;
