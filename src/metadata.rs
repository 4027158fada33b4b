use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque metadata attached to a write, e.g. certificate type, format,
/// expiry or fingerprint. The engine forwards it verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretMetadata(Map<String, Value>);

impl SecretMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse metadata from a JSON object string
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Self::try_from(value)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl TryFrom<Value> for SecretMetadata {
    type Error = anyhow::Error;

    fn try_from(value: Value) -> anyhow::Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => anyhow::bail!("metadata must be a JSON object, got {}", other),
        }
    }
}
