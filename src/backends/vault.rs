use anyhow::{Context, Result};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::transport::{
    decode_legacy, decode_structured, encode_legacy, encode_structured, CredentialProvider,
    Credentials, SecretFields, StructuredSecret, VaultTransport,
};
use crate::metadata::SecretMetadata;

/// HashiCorp Vault client for KV v2 mounts
#[derive(Clone)]
pub struct VaultHttpClient {
    client: Client,
    credentials: Arc<dyn CredentialProvider>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VaultResponse<T> {
    data: T,
}

/// Read-merge-write rounds before giving up on a busy path
const CAS_ATTEMPTS: usize = 3;

#[derive(Debug, Serialize, Deserialize)]
struct KvData {
    data: Option<SecretFields>,
    #[serde(default)]
    metadata: Option<KvVersion>,
}

#[derive(Debug, Serialize, Deserialize)]
struct KvVersion {
    #[serde(default)]
    version: u64,
}

#[derive(Debug, Serialize)]
struct VaultWriteRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<WriteOptions>,
    data: SecretFields,
}

#[derive(Debug, Serialize)]
struct WriteOptions {
    cas: u64,
}

/// Fields stored at a path and the version they were read at
#[derive(Debug, Default)]
struct KvSecret {
    fields: Option<SecretFields>,
    version: Option<u64>,
}

impl VaultHttpClient {
    /// Create a new Vault client
    pub fn new(credentials: Arc<dyn CredentialProvider>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            credentials,
        })
    }

    fn resolve(&self, environment: &str) -> Result<Credentials> {
        self.credentials.get_credentials(environment).ok_or_else(|| {
            anyhow::anyhow!(
                "no credentials configured for environment '{}'",
                environment
            )
        })
    }

    /// Build the KV v2 data URL; the first path segment is the mount
    pub(crate) fn data_url(address: &str, path: &str) -> Result<String> {
        let path = path.trim_matches('/');
        let (mount, rest) = path
            .split_once('/')
            .filter(|(mount, rest)| !mount.is_empty() && !rest.is_empty())
            .with_context(|| format!("Secret path '{}' must be <mount>/<path>", path))?;
        Ok(format!(
            "{}/v1/{}/data/{}",
            address.trim_end_matches('/'),
            mount,
            rest
        ))
    }

    fn request(&self, method: Method, url: &str, credentials: &Credentials) -> RequestBuilder {
        let mut request = self
            .client
            .request(method, url)
            .header("X-Vault-Token", &credentials.token);
        if let Some(namespace) = credentials.namespace.as_deref().filter(|n| !n.is_empty()) {
            request = request.header("X-Vault-Namespace", namespace);
        }
        request
    }

    /// Read all fields at a path. `fields` is `None` when the secret does not
    /// exist; a missing secret reads at version 0 unless Vault reports a
    /// deleted version.
    async fn read_fields(&self, environment: &str, path: &str) -> Result<KvSecret> {
        let credentials = self.resolve(environment)?;
        let url = Self::data_url(&credentials.url, path)?;
        debug!("Reading secret from: {}", url);

        let response = self
            .request(Method::GET, &url, &credentials)
            .send()
            .await
            .context("Failed to read secret from Vault")?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("No secret at {}", path);
            let version = response
                .json::<VaultResponse<KvData>>()
                .await
                .ok()
                .and_then(|r| r.data.metadata)
                .map(|m| m.version)
                .unwrap_or(0);
            return Ok(KvSecret {
                fields: None,
                version: Some(version),
            });
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Vault request failed with status {}: {}", status, body);
        }

        let vault_response: VaultResponse<KvData> = response
            .json()
            .await
            .context("Failed to parse Vault response")?;

        Ok(KvSecret {
            fields: vault_response.data.data,
            version: vault_response.data.metadata.map(|m| m.version),
        })
    }

    /// Replace one field, keeping every other field stored at the same path.
    ///
    /// The write is check-and-set against the version that was read, so a
    /// concurrent writer to a sibling field forces a fresh read instead of
    /// being overwritten.
    async fn write_field(
        &self,
        environment: &str,
        path: &str,
        key: &str,
        field: serde_json::Value,
    ) -> Result<()> {
        for attempt in 1..=CAS_ATTEMPTS {
            let current = self
                .read_fields(environment, path)
                .await
                .context("Failed to read current secret before write")?;
            let mut data = current.fields.unwrap_or_default();
            data.insert(key.to_string(), field.clone());

            if self.post_fields(environment, path, data, current.version).await? {
                info!("Successfully wrote {}#{}", path, key);
                return Ok(());
            }
            debug!(
                "Check-and-set conflict writing {} (attempt {}/{})",
                path, attempt, CAS_ATTEMPTS
            );
        }
        anyhow::bail!(
            "Secret at {} changed during {} write attempts",
            path,
            CAS_ATTEMPTS
        )
    }

    /// POST the full field set. Returns false on a check-and-set conflict.
    async fn post_fields(
        &self,
        environment: &str,
        path: &str,
        data: SecretFields,
        version: Option<u64>,
    ) -> Result<bool> {
        let credentials = self.resolve(environment)?;
        let url = Self::data_url(&credentials.url, path)?;
        debug!("Writing secret to: {} (cas {:?})", url, version);

        let request = VaultWriteRequest {
            options: version.map(|cas| WriteOptions { cas }),
            data,
        };
        let response = self
            .request(Method::POST, &url, &credentials)
            .json(&request)
            .send()
            .await
            .context("Failed to write secret to Vault")?;

        if response.status().is_success() {
            return Ok(true);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && body.contains("check-and-set") {
            return Ok(false);
        }
        anyhow::bail!("Vault write failed with status {}: {}", status, body);
    }
}

#[async_trait::async_trait]
impl VaultTransport for VaultHttpClient {
    async fn test_connection(&self, environment: &str, credentials: &Credentials) -> Result<()> {
        let url = format!(
            "{}/v1/auth/token/lookup-self",
            credentials.url.trim_end_matches('/')
        );
        debug!("Testing connection for {} at: {}", environment, url);

        let response = self
            .request(Method::GET, &url, credentials)
            .send()
            .await
            .context("Failed to reach Vault")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Vault connection test failed with status {}: {}", status, body);
        }

        Ok(())
    }

    async fn read_secret(&self, environment: &str, path: &str, key: &str) -> Result<Option<String>> {
        let secret = self.read_fields(environment, path).await?;
        Ok(secret.fields.and_then(|f| decode_legacy(f.get(key))))
    }

    async fn read_secret_with_metadata(
        &self,
        environment: &str,
        path: &str,
        key: &str,
    ) -> Result<StructuredSecret> {
        let secret = self.read_fields(environment, path).await?;
        Ok(secret
            .fields
            .map(|f| decode_structured(f.get(key)))
            .unwrap_or_default())
    }

    async fn write_secret(
        &self,
        environment: &str,
        path: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.write_field(environment, path, key, encode_legacy(value))
            .await
    }

    async fn write_secret_with_metadata(
        &self,
        environment: &str,
        path: &str,
        key: &str,
        value: &str,
        metadata: &SecretMetadata,
    ) -> Result<()> {
        self.write_field(environment, path, key, encode_structured(value, metadata))
            .await
    }

    fn transport_type(&self) -> &'static str {
        "HashiCorp Vault"
    }
}
