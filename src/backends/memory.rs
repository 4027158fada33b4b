use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::transport::{
    decode_legacy, decode_structured, encode_legacy, encode_structured, Credentials, SecretFields,
    StructuredSecret, VaultTransport,
};
use crate::metadata::SecretMetadata;

/// Number of calls made per transport operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub test_connection: usize,
    pub read: usize,
    pub read_with_metadata: usize,
    pub write: usize,
    pub write_with_metadata: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.test_connection + self.read + self.read_with_metadata + self.write + self.write_with_metadata
    }
}

#[derive(Default)]
struct Counters {
    test_connection: AtomicUsize,
    read: AtomicUsize,
    read_with_metadata: AtomicUsize,
    write: AtomicUsize,
    write_with_metadata: AtomicUsize,
}

/// In-process secret store using the same field encodings as Vault.
///
/// Counts calls and can be told to fail, so engine behaviour can be
/// exercised without a server.
#[derive(Default)]
pub struct MemoryTransport {
    secrets: Mutex<HashMap<String, SecretFields>>,
    connection_error: Mutex<Option<String>>,
    failing_paths: Mutex<HashSet<String>>,
    fail_writes: AtomicBool,
    read_delay: Mutex<Option<Duration>>,
    connection_delay: Mutex<Option<Duration>>,
    counters: Counters,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_secrets<T>(&self, f: impl FnOnce(&mut HashMap<String, SecretFields>) -> T) -> T {
        let mut guard = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Store a value in the value-only format
    pub fn insert_legacy(&self, path: &str, key: &str, value: &str) {
        self.with_secrets(|s| {
            s.entry(path.to_string())
                .or_default()
                .insert(key.to_string(), encode_legacy(value));
        });
    }

    /// Store a value with metadata
    pub fn insert_structured(&self, path: &str, key: &str, value: &str, metadata: &SecretMetadata) {
        self.with_secrets(|s| {
            s.entry(path.to_string())
                .or_default()
                .insert(key.to_string(), encode_structured(value, metadata));
        });
    }

    pub fn remove(&self, path: &str, key: &str) {
        self.with_secrets(|s| {
            if let Some(fields) = s.get_mut(path) {
                fields.remove(key);
            }
        });
    }

    /// Value stored at `path#key` in either format
    pub fn value(&self, path: &str, key: &str) -> Option<String> {
        self.with_secrets(|s| {
            let field = s.get(path).and_then(|f| f.get(key));
            decode_structured(field).value.or_else(|| decode_legacy(field))
        })
    }

    /// Metadata stored at `path#key`, if written in the structured format
    pub fn metadata(&self, path: &str, key: &str) -> Option<SecretMetadata> {
        self.with_secrets(|s| decode_structured(s.get(path).and_then(|f| f.get(key))).metadata)
    }

    /// Make connection tests fail with `message`, or succeed with `None`
    pub fn set_connection_error(&self, message: Option<&str>) {
        *self.connection_error.lock().unwrap_or_else(|e| e.into_inner()) =
            message.map(str::to_string);
    }

    /// Make every read and write under `path` fail
    pub fn fail_path(&self, path: &str) {
        self.failing_paths
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string());
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay every read by `delay`
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Delay every connection test by `delay`. The error and delay in effect
    /// when a test starts decide its outcome.
    pub fn set_connection_delay(&self, delay: Option<Duration>) {
        *self.connection_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            test_connection: self.counters.test_connection.load(Ordering::SeqCst),
            read: self.counters.read.load(Ordering::SeqCst),
            read_with_metadata: self.counters.read_with_metadata.load(Ordering::SeqCst),
            write: self.counters.write.load(Ordering::SeqCst),
            write_with_metadata: self.counters.write_with_metadata.load(Ordering::SeqCst),
        }
    }

    fn check_path(&self, path: &str) -> Result<()> {
        if self
            .failing_paths
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
        {
            anyhow::bail!("simulated failure for {}", path);
        }
        Ok(())
    }

    async fn before_read(&self, path: &str) -> Result<()> {
        let delay = *self.read_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_path(path)
    }

    fn before_write(&self, path: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("simulated write failure for {}", path);
        }
        self.check_path(path)
    }
}

#[async_trait::async_trait]
impl VaultTransport for MemoryTransport {
    async fn test_connection(&self, _environment: &str, _credentials: &Credentials) -> Result<()> {
        self.counters.test_connection.fetch_add(1, Ordering::SeqCst);
        let error = self
            .connection_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let delay = *self.connection_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match error {
            Some(message) => anyhow::bail!(message),
            None => Ok(()),
        }
    }

    async fn read_secret(&self, _environment: &str, path: &str, key: &str) -> Result<Option<String>> {
        self.counters.read.fetch_add(1, Ordering::SeqCst);
        self.before_read(path).await?;
        Ok(self.with_secrets(|s| decode_legacy(s.get(path).and_then(|f| f.get(key)))))
    }

    async fn read_secret_with_metadata(
        &self,
        _environment: &str,
        path: &str,
        key: &str,
    ) -> Result<StructuredSecret> {
        self.counters.read_with_metadata.fetch_add(1, Ordering::SeqCst);
        self.before_read(path).await?;
        Ok(self.with_secrets(|s| decode_structured(s.get(path).and_then(|f| f.get(key)))))
    }

    async fn write_secret(
        &self,
        _environment: &str,
        path: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.counters.write.fetch_add(1, Ordering::SeqCst);
        self.before_write(path)?;
        self.insert_legacy(path, key, value);
        Ok(())
    }

    async fn write_secret_with_metadata(
        &self,
        _environment: &str,
        path: &str,
        key: &str,
        value: &str,
        metadata: &SecretMetadata,
    ) -> Result<()> {
        self.counters.write_with_metadata.fetch_add(1, Ordering::SeqCst);
        self.before_write(path)?;
        self.insert_structured(path, key, value, metadata);
        Ok(())
    }

    fn transport_type(&self) -> &'static str {
        "in-memory"
    }
}
