//! Local versus remote comparison
//!
//! A pass marks every addressable secret `checking` up front, then reads
//! each remote value in descriptor order and settles its status. Statuses
//! are merged key by key into a shared map.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::backends::VaultTransport;
use crate::connection::ConnectionStatus;
use crate::descriptor::{addressable, LocalValueCache, SecretDescriptor};
use crate::strategy::{fetch_remote, ReadStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    Checking,
    Synced,
    OutOfSync,
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncStatus::Checking => "checking",
            SyncStatus::Synced => "synced",
            SyncStatus::OutOfSync => "out-of-sync",
            SyncStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Compare a local and a remote value. `None` means "no opinion".
pub fn classify(local: Option<&str>, remote: Option<&str>) -> Option<SyncStatus> {
    let local = local.filter(|v| !v.is_empty());
    let remote = remote.filter(|v| !v.is_empty());
    match (local, remote) {
        (Some(l), Some(r)) if l == r => Some(SyncStatus::Synced),
        (None, None) => None,
        _ => Some(SyncStatus::OutOfSync),
    }
}

/// Shared per-secret status map. Absent entries mean "no opinion yet".
#[derive(Debug, Clone, Default)]
pub struct SyncStatuses {
    inner: Arc<Mutex<BTreeMap<String, SyncStatus>>>,
}

impl SyncStatuses {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, SyncStatus>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<SyncStatus> {
        self.lock().get(name).copied()
    }

    /// Set or clear one entry, leaving every other entry untouched
    pub fn set(&self, name: &str, status: Option<SyncStatus>) {
        let mut map = self.lock();
        match status {
            Some(status) => {
                map.insert(name.to_string(), status);
            }
            None => {
                map.remove(name);
            }
        }
    }

    pub fn remove(&self, name: &str) {
        self.lock().remove(name);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn snapshot(&self) -> BTreeMap<String, SyncStatus> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Settled result for one secret in a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretOutcome {
    pub name: String,
    pub status: Option<SyncStatus>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub generation: u64,
    pub outcomes: Vec<SecretOutcome>,
    /// A newer pass started before this one finished; remaining secrets were left to it
    pub superseded: bool,
}

/// Runs reconciliation passes against a shared status map.
///
/// Each pass takes a generation number. A pass that finds a newer generation
/// stops reading and never settles another status, so a slow stale pass
/// cannot overwrite a newer result.
#[derive(Debug, Default)]
pub struct Reconciler {
    statuses: SyncStatuses,
    generation: AtomicU64,
}

impl Reconciler {
    pub fn new(statuses: SyncStatuses) -> Self {
        Self {
            statuses,
            generation: AtomicU64::new(0),
        }
    }

    pub fn statuses(&self) -> &SyncStatuses {
        &self.statuses
    }

    /// Latest generation handed out
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Run one pass. Returns `None` without touching anything when
    /// `connection` is not successful.
    pub async fn reconcile(
        &self,
        transport: &dyn VaultTransport,
        connection: &ConnectionStatus,
        descriptors: &[SecretDescriptor],
        local: &LocalValueCache,
        strategies: &[ReadStrategy],
    ) -> Option<ReconcileReport> {
        let environment = match connection.environment.as_deref() {
            Some(environment) if connection.is_connected() => environment,
            _ => {
                debug!("Not connected, skipping reconciliation");
                return None;
            }
        };

        let targets: Vec<&SecretDescriptor> = addressable(descriptors).collect();

        let generation = {
            let mut map = self.statuses.lock();
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            for descriptor in &targets {
                map.insert(descriptor.name.clone(), SyncStatus::Checking);
            }
            generation
        };
        debug!("Reconciliation #{} started for {} secret(s)", generation, targets.len());

        let mut report = ReconcileReport {
            generation,
            outcomes: Vec::with_capacity(targets.len()),
            superseded: false,
        };

        for descriptor in targets {
            if self.generation() != generation {
                report.superseded = true;
                break;
            }

            let (status, error) =
                match fetch_remote(transport, environment, descriptor, strategies).await {
                    Ok(remote) => (classify(local.get(&descriptor.name), remote.as_deref()), None),
                    Err(e) => {
                        warn!(
                            "Failed to read {} from {}: {:#}",
                            descriptor.name,
                            descriptor.location(),
                            e
                        );
                        (Some(SyncStatus::Error), Some(format!("{:#}", e)))
                    }
                };

            if !self.settle(generation, &descriptor.name, status) {
                report.superseded = true;
                break;
            }
            report.outcomes.push(SecretOutcome {
                name: descriptor.name.clone(),
                status,
                error,
            });
        }

        if report.superseded {
            debug!("Reconciliation #{} superseded", generation);
        } else {
            info!(
                "Reconciliation #{} finished: {} synced, {} out of sync, {} error(s)",
                generation,
                report.count(SyncStatus::Synced),
                report.count(SyncStatus::OutOfSync),
                report.count(SyncStatus::Error)
            );
        }
        Some(report)
    }

    /// Abandon any pass in flight. It settles nothing further, and the
    /// entries it left at `checking` are dropped.
    pub fn invalidate(&self) -> u64 {
        let mut map = self.statuses.lock();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        map.retain(|_, status| *status != SyncStatus::Checking);
        debug!("Reconciliation passes before #{} invalidated", generation);
        generation
    }

    /// Record a status if `generation` is still current
    fn settle(&self, generation: u64, name: &str, status: Option<SyncStatus>) -> bool {
        let mut map = self.statuses.lock();
        if self.generation() != generation {
            return false;
        }
        match status {
            Some(status) => {
                map.insert(name.to_string(), status);
            }
            None => {
                map.remove(name);
            }
        }
        true
    }
}

impl ReconcileReport {
    pub fn count(&self, status: SyncStatus) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == Some(status))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryTransport;
    use crate::connection::ConnectionState;
    use crate::strategy::DEFAULT_READ_ORDER;
    use std::time::Duration;

    const PATH: &str = "kv/acme/dev/0/app";

    fn connected() -> ConnectionStatus {
        ConnectionStatus {
            state: ConnectionState::Success,
            credentials_present: true,
            environment: Some("dev".to_string()),
            ..ConnectionStatus::default()
        }
    }

    fn db_pass() -> Vec<SecretDescriptor> {
        vec![SecretDescriptor::new("DB_PASS", PATH, "db_pass")]
    }

    fn local(value: &str) -> LocalValueCache {
        let mut cache = LocalValueCache::new();
        cache.insert("DB_PASS", value);
        cache
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(Some("a"), Some("a")), Some(SyncStatus::Synced));
        assert_eq!(classify(Some("a"), Some("b")), Some(SyncStatus::OutOfSync));
        assert_eq!(classify(Some("a"), None), Some(SyncStatus::OutOfSync));
        assert_eq!(classify(None, Some("b")), Some(SyncStatus::OutOfSync));
        assert_eq!(classify(Some(""), Some("")), None);
        assert_eq!(classify(None, None), None);
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(SyncStatus::OutOfSync.to_string(), "out-of-sync");
        assert_eq!(
            serde_json::to_string(&SyncStatus::OutOfSync).unwrap(),
            "\"out-of-sync\""
        );
    }

    #[tokio::test]
    async fn test_equal_values_synced() {
        let store = MemoryTransport::new();
        store.insert_legacy(PATH, "db_pass", "abc");
        let reconciler = Reconciler::default();

        reconciler
            .reconcile(&store, &connected(), &db_pass(), &local("abc"), DEFAULT_READ_ORDER)
            .await
            .unwrap();
        assert_eq!(reconciler.statuses().get("DB_PASS"), Some(SyncStatus::Synced));
    }

    #[tokio::test]
    async fn test_different_values_out_of_sync() {
        let store = MemoryTransport::new();
        store.insert_legacy(PATH, "db_pass", "xyz");
        let reconciler = Reconciler::default();

        reconciler
            .reconcile(&store, &connected(), &db_pass(), &local("abc"), DEFAULT_READ_ORDER)
            .await
            .unwrap();
        assert_eq!(reconciler.statuses().get("DB_PASS"), Some(SyncStatus::OutOfSync));
    }

    #[tokio::test]
    async fn test_both_empty_clears_status() {
        let store = MemoryTransport::new();
        let reconciler = Reconciler::default();
        reconciler.statuses().set("DB_PASS", Some(SyncStatus::OutOfSync));

        let report = reconciler
            .reconcile(&store, &connected(), &db_pass(), &LocalValueCache::new(), DEFAULT_READ_ORDER)
            .await
            .unwrap();
        assert_eq!(reconciler.statuses().get("DB_PASS"), None);
        assert_eq!(report.outcomes[0].status, None);
    }

    #[tokio::test]
    async fn test_read_error_isolated() {
        let store = MemoryTransport::new();
        store.fail_path("kv/broken");
        store.insert_legacy(PATH, "db_pass", "abc");
        let descriptors = vec![
            SecretDescriptor::new("BROKEN", "kv/broken", "k"),
            SecretDescriptor::new("DB_PASS", PATH, "db_pass"),
        ];
        let reconciler = Reconciler::default();

        let report = reconciler
            .reconcile(&store, &connected(), &descriptors, &local("abc"), DEFAULT_READ_ORDER)
            .await
            .unwrap();
        assert_eq!(reconciler.statuses().get("BROKEN"), Some(SyncStatus::Error));
        assert_eq!(reconciler.statuses().get("DB_PASS"), Some(SyncStatus::Synced));
        assert!(report.outcomes[0].error.is_some());
        assert!(!report.superseded);
    }

    #[tokio::test]
    async fn test_not_connected_is_noop() {
        let store = MemoryTransport::new();
        let reconciler = Reconciler::default();
        let status = ConnectionStatus::default();

        let report = reconciler
            .reconcile(&store, &status, &db_pass(), &local("abc"), DEFAULT_READ_ORDER)
            .await;
        assert!(report.is_none());
        assert!(reconciler.statuses().is_empty());
        assert_eq!(store.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_merges_into_existing_statuses() {
        let store = MemoryTransport::new();
        store.insert_legacy(PATH, "db_pass", "abc");
        let reconciler = Reconciler::default();
        reconciler.statuses().set("OTHER", Some(SyncStatus::Error));

        reconciler
            .reconcile(&store, &connected(), &db_pass(), &local("abc"), DEFAULT_READ_ORDER)
            .await
            .unwrap();
        assert_eq!(reconciler.statuses().get("OTHER"), Some(SyncStatus::Error));
        assert_eq!(reconciler.statuses().len(), 2);
    }

    #[tokio::test]
    async fn test_idempotent_without_remote_change() {
        let store = MemoryTransport::new();
        store.insert_legacy(PATH, "db_pass", "abc");
        store.insert_legacy(PATH, "api_key", "remote-only");
        let descriptors = vec![
            SecretDescriptor::new("DB_PASS", PATH, "db_pass"),
            SecretDescriptor::new("API_KEY", PATH, "api_key"),
            SecretDescriptor::new("EMPTY", PATH, "empty"),
        ];
        let reconciler = Reconciler::default();

        reconciler
            .reconcile(&store, &connected(), &descriptors, &local("abc"), DEFAULT_READ_ORDER)
            .await
            .unwrap();
        let first = reconciler.statuses().snapshot();
        reconciler
            .reconcile(&store, &connected(), &descriptors, &local("abc"), DEFAULT_READ_ORDER)
            .await
            .unwrap();
        assert_eq!(reconciler.statuses().snapshot(), first);
        assert_eq!(first.get("API_KEY"), Some(&SyncStatus::OutOfSync));
        assert!(!first.contains_key("EMPTY"));
    }

    #[tokio::test]
    async fn test_partial_descriptors_skipped() {
        let store = MemoryTransport::new();
        let reconciler = Reconciler::default();
        let descriptors = vec![SecretDescriptor::new("DB_PASS", "", "db_pass")];

        let report = reconciler
            .reconcile(&store, &connected(), &descriptors, &local("abc"), DEFAULT_READ_ORDER)
            .await
            .unwrap();
        assert!(report.outcomes.is_empty());
        assert!(reconciler.statuses().is_empty());
        assert_eq!(store.calls().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checking_visible_before_reads_finish() {
        let store = Arc::new(MemoryTransport::new());
        store.insert_legacy(PATH, "db_pass", "abc");
        store.set_read_delay(Some(Duration::from_millis(100)));
        let reconciler = Arc::new(Reconciler::default());

        let pass = {
            let store = store.clone();
            let reconciler = reconciler.clone();
            tokio::spawn(async move {
                reconciler
                    .reconcile(store.as_ref(), &connected(), &db_pass(), &local("abc"), DEFAULT_READ_ORDER)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(reconciler.statuses().get("DB_PASS"), Some(SyncStatus::Checking));

        pass.await.unwrap().unwrap();
        assert_eq!(reconciler.statuses().get("DB_PASS"), Some(SyncStatus::Synced));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_pass_cannot_overwrite_newer_result() {
        let store = Arc::new(MemoryTransport::new());
        store.insert_legacy(PATH, "db_pass", "abc");
        store.set_read_delay(Some(Duration::from_millis(100)));
        let reconciler = Arc::new(Reconciler::default());

        // The stale pass still believes the local value is "old".
        let stale = {
            let store = store.clone();
            let reconciler = reconciler.clone();
            tokio::spawn(async move {
                reconciler
                    .reconcile(store.as_ref(), &connected(), &db_pass(), &local("old"), DEFAULT_READ_ORDER)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.set_read_delay(None);
        let fresh = reconciler
            .reconcile(store.as_ref(), &connected(), &db_pass(), &local("abc"), DEFAULT_READ_ORDER)
            .await
            .unwrap();
        assert!(!fresh.superseded);
        assert_eq!(reconciler.statuses().get("DB_PASS"), Some(SyncStatus::Synced));

        let stale = stale.await.unwrap().unwrap();
        assert!(stale.superseded);
        assert!(stale.outcomes.is_empty());
        assert_eq!(reconciler.statuses().get("DB_PASS"), Some(SyncStatus::Synced));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_pass_settles_nothing() {
        let store = MemoryTransport::new();
        store.insert_legacy(PATH, "db_pass", "abc");
        store.set_read_delay(Some(Duration::from_millis(100)));
        let reconciler = Reconciler::default();
        reconciler.statuses().set("OTHER", Some(SyncStatus::Synced));

        let (conn, secrets, locals) = (connected(), db_pass(), local("old"));
        let (report, _) = tokio::join!(
            reconciler.reconcile(&store, &conn, &secrets, &locals, DEFAULT_READ_ORDER),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                assert_eq!(reconciler.statuses().get("DB_PASS"), Some(SyncStatus::Checking));
                reconciler.invalidate();
                assert_eq!(reconciler.statuses().get("DB_PASS"), None);
            }
        );

        let report = report.unwrap();
        assert!(report.superseded);
        assert!(report.outcomes.is_empty());
        assert_eq!(reconciler.statuses().get("DB_PASS"), None);
        assert_eq!(reconciler.statuses().get("OTHER"), Some(SyncStatus::Synced));
    }
}
