//! Secret/Vault reconciliation engine
//!
//! [`SyncEngine`] owns the descriptor list, the local value cache and the
//! status map, and wires the connection manager, loader, reconciler and
//! writer together. Edits are debounced: reconciliation (and the bulk load
//! after descriptor changes) waits for `reconcile_debounce`, descriptor
//! persistence waits for `persist_debounce`.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backends::{CredentialProvider, Transport};
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::descriptor::{LocalValueCache, SecretDescriptor};
use crate::error::SyncError;
use crate::loader;
use crate::metadata::SecretMetadata;
use crate::reconcile::{ReconcileReport, Reconciler, SyncStatus, SyncStatuses};
use crate::scheduler::{Debouncer, PERSIST_DEBOUNCE, RECONCILE_DEBOUNCE};
use crate::store::DescriptorStore;
use crate::strategy::{ReadStrategy, DEFAULT_READ_ORDER};
use crate::writer;

const RECONCILE_TASK: &str = "reconcile";
const PERSIST_TASK: &str = "persist";

/// Engine tuning and collaborators
#[derive(Clone)]
pub struct EngineOptions {
    pub reconcile_debounce: Duration,
    pub persist_debounce: Duration,
    pub read_order: Vec<ReadStrategy>,
    /// Where descriptor edits are saved; edits stay in memory when `None`
    pub store: Option<Arc<dyn DescriptorStore>>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            reconcile_debounce: RECONCILE_DEBOUNCE,
            persist_debounce: PERSIST_DEBOUNCE,
            read_order: DEFAULT_READ_ORDER.to_vec(),
            store: None,
        }
    }
}

struct EngineInner {
    transport: Transport,
    connection: ConnectionManager,
    reconciler: Reconciler,
    environment: Mutex<String>,
    descriptors: Mutex<Vec<SecretDescriptor>>,
    values: Mutex<LocalValueCache>,
    load_pending: AtomicBool,
    options: EngineOptions,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl EngineInner {
    fn environment(&self) -> String {
        lock(&self.environment).clone()
    }

    fn descriptors(&self) -> Vec<SecretDescriptor> {
        lock(&self.descriptors).clone()
    }

    async fn load_values(&self) -> BTreeMap<String, String> {
        let connection = self.connection.status();
        let descriptors = self.descriptors();
        loader::load_values(
            self.transport.as_ref(),
            &connection,
            &descriptors,
            &self.options.read_order,
        )
        .await
    }

    /// Bulk-load and fill names that have no local value yet
    async fn load_into_cache(&self) -> usize {
        let remote = self.load_values().await;
        let filled = lock(&self.values).fill_missing(remote);
        debug!("Filled {} local value(s) from remote", filled);
        filled
    }

    async fn reconcile(&self) -> Option<ReconcileReport> {
        let connection = self.connection.status();
        let descriptors = self.descriptors();
        let values = lock(&self.values).clone();
        self.reconciler
            .reconcile(
                self.transport.as_ref(),
                &connection,
                &descriptors,
                &values,
                &self.options.read_order,
            )
            .await
    }

    async fn persist(&self) {
        let Some(store) = self.options.store.as_ref() else {
            return;
        };
        let descriptors = self.descriptors();
        if let Err(e) = store.save_descriptors(&descriptors).await {
            warn!("Failed to save descriptors: {:#}", e);
        }
    }

    /// Drop cache and status entries for names no longer described. A pass
    /// still running against the old list is invalidated first.
    fn prune(&self, keep: &HashSet<String>) {
        self.reconciler.invalidate();
        let statuses = self.reconciler.statuses();
        for name in statuses.snapshot().keys() {
            if !keep.contains(name) {
                statuses.remove(name);
            }
        }
        let mut values = lock(&self.values);
        let stale: Vec<String> = values
            .iter()
            .map(|(name, _)| name.clone())
            .filter(|name| !keep.contains(name))
            .collect();
        for name in stale {
            values.remove(&name);
        }
    }
}

/// Reconciliation engine for one editing session.
///
/// Pending debounce timers are cancelled on [`SyncEngine::shutdown`] and on drop.
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    scheduler: Debouncer,
}

impl SyncEngine {
    pub fn new(
        transport: Transport,
        credentials: Arc<dyn CredentialProvider>,
        environment: &str,
        descriptors: Vec<SecretDescriptor>,
    ) -> Self {
        Self::with_options(
            transport,
            credentials,
            environment,
            descriptors,
            EngineOptions::default(),
        )
    }

    pub fn with_options(
        transport: Transport,
        credentials: Arc<dyn CredentialProvider>,
        environment: &str,
        descriptors: Vec<SecretDescriptor>,
        options: EngineOptions,
    ) -> Self {
        let inner = EngineInner {
            connection: ConnectionManager::new(Arc::clone(&transport), credentials),
            transport,
            reconciler: Reconciler::new(SyncStatuses::new()),
            environment: Mutex::new(environment.to_string()),
            descriptors: Mutex::new(
                descriptors
                    .into_iter()
                    .map(SecretDescriptor::normalized)
                    .collect(),
            ),
            values: Mutex::new(LocalValueCache::new()),
            load_pending: AtomicBool::new(false),
            options,
        };
        Self {
            inner: Arc::new(inner),
            scheduler: Debouncer::new(),
        }
    }

    pub fn environment(&self) -> String {
        self.inner.environment()
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.inner.connection.status()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.connection.subscribe()
    }

    pub fn descriptors(&self) -> Vec<SecretDescriptor> {
        self.inner.descriptors()
    }

    pub fn local_values(&self) -> LocalValueCache {
        lock(&self.inner.values).clone()
    }

    pub fn local_value(&self, name: &str) -> Option<String> {
        lock(&self.inner.values).get(name).map(str::to_string)
    }

    pub fn status(&self, name: &str) -> Option<SyncStatus> {
        self.inner.reconciler.statuses().get(name)
    }

    pub fn statuses(&self) -> BTreeMap<String, SyncStatus> {
        self.inner.reconciler.statuses().snapshot()
    }

    /// Check the connection for the current environment
    pub async fn check_connection(&self) -> Result<(), SyncError> {
        let environment = self.environment();
        self.inner.connection.check_connection(&environment).await
    }

    /// Switch environment and re-check. Statuses from the old environment are dropped.
    pub async fn set_environment(&self, environment: &str) -> Result<(), SyncError> {
        *lock(&self.inner.environment) = environment.to_string();
        self.scheduler.cancel(RECONCILE_TASK);
        self.inner.load_pending.store(false, Ordering::SeqCst);
        self.inner.reconciler.invalidate();
        self.inner.reconciler.statuses().clear();
        self.check_connection().await
    }

    /// Check the connection and, once connected, bulk-load remote values and
    /// run one reconciliation pass
    pub async fn connect(&self) -> Result<Option<ReconcileReport>, SyncError> {
        self.check_connection().await?;
        self.inner.load_into_cache().await;
        Ok(self.inner.reconcile().await)
    }

    /// Bulk-read remote values for the current descriptors without touching the cache
    pub async fn load_values(&self) -> BTreeMap<String, String> {
        self.inner.load_values().await
    }

    /// Bulk-read remote values into the cache; local values are kept
    pub async fn load_remote_values(&self) -> usize {
        self.inner.load_into_cache().await
    }

    /// Run a reconciliation pass immediately
    pub async fn reconcile_now(&self) -> Option<ReconcileReport> {
        self.scheduler.cancel(RECONCILE_TASK);
        self.inner.reconcile().await
    }

    /// Schedule a debounced reconciliation pass
    pub fn request_reconcile(&self) {
        let inner = Arc::clone(&self.inner);
        self.scheduler.schedule(
            RECONCILE_TASK,
            self.inner.options.reconcile_debounce,
            move || async move {
                if inner.load_pending.swap(false, Ordering::SeqCst) {
                    inner.load_into_cache().await;
                }
                inner.reconcile().await;
            },
        );
    }

    fn request_persist(&self) {
        let inner = Arc::clone(&self.inner);
        self.scheduler.schedule(
            PERSIST_TASK,
            self.inner.options.persist_debounce,
            move || async move { inner.persist().await },
        );
    }

    fn descriptors_changed(&self) {
        self.inner.load_pending.store(true, Ordering::SeqCst);
        self.request_persist();
        self.request_reconcile();
    }

    /// Write a secret to the remote store. On success the value is recorded
    /// locally and a reconciliation is scheduled; on failure nothing changes.
    pub async fn save_secret(
        &self,
        name: &str,
        value: &str,
        metadata: Option<&SecretMetadata>,
    ) -> Result<(), SyncError> {
        let name = name.trim().to_uppercase();
        let descriptor = self
            .descriptors()
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| SyncError::Validation(format!("unknown secret '{}'", name)))?;

        let connection = self.connection();
        writer::write_secret(
            self.inner.transport.as_ref(),
            &connection,
            &descriptor,
            value,
            metadata,
        )
        .await?;

        lock(&self.inner.values).insert(name, value);
        self.request_reconcile();
        Ok(())
    }

    /// Restore previously saved local values without scheduling any work
    pub fn restore_local_values(&self, values: LocalValueCache) {
        let values = values
            .iter()
            .map(|(name, value)| (name.trim().to_uppercase(), value.clone()));
        lock(&self.inner.values).merge(values);
    }

    /// Record a locally edited value
    pub fn set_local_value(&self, name: &str, value: &str) {
        lock(&self.inner.values).insert(name.trim().to_uppercase(), value);
        self.request_reconcile();
    }

    /// Replace the descriptor list after a user edit
    pub fn update_descriptors(&self, descriptors: Vec<SecretDescriptor>) {
        let descriptors: Vec<SecretDescriptor> = descriptors
            .into_iter()
            .map(SecretDescriptor::normalized)
            .collect();
        let keep: HashSet<String> = descriptors.iter().map(|d| d.name.clone()).collect();
        *lock(&self.inner.descriptors) = descriptors;
        self.inner.prune(&keep);
        self.descriptors_changed();
    }

    /// Rename a secret, carrying its local value over. Returns false if
    /// `from` is unknown or `to` is already taken.
    pub fn rename_secret(&self, from: &str, to: &str) -> bool {
        let from = from.trim().to_uppercase();
        let to = to.trim().to_uppercase();
        {
            let mut descriptors = lock(&self.inner.descriptors);
            if from != to && descriptors.iter().any(|d| d.name == to) {
                return false;
            }
            let Some(descriptor) = descriptors.iter_mut().find(|d| d.name == from) else {
                return false;
            };
            descriptor.name = to.clone();
        }
        lock(&self.inner.values).rename(&from, &to);
        self.inner.reconciler.invalidate();
        self.inner.reconciler.statuses().remove(&from);
        info!("Renamed secret {} to {}", from, to);
        self.descriptors_changed();
        true
    }

    /// Delete a secret descriptor with its local value and status
    pub fn remove_secret(&self, name: &str) -> bool {
        let name = name.trim().to_uppercase();
        let removed = {
            let mut descriptors = lock(&self.inner.descriptors);
            let before = descriptors.len();
            descriptors.retain(|d| d.name != name);
            descriptors.len() != before
        };
        if removed {
            lock(&self.inner.values).remove(&name);
            self.inner.reconciler.invalidate();
            self.inner.reconciler.statuses().remove(&name);
            self.descriptors_changed();
        }
        removed
    }

    /// Replace the descriptor list without saving it, dropping pending work
    pub fn reset_descriptors(&self, descriptors: Vec<SecretDescriptor>) {
        self.scheduler.cancel(PERSIST_TASK);
        self.scheduler.cancel(RECONCILE_TASK);
        self.inner.load_pending.store(false, Ordering::SeqCst);
        let descriptors: Vec<SecretDescriptor> = descriptors
            .into_iter()
            .map(SecretDescriptor::normalized)
            .collect();
        let keep: HashSet<String> = descriptors.iter().map(|d| d.name.clone()).collect();
        *lock(&self.inner.descriptors) = descriptors;
        self.inner.prune(&keep);
    }

    /// Cancel every pending debounced task
    pub fn shutdown(&self) {
        self.scheduler.cancel_all();
    }
}
