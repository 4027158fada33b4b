use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backends::{CredentialProvider, Transport};
use crate::error::{describe, SyncError};

/// Message shown when an environment has no stored credentials
pub const NO_CREDENTIALS_MESSAGE: &str = "no credentials configured";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Unknown,
    Checking,
    Success,
    Error,
}

/// Reachability and authentication state of the remote store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub message: Option<String>,
    pub credentials_present: bool,
    pub environment: Option<String>,
    pub checked_at: Option<DateTime<Utc>>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Unknown,
            message: None,
            credentials_present: false,
            environment: None,
            checked_at: None,
        }
    }
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Success
    }
}

/// Establishes and reports connection state.
///
/// Concurrent checks are coalesced: every call takes a new generation and
/// only the newest generation may publish its outcome.
pub struct ConnectionManager {
    transport: Transport,
    credentials: Arc<dyn CredentialProvider>,
    status: watch::Sender<ConnectionStatus>,
    generation: AtomicU64,
}

impl ConnectionManager {
    pub fn new(transport: Transport, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            transport,
            credentials,
            status: watch::Sender::new(ConnectionStatus::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Check connectivity for `environment`.
    ///
    /// Without credentials this fails with [`SyncError::NoCredentials`] and
    /// makes no network call. The outcome is returned to the caller even when
    /// a newer check has superseded this one; only the status is withheld.
    pub async fn check_connection(&self, environment: &str) -> Result<(), SyncError> {
        let credentials = self.credentials.get_credentials(environment);
        let generation = self.begin(environment, credentials.is_some());

        let Some(credentials) = credentials else {
            warn!("No credentials configured for environment {}", environment);
            self.publish(
                generation,
                ConnectionStatus {
                    state: ConnectionState::Error,
                    message: Some(NO_CREDENTIALS_MESSAGE.to_string()),
                    credentials_present: false,
                    environment: Some(environment.to_string()),
                    checked_at: Some(Utc::now()),
                },
            );
            return Err(SyncError::NoCredentials {
                environment: environment.to_string(),
            });
        };

        debug!(
            "Testing {} connection for {} at {}",
            self.transport.transport_type(),
            environment,
            credentials.url
        );
        let outcome = self
            .transport
            .test_connection(environment, &credentials)
            .await;

        let (state, message) = match &outcome {
            Ok(()) => {
                info!("Connected to {} ({})", credentials.url, environment);
                (ConnectionState::Success, None)
            }
            Err(e) => {
                warn!("Connection check for {} failed: {:#}", environment, e);
                (ConnectionState::Error, Some(describe(e)))
            }
        };
        self.publish(
            generation,
            ConnectionStatus {
                state,
                message: message.clone(),
                credentials_present: true,
                environment: Some(environment.to_string()),
                checked_at: Some(Utc::now()),
            },
        );

        match message {
            None => Ok(()),
            Some(message) => Err(SyncError::ConnectionFailure(message)),
        }
    }

    /// Enter `checking` and claim a new generation. Nothing from the previous
    /// check is carried over.
    fn begin(&self, environment: &str, credentials_present: bool) -> u64 {
        let mut generation = 0;
        self.status.send_modify(|status| {
            generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *status = ConnectionStatus {
                state: ConnectionState::Checking,
                message: None,
                credentials_present,
                environment: Some(environment.to_string()),
                checked_at: None,
            };
        });
        generation
    }

    /// Publish `next` unless a newer check has started. Returns true if published.
    fn publish(&self, generation: u64, next: ConnectionStatus) -> bool {
        let published = self.status.send_if_modified(|status| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            *status = next;
            true
        });
        if !published {
            debug!("Discarding superseded connection check #{}", generation);
        }
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{Credentials, MemoryTransport};
    use std::collections::HashMap;
    use std::time::Duration;

    struct Creds(HashMap<String, Credentials>);

    impl CredentialProvider for Creds {
        fn get_credentials(&self, environment: &str) -> Option<Credentials> {
            self.0.get(environment).cloned()
        }
    }

    fn manager(store: Arc<MemoryTransport>) -> ConnectionManager {
        let mut creds = HashMap::new();
        creds.insert(
            "dev".to_string(),
            Credentials {
                url: "http://127.0.0.1:8200".to_string(),
                token: "t".to_string(),
                namespace: None,
            },
        );
        ConnectionManager::new(store, Arc::new(Creds(creds)))
    }

    #[tokio::test]
    async fn test_initial_state_unknown() {
        let manager = manager(Arc::new(MemoryTransport::new()));
        assert_eq!(manager.status().state, ConnectionState::Unknown);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_no_credentials_makes_no_network_call() {
        let store = Arc::new(MemoryTransport::new());
        let manager = manager(store.clone());

        let err = manager.check_connection("prod").await.unwrap_err();
        assert!(matches!(err, SyncError::NoCredentials { .. }));

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.message.unwrap().contains("credentials"));
        assert!(!status.credentials_present);
        assert_eq!(store.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_success() {
        let store = Arc::new(MemoryTransport::new());
        let manager = manager(store.clone());

        manager.check_connection("dev").await.unwrap();
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Success);
        assert!(status.credentials_present);
        assert!(status.checked_at.is_some());
        assert_eq!(store.calls().test_connection, 1);
    }

    #[tokio::test]
    async fn test_failure_then_retry() {
        let store = Arc::new(MemoryTransport::new());
        store.set_connection_error(Some("permission denied"));
        let manager = manager(store.clone());

        let err = manager.check_connection("dev").await.unwrap_err();
        assert_eq!(err, SyncError::ConnectionFailure("permission denied".to_string()));
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert_eq!(status.message.as_deref(), Some("permission denied"));
        assert!(status.credentials_present);

        store.set_connection_error(None);
        manager.check_connection("dev").await.unwrap();
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn test_subscribers_see_checking() {
        let manager = manager(Arc::new(MemoryTransport::new()));
        let mut rx = manager.subscribe();
        let generation = manager.begin("dev", true);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().state, ConnectionState::Checking);
        assert_eq!(generation, 1);
    }

    #[tokio::test]
    async fn test_superseded_check_does_not_publish() {
        let manager = manager(Arc::new(MemoryTransport::new()));
        let first = manager.begin("dev", true);
        let _second = manager.begin("dev", true);

        let stale = ConnectionStatus {
            state: ConnectionState::Success,
            ..ConnectionStatus::default()
        };
        assert!(!manager.publish(first, stale));
        assert_eq!(manager.status().state, ConnectionState::Checking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_older_check_does_not_overwrite_newer() {
        let store = Arc::new(MemoryTransport::new());
        store.set_connection_error(Some("timed out"));
        store.set_connection_delay(Some(Duration::from_millis(100)));
        let manager = manager(store.clone());

        let (first, second) = tokio::join!(manager.check_connection("dev"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            store.set_connection_error(None);
            store.set_connection_delay(None);
            manager.check_connection("dev").await
        });

        assert_eq!(first, Err(SyncError::ConnectionFailure("timed out".to_string())));
        assert_eq!(second, Ok(()));
        assert_eq!(store.calls().test_connection, 2);

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Success);
        assert_eq!(status.message, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checking_status_starts_fresh() {
        let store = Arc::new(MemoryTransport::new());
        let manager = manager(store.clone());
        assert!(manager.check_connection("prod").await.is_err());
        assert!(manager.status().checked_at.is_some());

        store.set_connection_delay(Some(Duration::from_millis(100)));
        let (_, during) = tokio::join!(manager.check_connection("dev"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            manager.status()
        });

        assert_eq!(during.state, ConnectionState::Checking);
        assert_eq!(during.environment.as_deref(), Some("dev"));
        assert!(during.credentials_present);
        assert_eq!(during.message, None);
        assert_eq!(during.checked_at, None);
        assert!(manager.status().checked_at.is_some());
    }
}
