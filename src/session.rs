//! Session records and the registry they live in.

use crate::maintenance::MaintenanceHandle;
use crate::store::MessageStore;
use crate::transport::ProtocolClient;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio::task::JoinHandle;

/// First credential the protocol client issues during registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialEvent {
    QrCode(String),
    PairingCode(String),
}

/// Everything the manager holds for one live (or reconnecting) session.
///
/// The retry counter folds reconnect state into the record itself; there is
/// no side table to fall out of sync with the registry.
pub struct SessionRecord {
    pub id: String,
    pub client: Arc<dyn ProtocolClient>,
    pub store: Arc<MessageStore>,
    pub maintenance: Arc<MaintenanceHandle>,
    /// Consecutive failed reconnect attempts since the last open connection.
    pub retries: AtomicU32,
    /// Resolved with the first QR or pairing code; dropped on close so the
    /// waiter observes the failure. Present only for attended creations.
    pub credential_waiter: Mutex<Option<oneshot::Sender<CredentialEvent>>>,
    /// Whether a caller is (or was) waiting on the credential. Unattended
    /// sessions that receive a QR are deleted instead of left dangling.
    pub attended: AtomicBool,
    pub connected: AtomicBool,
    /// Event loop and scheduled reconnects, aborted on deletion.
    pub tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionRecord {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_connected()
    }

    /// Hands out the credential waiter, if one is still pending.
    pub async fn take_credential_waiter(&self) -> Option<oneshot::Sender<CredentialEvent>> {
        self.credential_waiter.lock().await.take()
    }

    pub async fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// All known sessions behind a single lock, so membership checks and
/// mutations always agree.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionRecord>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<SessionRecord>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn insert(&self, record: Arc<SessionRecord>) {
        self.sessions
            .write()
            .await
            .insert(record.id.clone(), record);
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<SessionRecord>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
