//! Seam to the underlying protocol client.
//!
//! The wire protocol, handshake and message encoding all live behind these
//! traits; the lifecycle manager only sees already-parsed [`SessionEvent`]s
//! and a handful of operations on an opaque connection handle.

use crate::types::events::SessionEvent;
use crate::types::message::StoredMessage;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Bidirectional LID <-> phone-number identity mapping maintained by the
/// protocol client. Lookups return the bare user part without a suffix.
#[async_trait]
pub trait LidMapper: Send + Sync {
    async fn lid_for_pn(&self, pn: &str) -> Option<String>;
    async fn pn_for_lid(&self, lid: &str) -> Option<String>;
    async fn store_mapping(&self, lid: &str, pn: &str);
}

/// One live protocol connection. All operations are subject to the client's
/// own timeouts; nothing here blocks indefinitely.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Sends a message and returns its id.
    async fn send_message(&self, jid: &str, content: Value) -> Result<String>;

    async fn fetch_history_page(&self, jid: &str, count: usize) -> Result<Vec<StoredMessage>>;

    /// Requests a phone-number pairing code during registration.
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String>;

    /// Invalidates the credentials server-side. Used best-effort during
    /// deletion; callers must not depend on it succeeding.
    async fn logout(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn lid_mapper(&self) -> Arc<dyn LidMapper>;
}

/// Creates protocol connections, one per session. Mirrors the
/// transport-factory pattern: the manager never constructs a concrete
/// client itself, so tests can script one.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Opens a connection using (or creating) the credentials stored under
    /// `auth_dir`, returning the handle and its event stream.
    async fn connect(
        &self,
        session_id: &str,
        auth_dir: &Path,
    ) -> Result<(Arc<dyn ProtocolClient>, mpsc::Receiver<SessionEvent>)>;
}
