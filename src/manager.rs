//! Multi-session lifecycle management.
//!
//! The [`SessionManager`] owns the registry, creates sessions through an
//! injected [`ClientFactory`], runs one event loop per session, schedules
//! reconnects with exponential backoff and tears sessions down when their
//! credentials die.

use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::jid;
use crate::maintenance::MaintenanceHandle;
use crate::reconnect;
use crate::session::{CredentialEvent, SessionRecord, SessionRegistry};
use crate::store::MessageStore;
use crate::transport::ClientFactory;
use crate::types::events::{ConnectionState, DisconnectReason, SessionEvent};
use crate::types::message::{Chat, Cursor, MessagePage, StoredMessage};
use crate::webhook::{NoopSink, NotificationSink, WebhookSink};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::sleep;

#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    /// Block until the first credential (QR or pairing code) is issued, or
    /// until the connection opens with existing credentials.
    pub wait_for_credential: bool,
    /// Register via phone-number pairing code instead of a QR.
    pub use_pairing_code: bool,
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateSessionOutcome {
    /// The session already had a live connection; nothing was done.
    AlreadyConnected,
    /// The session is connecting (or reconnecting) in the background.
    Started,
    /// A fresh QR credential for the caller to display.
    QrCode(String),
    PairingCode(String),
}

pub struct SessionManager {
    cfg: Config,
    registry: SessionRegistry,
    factory: Arc<dyn ClientFactory>,
    sink: Arc<dyn NotificationSink>,
}

impl SessionManager {
    pub fn new(cfg: Config, factory: Arc<dyn ClientFactory>) -> Arc<Self> {
        let sink: Arc<dyn NotificationSink> = match &cfg.webhook_url {
            Some(url) => Arc::new(WebhookSink::new(
                url.clone(),
                cfg.webhook_allowed_events.clone(),
            )),
            None => Arc::new(NoopSink),
        };
        Self::with_sink(cfg, factory, sink)
    }

    pub fn with_sink(
        cfg: Config,
        factory: Arc<dyn ClientFactory>,
        sink: Arc<dyn NotificationSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            registry: SessionRegistry::new(),
            factory,
            sink,
        })
    }

    fn auth_dir(&self, id: &str) -> PathBuf {
        self.cfg.sessions_dir.join(format!("md_{id}"))
    }

    fn store_path(&self, id: &str) -> PathBuf {
        self.cfg.sessions_dir.join(format!("{id}_store.json"))
    }

    fn cleanup_path(&self, id: &str) -> PathBuf {
        self.cfg.sessions_dir.join(format!("{id}_last_cleanup.json"))
    }

    /// Creates (or revives) a session. A live connected session is a no-op;
    /// a dead record is replaced, its timers cancelled first.
    ///
    /// Boxed because the call graph is recursive: the event loop schedules
    /// reconnects that call back into `create_session`, so the future cannot
    /// be an opaque type defined in terms of itself.
    pub fn create_session<'a>(
        self: &'a Arc<Self>,
        id: &'a str,
        opts: CreateSessionOptions,
    ) -> Pin<Box<dyn Future<Output = Result<CreateSessionOutcome>> + Send + 'a>> {
        Box::pin(self.create_session_inner(id, opts))
    }

    async fn create_session_inner(
        self: &Arc<Self>,
        id: &str,
        opts: CreateSessionOptions,
    ) -> Result<CreateSessionOutcome> {
        // Failed attempts survive record replacement; the counter only
        // resets when a connection actually opens.
        let mut carried_retries = 0;
        if let Some(existing) = self.registry.get(id).await {
            if existing.is_connected() {
                debug!(target: "Manager", "[{id}] Session already connected");
                return Ok(CreateSessionOutcome::AlreadyConnected);
            }
            info!(target: "Manager", "[{id}] Replacing disconnected session");
            carried_retries = existing.retries.load(Ordering::SeqCst);
            existing.maintenance.cancel().await;
            existing.abort_tasks().await;
            self.registry.remove(id).await;
        }

        let auth_dir = self.auth_dir(id);
        fs::create_dir_all(&auth_dir).await?;

        let store = Arc::new(MessageStore::new());
        store.read_from_file(&self.store_path(id)).await;

        let (client, events) = self
            .factory
            .connect(id, &auth_dir)
            .await
            .map_err(SessionError::Connect)?;

        let maintenance = MaintenanceHandle::new(
            id,
            Arc::clone(&store),
            self.store_path(id),
            self.cleanup_path(id),
            auth_dir,
            self.cfg.clone(),
        );

        let attended = opts.wait_for_credential || opts.use_pairing_code;
        let (credential_tx, credential_rx) = if opts.wait_for_credential {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let record = Arc::new(SessionRecord {
            id: id.to_string(),
            client: Arc::clone(&client),
            store,
            maintenance: Arc::clone(&maintenance),
            retries: carried_retries.into(),
            credential_waiter: Mutex::new(credential_tx),
            attended: attended.into(),
            connected: false.into(),
            tasks: Mutex::new(Vec::new()),
        });

        self.registry.insert(Arc::clone(&record)).await;
        maintenance.setup().await;

        let loop_handle = tokio::spawn(
            Arc::clone(self).run_event_loop(Arc::clone(&record), events),
        );
        record.tasks.lock().await.push(loop_handle);

        if opts.use_pairing_code {
            let phone = opts.phone_number.as_deref().ok_or_else(|| {
                SessionError::PairingCode(anyhow::anyhow!("phone number required"))
            })?;
            let code = client
                .request_pairing_code(phone)
                .await
                .map_err(SessionError::PairingCode)?;
            return Ok(CreateSessionOutcome::PairingCode(code));
        }

        match credential_rx {
            Some(rx) => match rx.await {
                Ok(CredentialEvent::QrCode(qr)) => Ok(CreateSessionOutcome::QrCode(qr)),
                Ok(CredentialEvent::PairingCode(code)) => {
                    Ok(CreateSessionOutcome::PairingCode(code))
                }
                // The waiter is dropped either because the connection opened
                // with existing credentials or because it closed first.
                Err(_) if record.is_connected() => Ok(CreateSessionOutcome::Started),
                Err(_) => Err(SessionError::ClosedBeforeCredential),
            },
            None => Ok(CreateSessionOutcome::Started),
        }
    }

    async fn run_event_loop(
        self: Arc<Self>,
        record: Arc<SessionRecord>,
        mut events: mpsc::Receiver<SessionEvent>,
    ) {
        while let Some(event) = events.recv().await {
            // Fire-and-forget: a slow notification endpoint must never
            // stall store updates or close handling for the session.
            {
                let sink = Arc::clone(&self.sink);
                let id = record.id.clone();
                let event_type = event.event_type();
                let payload = event.payload();
                tokio::spawn(async move {
                    sink.deliver(&id, event_type, payload).await;
                });
            }
            record.store.apply_event(&event).await;

            match &event {
                SessionEvent::IdentityMappingUpdate(mappings) => {
                    let mapper = record.client.lid_mapper();
                    for mapping in mappings {
                        mapper.store_mapping(&mapping.lid, &mapping.pn).await;
                    }
                }
                SessionEvent::ConnectionUpdate { state, qr } => {
                    if let Some(qr) = qr
                        && !self.handle_credential(&record, qr).await
                    {
                        break;
                    }
                    match state {
                        ConnectionState::Connecting => {}
                        ConnectionState::Open => {
                            info!(target: "Manager", "[{}] Connection open", record.id);
                            record.connected.store(true, Ordering::SeqCst);
                            record.retries.store(0, Ordering::SeqCst);
                            // Drop a pending waiter so an attended creation
                            // with existing credentials resolves as Started.
                            drop(record.take_credential_waiter().await);
                            record.maintenance.arm().await;
                        }
                        ConnectionState::Close { reason } => {
                            record.connected.store(false, Ordering::SeqCst);
                            drop(record.take_credential_waiter().await);
                            self.handle_close(&record, *reason).await;
                            break;
                        }
                    }
                }
                _ => {}
            }
        }
        // A client that closes its event channel without ever reporting a
        // connection state would otherwise leave an attended caller parked
        // on the credential waiter forever.
        drop(record.take_credential_waiter().await);
        debug!(target: "Manager", "[{}] Event loop finished", record.id);
    }

    /// Routes a freshly issued QR credential. Returns false when the
    /// session is being torn down and the event loop should stop.
    async fn handle_credential(self: &Arc<Self>, record: &Arc<SessionRecord>, qr: &str) -> bool {
        if let Some(waiter) = record.take_credential_waiter().await {
            let _ = waiter.send(CredentialEvent::QrCode(qr.to_string()));
            return true;
        }
        if record.attended.load(Ordering::SeqCst) {
            // QR regeneration after the first one was already delivered.
            return true;
        }
        // A QR during unattended recovery means the stored credentials are
        // stale; nobody can scan it, so the session is torn down.
        warn!(
            target: "Manager",
            "[{}] QR issued during unattended recovery, deleting stale session", record.id
        );
        let client = Arc::clone(&record.client);
        let mgr = Arc::clone(self);
        let id = record.id.clone();
        tokio::spawn(async move {
            if let Err(e) = client.logout().await {
                debug!(target: "Manager", "[{id}] Best-effort logout failed: {e}");
            }
            if let Err(e) = mgr.delete_session(&id).await {
                error!(target: "Manager", "[{id}] Failed to delete stale session: {e}");
            }
        });
        false
    }

    async fn handle_close(self: &Arc<Self>, record: &Arc<SessionRecord>, reason: DisconnectReason) {
        if reason.is_logged_out() {
            info!(
                target: "Manager",
                "[{}] Logged out, deleting session permanently", record.id
            );
            let mgr = Arc::clone(self);
            let id = record.id.clone();
            tokio::spawn(async move {
                if let Err(e) = mgr.delete_session(&id).await {
                    error!(target: "Manager", "[{id}] Failed to delete session: {e}");
                }
            });
            return;
        }

        if !self.should_retry(record).await {
            return;
        }

        let attempts = record.retries.load(Ordering::SeqCst);
        let delay = if reason.bypasses_backoff() {
            Duration::ZERO
        } else {
            reconnect::next_delay(attempts, self.cfg.reconnect_base, self.cfg.reconnect_cap)
        };
        info!(
            target: "Manager",
            "[{}] Connection closed ({reason:?}), reconnecting in {}ms (attempt {attempts})",
            record.id,
            delay.as_millis()
        );

        let mgr = Arc::clone(self);
        let id = record.id.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            // The session may have been deleted while the backoff ran.
            if !mgr.registry.contains(&id).await {
                return;
            }
            // Reconnect on a detached task: create_session aborts the old
            // record's tasks, and this sleeper is one of them.
            tokio::spawn(async move {
                if let Err(e) = mgr.create_session(&id, CreateSessionOptions::default()).await {
                    error!(target: "Manager", "[{id}] Reconnect failed: {e}");
                }
            });
        });
        record.tasks.lock().await.push(handle);
    }

    /// Bumps the retry counter and decides whether another reconnect is
    /// allowed. The first attempt past the ceiling deletes the session;
    /// later calls just decline.
    async fn should_retry(self: &Arc<Self>, record: &Arc<SessionRecord>) -> bool {
        let attempts = record.retries.fetch_add(1, Ordering::SeqCst) + 1;
        match self.cfg.max_reconnect_retries {
            None => true,
            Some(max) if attempts <= max => {
                debug!(
                    target: "Manager",
                    "[{}] Reconnect attempt {attempts}/{max}", record.id
                );
                true
            }
            Some(max) => {
                if attempts == max + 1 {
                    warn!(
                        target: "Manager",
                        "[{}] Exceeded {max} reconnect attempts, deleting session", record.id
                    );
                    let mgr = Arc::clone(self);
                    let id = record.id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = mgr.delete_session(&id).await {
                            error!(target: "Manager", "[{id}] Failed to delete session: {e}");
                        }
                    });
                }
                false
            }
        }
    }

    /// Removes a session and every on-disk artifact belonging to it.
    /// Idempotent: deleting an unknown session only sweeps leftover files.
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        if let Some(record) = self.registry.remove(id).await {
            record.connected.store(false, Ordering::SeqCst);
            // Best-effort server-side logout, never awaited on this path.
            let client = Arc::clone(&record.client);
            let log_id = id.to_string();
            tokio::spawn(async move {
                if let Err(e) = client.logout().await {
                    debug!(target: "Manager", "[{log_id}] Best-effort logout failed: {e}");
                }
            });
            record.maintenance.cancel().await;
            record.abort_tasks().await;
        }

        remove_path(&self.auth_dir(id)).await;
        remove_path(&self.store_path(id)).await;
        remove_path(&self.cleanup_path(id)).await;

        // Sweep anything else in the sessions dir that carries this id,
        // matching the cleanup behavior of earlier layouts.
        if let Ok(mut entries) = fs::read_dir(&self.cfg.sessions_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_name().to_string_lossy().contains(id) {
                    remove_path(&entry.path()).await;
                }
            }
        }

        info!(target: "Manager", "[{id}] Session deleted");
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Option<Arc<SessionRecord>> {
        self.registry.get(id).await
    }

    pub async fn list_session_ids(&self) -> Vec<String> {
        self.registry.ids().await
    }

    pub async fn is_session_connected(&self, id: &str) -> bool {
        match self.registry.get(id).await {
            Some(record) => record.is_connected(),
            None => false,
        }
    }

    /// Sends a message to a raw recipient (phone number, group id or full
    /// JID), optionally after a delay, and returns the message id.
    pub async fn send_message(
        &self,
        id: &str,
        recipient: &str,
        content: Value,
        delay: Option<Duration>,
    ) -> Result<String> {
        let record = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        let jid = jid::normalize_recipient(recipient);
        record
            .client
            .send_message(&jid, content)
            .await
            .map_err(SessionError::Send)
    }

    /// Loads one page of a conversation, trying every candidate JID format
    /// until one yields messages. A chat first observed under `@lid` is
    /// still found when queried by phone number, and vice versa.
    pub async fn load_messages(
        &self,
        id: &str,
        jid: &str,
        limit: usize,
        cursor: Option<&Cursor>,
        is_group: bool,
    ) -> Result<MessagePage> {
        let record = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        let base = if is_group {
            jid::to_group_form(jid)
        } else {
            jid::to_direct_form(jid)
        };
        let mapper = record.client.lid_mapper();
        let candidates = jid::candidate_formats(&base, Some(mapper.as_ref())).await;

        let mut last = MessagePage {
            messages: Vec::new(),
            cursor_found: cursor.is_none(),
        };
        for candidate in candidates {
            let page = record.store.load_messages(&candidate, limit, cursor).await;
            if !page.messages.is_empty() {
                return Ok(page);
            }
            last = page;
        }
        Ok(last)
    }

    /// Pulls a page of older history from the protocol client and folds it
    /// into the store, so later `load_messages` calls can page over it.
    pub async fn fetch_history(
        &self,
        id: &str,
        jid: &str,
        count: usize,
    ) -> Result<Vec<StoredMessage>> {
        let record = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let target = jid::normalize_recipient(jid);
        let messages = record
            .client
            .fetch_history_page(&target, count)
            .await
            .map_err(SessionError::History)?;
        record.store.upsert_messages(messages.clone()).await;
        Ok(messages)
    }

    pub async fn get_chat_list(&self, id: &str, is_group: bool) -> Result<Vec<Chat>> {
        let record = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        Ok(record.store.chat_list(is_group).await)
    }

    /// Recovers every session with a `md_<id>` auth directory on disk,
    /// staggered so a large fleet does not reconnect all at once.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        let mut entries = match fs::read_dir(&self.cfg.sessions_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(target: "Manager", "No sessions directory, nothing to recover");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_prefix("md_")
                && entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false)
            {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        info!(target: "Manager", "Recovering {} stored sessions", ids.len());

        for (i, id) in ids.iter().enumerate() {
            if i > 0 {
                sleep(self.cfg.session_init_delay).await;
            }
            info!(target: "Manager", "[{id}] Recovering session");
            if let Err(e) = self
                .create_session(id, CreateSessionOptions::default())
                .await
            {
                error!(target: "Manager", "[{id}] Recovery failed: {e}");
            }
        }
        Ok(())
    }

    /// Final prune and snapshot save for every live session, then stops all
    /// timers. Called on process shutdown.
    pub async fn shutdown(&self) {
        for id in self.registry.ids().await {
            let Some(record) = self.registry.get(&id).await else {
                continue;
            };
            info!(target: "Manager", "[{id}] Shutting down");
            record.maintenance.perform_cleanup(true).await;
            if let Err(e) = record.store.write_to_file(&self.store_path(&id)).await {
                warn!(target: "Manager", "[{id}] Final snapshot save failed: {e}");
            }
            record.maintenance.cancel().await;
            record.abort_tasks().await;
        }
    }
}

async fn remove_path(path: &std::path::Path) {
    let result = match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(_) => return,
    };
    if let Err(e) = result {
        warn!(target: "Manager", "Failed to remove {}: {e}", path.display());
    }
}
