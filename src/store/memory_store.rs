//! Per-session in-memory store for chats, messages, contacts and group
//! metadata, with cursor pagination and JSON snapshot persistence.
//!
//! All four maps live behind a single `RwLock` so every mutation and every
//! pagination read observes one consistent ordering. Messages carry an
//! insertion sequence number used as the sort tiebreaker, since protocol
//! timestamps may collide or be absent entirely.

use crate::store::error::{Result, StoreError};
use crate::types::events::SessionEvent;
use crate::types::message::{Chat, Contact, Cursor, GroupMetadata, MessagePage, StoredMessage};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct MessageEntry {
    seq: u64,
    msg: StoredMessage,
}

#[derive(Debug, Default)]
struct StoreInner {
    chats: HashMap<String, Chat>,
    /// Message buckets keyed by chat JID, then by message id.
    messages: HashMap<String, HashMap<String, MessageEntry>>,
    contacts: HashMap<String, Contact>,
    group_metadata: HashMap<String, GroupMetadata>,
    next_seq: u64,
}

impl StoreInner {
    fn stamp(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Sizes reported for maintenance logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCounts {
    pub chats: usize,
    pub message_buckets: usize,
    pub messages: usize,
    pub contacts: usize,
    pub groups: usize,
}

/// On-disk snapshot layout. Message buckets are serialized in insertion
/// order so the sequence numbers can be re-derived on restore.
#[derive(Serialize, Deserialize)]
struct StoreSnapshot {
    chats: Vec<Chat>,
    messages: HashMap<String, Vec<StoredMessage>>,
    contacts: Vec<Contact>,
    group_metadata: Vec<GroupMetadata>,
}

#[derive(Debug, Default)]
pub struct MessageStore {
    inner: RwLock<StoreInner>,
}

fn merge_fields(target: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (k, v) in incoming {
        target.insert(k.clone(), v.clone());
    }
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces chat entries wholesale (initial history set).
    pub async fn set_chats(&self, chats: Vec<Chat>) {
        let mut inner = self.inner.write().await;
        for chat in chats {
            inner.chats.insert(chat.jid.clone(), chat);
        }
    }

    /// Inserts or shallow-merges chats, last write wins per field.
    pub async fn upsert_chats(&self, chats: Vec<Chat>) {
        let mut inner = self.inner.write().await;
        for chat in chats {
            match inner.chats.get_mut(&chat.jid) {
                Some(existing) => merge_fields(&mut existing.fields, &chat.fields),
                None => {
                    inner.chats.insert(chat.jid.clone(), chat);
                }
            }
        }
    }

    /// Partial chat updates have the same merge semantics as upserts.
    pub async fn update_chats(&self, updates: Vec<Chat>) {
        self.upsert_chats(updates).await;
    }

    pub async fn delete_chats(&self, jids: &[String]) {
        let mut inner = self.inner.write().await;
        for jid in jids {
            inner.chats.remove(jid);
        }
    }

    pub async fn set_contacts(&self, contacts: Vec<Contact>) {
        let mut inner = self.inner.write().await;
        for contact in contacts {
            inner.contacts.insert(contact.jid.clone(), contact);
        }
    }

    pub async fn upsert_contacts(&self, contacts: Vec<Contact>) {
        let mut inner = self.inner.write().await;
        for contact in contacts {
            match inner.contacts.get_mut(&contact.jid) {
                Some(existing) => merge_fields(&mut existing.fields, &contact.fields),
                None => {
                    inner.contacts.insert(contact.jid.clone(), contact);
                }
            }
        }
    }

    pub async fn update_group_metadata(&self, updates: Vec<GroupMetadata>) {
        let mut inner = self.inner.write().await;
        for update in updates {
            match inner.group_metadata.get_mut(&update.jid) {
                Some(existing) => merge_fields(&mut existing.fields, &update.fields),
                None => {
                    inner.group_metadata.insert(update.jid.clone(), update);
                }
            }
        }
    }

    /// Inserts messages into their chat buckets (created on demand).
    /// Idempotent on `(chat_jid, id)`: a repeated key shallow-merges payload
    /// fields into the existing message instead of duplicating it, and the
    /// original insertion order is retained for sort-tie purposes.
    pub async fn upsert_messages(&self, messages: Vec<StoredMessage>) {
        let mut inner = self.inner.write().await;
        for msg in messages {
            let seq = inner.stamp();
            let bucket = inner.messages.entry(msg.chat_jid.clone()).or_default();
            match bucket.get_mut(&msg.id) {
                Some(entry) => {
                    merge_fields(&mut entry.msg.payload, &msg.payload);
                    entry.msg.from_me = msg.from_me;
                    if msg.timestamp != 0 {
                        entry.msg.timestamp = msg.timestamp;
                    }
                }
                None => {
                    bucket.insert(msg.id.clone(), MessageEntry { seq, msg });
                }
            }
        }
    }

    /// Applies a partial update to an already stored message; unknown keys
    /// are ignored (the original may have been pruned).
    pub async fn update_message(&self, chat_jid: &str, id: &str, update: &Value) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner
            .messages
            .get_mut(chat_jid)
            .and_then(|bucket| bucket.get_mut(id))
            && let Value::Object(fields) = update
        {
            merge_fields(&mut entry.msg.payload, fields);
        }
    }

    pub async fn load_message(&self, chat_jid: &str, id: &str) -> Option<StoredMessage> {
        let inner = self.inner.read().await;
        inner
            .messages
            .get(chat_jid)
            .and_then(|bucket| bucket.get(id))
            .map(|entry| entry.msg.clone())
    }

    /// Loads up to `limit` messages of one chat, oldest first.
    ///
    /// Ordering is total: timestamp ascending, insertion order as the
    /// tiebreaker. With a cursor, the page starts immediately after the
    /// matching `(id, from_me)` message; a cursor that no longer matches
    /// anything restarts from the beginning with `cursor_found == false`.
    /// An unknown chat yields an empty page.
    pub async fn load_messages(
        &self,
        chat_jid: &str,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> MessagePage {
        let inner = self.inner.read().await;
        let Some(bucket) = inner.messages.get(chat_jid) else {
            return MessagePage {
                messages: Vec::new(),
                cursor_found: cursor.is_none(),
            };
        };

        let mut entries: Vec<&MessageEntry> = bucket.values().collect();
        entries.sort_by_key(|e| (e.msg.timestamp, e.seq));

        let (start, cursor_found) = match cursor {
            Some(cursor) => {
                match entries
                    .iter()
                    .position(|e| e.msg.id == cursor.id && e.msg.from_me == cursor.from_me)
                {
                    Some(pos) => (pos + 1, true),
                    None => {
                        debug!(
                            target: "Store",
                            "Cursor {} not found in {chat_jid}, restarting from the beginning",
                            cursor.id
                        );
                        (0, false)
                    }
                }
            }
            None => (0, true),
        };

        let messages = entries
            .iter()
            .skip(start)
            .take(limit)
            .map(|e| e.msg.clone())
            .collect();

        MessagePage {
            messages,
            cursor_found,
        }
    }

    /// Chats filtered by addressing form: group JIDs or direct JIDs.
    pub async fn chat_list(&self, is_group: bool) -> Vec<Chat> {
        let suffix = if is_group {
            crate::jid::GROUP_SUFFIX
        } else {
            crate::jid::DIRECT_SUFFIX
        };
        let inner = self.inner.read().await;
        inner
            .chats
            .values()
            .filter(|chat| chat.jid.ends_with(suffix))
            .cloned()
            .collect()
    }

    /// Discards every message bucket while leaving chats, contacts and
    /// group metadata intact. Returns the number of buckets dropped.
    pub async fn clear_messages(&self) -> usize {
        let mut inner = self.inner.write().await;
        let dropped = inner.messages.len();
        inner.messages.clear();
        dropped
    }

    pub async fn counts(&self) -> StoreCounts {
        let inner = self.inner.read().await;
        StoreCounts {
            chats: inner.chats.len(),
            message_buckets: inner.messages.len(),
            messages: inner.messages.values().map(|b| b.len()).sum(),
            contacts: inner.contacts.len(),
            groups: inner.group_metadata.len(),
        }
    }

    /// Routes a protocol event into the store. Categories the store does
    /// not index (connection, presence, participants, identity mappings)
    /// are no-ops here; the lifecycle manager handles them separately.
    pub async fn apply_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::ChatsSet(chats) => self.set_chats(chats.clone()).await,
            SessionEvent::ChatsUpsert(chats) => self.upsert_chats(chats.clone()).await,
            SessionEvent::ChatsUpdate(chats) => self.update_chats(chats.clone()).await,
            SessionEvent::ChatsDelete(jids) => self.delete_chats(jids).await,
            SessionEvent::MessagesUpsert(messages) => self.upsert_messages(messages.clone()).await,
            SessionEvent::MessagesUpdate(updates) => {
                for update in updates {
                    self.update_message(&update.chat_jid, &update.key.id, &update.update)
                        .await;
                }
            }
            SessionEvent::ContactsSet(contacts) => self.set_contacts(contacts.clone()).await,
            SessionEvent::ContactsUpsert(contacts) | SessionEvent::ContactsUpdate(contacts) => {
                self.upsert_contacts(contacts.clone()).await
            }
            SessionEvent::GroupsUpsert(groups) | SessionEvent::GroupsUpdate(groups) => {
                self.update_group_metadata(groups.clone()).await
            }
            SessionEvent::ConnectionUpdate { .. }
            | SessionEvent::MessagesDelete(_)
            | SessionEvent::MessagesReaction(_)
            | SessionEvent::MessagesReceiptUpdate(_)
            | SessionEvent::MessagesMediaUpdate(_)
            | SessionEvent::MessagingHistorySet(_)
            | SessionEvent::GroupParticipantsUpdate(_)
            | SessionEvent::IdentityMappingUpdate(_)
            | SessionEvent::PresenceUpdate(_)
            | SessionEvent::BlocklistSet(_)
            | SessionEvent::BlocklistUpdate(_)
            | SessionEvent::QrCodeUpdated(_) => {}
        }
    }

    /// Serializes the full store to one JSON artifact, creating the parent
    /// directory if needed.
    pub async fn write_to_file(&self, path: &Path) -> Result<()> {
        let snapshot = {
            let inner = self.inner.read().await;
            let mut messages = HashMap::with_capacity(inner.messages.len());
            for (jid, bucket) in &inner.messages {
                let mut entries: Vec<&MessageEntry> = bucket.values().collect();
                entries.sort_by_key(|e| e.seq);
                messages.insert(
                    jid.clone(),
                    entries.iter().map(|e| e.msg.clone()).collect::<Vec<_>>(),
                );
            }
            StoreSnapshot {
                chats: inner.chats.values().cloned().collect(),
                messages,
                contacts: inner.contacts.values().cloned().collect(),
                group_metadata: inner.group_metadata.values().cloned().collect(),
            }
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        fs::write(path, data).await.map_err(StoreError::Io)
    }

    /// Restores the store from a snapshot file. A missing file means an
    /// empty store; an unreadable or malformed one is logged, removed and
    /// likewise treated as empty. This never fails session startup.
    /// Returns whether a snapshot was actually loaded.
    pub async fn read_from_file(&self, path: &Path) -> bool {
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(target: "Store", "Snapshot {} not found, starting fresh", path.display());
                return false;
            }
            Err(e) => {
                warn!(target: "Store", "Failed to read snapshot {}: {e}", path.display());
                return false;
            }
        };

        if data.iter().all(|b| b.is_ascii_whitespace()) {
            info!(target: "Store", "Snapshot {} is empty", path.display());
            return false;
        }

        let snapshot: StoreSnapshot = match serde_json::from_slice(&data) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(
                    target: "Store",
                    "Snapshot {} is corrupt ({e}), discarding and starting fresh",
                    path.display()
                );
                let _ = fs::remove_file(path).await;
                return false;
            }
        };

        let mut inner = self.inner.write().await;
        for chat in snapshot.chats {
            inner.chats.insert(chat.jid.clone(), chat);
        }
        for (jid, msgs) in snapshot.messages {
            for msg in msgs {
                let seq = inner.stamp();
                inner
                    .messages
                    .entry(jid.clone())
                    .or_default()
                    .insert(msg.id.clone(), MessageEntry { seq, msg });
            }
        }
        for contact in snapshot.contacts {
            inner.contacts.insert(contact.jid.clone(), contact);
        }
        for group in snapshot.group_metadata {
            inner.group_metadata.insert(group.jid.clone(), group);
        }
        info!(
            target: "Store",
            "Loaded snapshot {}: {} chats, {} message buckets, {} contacts, {} groups",
            path.display(),
            inner.chats.len(),
            inner.messages.len(),
            inner.contacts.len(),
            inner.group_metadata.len()
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(chat: &str, id: &str, ts: i64) -> StoredMessage {
        StoredMessage::new(chat, id, ts)
    }

    #[tokio::test]
    async fn repeated_upserts_merge_without_duplicating() {
        let store = MessageStore::new();

        let mut first = msg("123@s.whatsapp.net", "m1", 10);
        first.payload.insert("text".into(), json!("hello"));
        first.payload.insert("status".into(), json!("sent"));

        let mut second = msg("123@s.whatsapp.net", "m1", 10);
        second.payload.insert("status".into(), json!("read"));

        store.upsert_messages(vec![first]).await;
        store.upsert_messages(vec![second]).await;

        let counts = store.counts().await;
        assert_eq!(counts.messages, 1);

        let merged = store.load_message("123@s.whatsapp.net", "m1").await.unwrap();
        assert_eq!(merged.payload["text"], json!("hello"));
        assert_eq!(merged.payload["status"], json!("read"));
    }

    #[tokio::test]
    async fn pagination_follows_cursor() {
        let store = MessageStore::new();
        store
            .upsert_messages(vec![
                msg("123@x", "m1", 10),
                msg("123@x", "m2", 20),
                msg("123@x", "m3", 30),
            ])
            .await;

        let page = store.load_messages("123@x", 2, None).await;
        assert!(page.cursor_found);
        assert_eq!(
            page.messages.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["m1", "m2"]
        );

        let cursor = Cursor::new("m2", false);
        let page = store.load_messages("123@x", 2, Some(&cursor)).await;
        assert!(page.cursor_found);
        assert_eq!(
            page.messages.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["m3"]
        );
    }

    #[tokio::test]
    async fn successive_pages_cover_history_exactly_once() {
        let store = MessageStore::new();
        let msgs: Vec<StoredMessage> = (0..10)
            .map(|i| msg("chat@x", &format!("m{i}"), 100 + i as i64))
            .collect();
        store.upsert_messages(msgs).await;

        let mut seen = Vec::new();
        let mut cursor: Option<Cursor> = None;
        loop {
            let page = store.load_messages("chat@x", 3, cursor.as_ref()).await;
            assert!(page.cursor_found);
            if page.messages.is_empty() {
                break;
            }
            let last = page.messages.last().unwrap();
            cursor = Some(Cursor::new(last.id.clone(), last.from_me));
            seen.extend(page.messages.into_iter().map(|m| m.id));
        }

        let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn missing_cursor_restarts_from_beginning_and_is_flagged() {
        let store = MessageStore::new();
        store
            .upsert_messages(vec![msg("chat@x", "m1", 10), msg("chat@x", "m2", 20)])
            .await;

        let cursor = Cursor::new("pruned-away", false);
        let page = store.load_messages("chat@x", 10, Some(&cursor)).await;
        assert!(!page.cursor_found);
        assert_eq!(page.messages.len(), 2);
        assert_eq!(page.messages[0].id, "m1");
    }

    #[tokio::test]
    async fn unknown_chat_yields_empty_page() {
        let store = MessageStore::new();
        let page = store.load_messages("nobody@x", 5, None).await;
        assert!(page.messages.is_empty());
        assert!(page.cursor_found);
    }

    #[tokio::test]
    async fn identical_timestamps_keep_insertion_order() {
        let store = MessageStore::new();
        store
            .upsert_messages(vec![
                msg("chat@x", "a", 50),
                msg("chat@x", "b", 50),
                msg("chat@x", "c", 0),
            ])
            .await;

        let page = store.load_messages("chat@x", 10, None).await;
        let ids: Vec<&str> = page.messages.iter().map(|m| m.id.as_str()).collect();
        // Absent timestamp sorts as 0, ahead of the others; ties by insertion.
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn load_messages_is_idempotent() {
        let store = MessageStore::new();
        store
            .upsert_messages(vec![msg("chat@x", "m1", 1), msg("chat@x", "m2", 2)])
            .await;
        let a = store.load_messages("chat@x", 10, None).await;
        let b = store.load_messages("chat@x", 10, None).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn clear_messages_keeps_metadata() {
        let store = MessageStore::new();
        store
            .upsert_chats(vec![Chat::new("123@s.whatsapp.net")])
            .await;
        store.upsert_contacts(vec![Contact::new("123@s.whatsapp.net")]).await;
        store.upsert_messages(vec![msg("123@s.whatsapp.net", "m1", 1)]).await;

        assert_eq!(store.clear_messages().await, 1);

        let counts = store.counts().await;
        assert_eq!(counts.messages, 0);
        assert_eq!(counts.chats, 1);
        assert_eq!(counts.contacts, 1);
    }

    #[tokio::test]
    async fn chat_upserts_merge_fields() {
        let store = MessageStore::new();
        store
            .upsert_chats(vec![
                Chat::new("1@s.whatsapp.net").with_field("name", json!("Ana")),
            ])
            .await;
        store
            .upsert_chats(vec![
                Chat::new("1@s.whatsapp.net").with_field("unreadCount", json!(3)),
            ])
            .await;

        let chats = store.chat_list(false).await;
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].fields["name"], json!("Ana"));
        assert_eq!(chats[0].fields["unreadCount"], json!(3));
    }

    #[tokio::test]
    async fn chat_list_filters_by_group_suffix() {
        let store = MessageStore::new();
        store
            .upsert_chats(vec![Chat::new("1@s.whatsapp.net"), Chat::new("2-3@g.us")])
            .await;

        assert_eq!(store.chat_list(true).await[0].jid, "2-3@g.us");
        assert_eq!(store.chat_list(false).await[0].jid, "1@s.whatsapp.net");
    }

    #[tokio::test]
    async fn snapshot_roundtrip_preserves_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = MessageStore::new();
        store
            .upsert_messages(vec![
                msg("chat@x", "a", 50),
                msg("chat@x", "b", 50),
                msg("chat@x", "c", 10),
            ])
            .await;
        store.upsert_chats(vec![Chat::new("chat@x")]).await;
        store.write_to_file(&path).await.unwrap();

        let restored = MessageStore::new();
        assert!(restored.read_from_file(&path).await);

        let page = restored.load_messages("chat@x", 10, None).await;
        let ids: Vec<&str> = page.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        tokio::fs::write(&path, b"{ not json at all").await.unwrap();

        let store = MessageStore::new();
        assert!(!store.read_from_file(&path).await);
        assert_eq!(store.counts().await.messages, 0);
        // Corrupt file is removed so the next startup does not retry it.
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_snapshot_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::new();
        assert!(!store.read_from_file(&dir.path().join("nope.json")).await);
        assert_eq!(store.counts().await.chats, 0);
    }

    #[tokio::test]
    async fn apply_event_routes_store_categories() {
        let store = MessageStore::new();
        store
            .apply_event(&SessionEvent::ChatsUpsert(vec![Chat::new("1@s.whatsapp.net")]))
            .await;
        store
            .apply_event(&SessionEvent::MessagesUpsert(vec![msg(
                "1@s.whatsapp.net",
                "m1",
                5,
            )]))
            .await;
        store
            .apply_event(&SessionEvent::ChatsDelete(vec!["1@s.whatsapp.net".into()]))
            .await;

        let counts = store.counts().await;
        assert_eq!(counts.chats, 0);
        assert_eq!(counts.messages, 1);
    }
}
