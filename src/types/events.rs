use crate::types::message::{Chat, Contact, GroupMetadata, LidMapping, MessageKey, StoredMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why the protocol client closed a connection. Mirrors the disconnect
/// classification the underlying protocol reports; the lifecycle manager
/// only cares about three properties, exposed as methods below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Credentials were invalidated server-side. Terminal, never retried.
    LoggedOut,
    /// Server asked for a stream restart. Retried without backoff.
    RestartRequired,
    ConnectionClosed,
    ConnectionLost,
    TimedOut,
    Unknown,
}

impl DisconnectReason {
    /// Terminal authentication failure: the session is deleted, not retried.
    pub fn is_logged_out(self) -> bool {
        matches!(self, DisconnectReason::LoggedOut)
    }

    /// Server-mandated restarts reconnect immediately, skipping backoff.
    pub fn bypasses_backoff(self) -> bool {
        matches!(self, DisconnectReason::RestartRequired)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Open,
    Close { reason: DisconnectReason },
}

/// A message-field update keyed by (chat, message id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub key: MessageKey,
    pub chat_jid: String,
    pub update: Value,
}

/// Everything the protocol client can emit for one session, as a closed sum
/// so the lifecycle manager's dispatch is exhaustive at compile time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    ConnectionUpdate {
        state: ConnectionState,
        /// Freshly issued QR credential, if the update carried one.
        qr: Option<String>,
    },
    ChatsSet(Vec<Chat>),
    ChatsUpsert(Vec<Chat>),
    ChatsUpdate(Vec<Chat>),
    ChatsDelete(Vec<String>),
    MessagesUpsert(Vec<StoredMessage>),
    MessagesUpdate(Vec<MessageUpdate>),
    MessagesDelete(Value),
    MessagesReaction(Value),
    MessagesReceiptUpdate(Value),
    MessagesMediaUpdate(Value),
    /// Full history sync payload as delivered by the client; the store
    /// consumes history through the typed `*Set` events instead.
    MessagingHistorySet(Value),
    ContactsSet(Vec<Contact>),
    ContactsUpsert(Vec<Contact>),
    ContactsUpdate(Vec<Contact>),
    GroupsUpsert(Vec<GroupMetadata>),
    GroupsUpdate(Vec<GroupMetadata>),
    GroupParticipantsUpdate(Value),
    IdentityMappingUpdate(Vec<LidMapping>),
    PresenceUpdate(Value),
    BlocklistSet(Value),
    BlocklistUpdate(Value),
    QrCodeUpdated(Value),
}

impl SessionEvent {
    /// Notification-sink event type, matching the webhook vocabulary of the
    /// upstream API (`CHATS_UPSERT`, `CONNECTION_UPDATE`, ...).
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::ConnectionUpdate { .. } => "CONNECTION_UPDATE",
            SessionEvent::ChatsSet(_) => "CHATS_SET",
            SessionEvent::ChatsUpsert(_) => "CHATS_UPSERT",
            SessionEvent::ChatsUpdate(_) => "CHATS_UPDATE",
            SessionEvent::ChatsDelete(_) => "CHATS_DELETE",
            SessionEvent::MessagesUpsert(_) => "MESSAGES_UPSERT",
            SessionEvent::MessagesUpdate(_) => "MESSAGES_UPDATE",
            SessionEvent::MessagesDelete(_) => "MESSAGES_DELETE",
            SessionEvent::MessagesReaction(_) => "MESSAGES_REACTION",
            SessionEvent::MessagesReceiptUpdate(_) => "MESSAGES_RECEIPT_UPDATE",
            SessionEvent::MessagesMediaUpdate(_) => "MESSAGES_MEDIA_UPDATE",
            SessionEvent::MessagingHistorySet(_) => "MESSAGING_HISTORY_SET",
            SessionEvent::ContactsSet(_) => "CONTACTS_SET",
            SessionEvent::ContactsUpsert(_) => "CONTACTS_UPSERT",
            SessionEvent::ContactsUpdate(_) => "CONTACTS_UPDATE",
            SessionEvent::GroupsUpsert(_) => "GROUPS_UPSERT",
            SessionEvent::GroupsUpdate(_) => "GROUPS_UPDATE",
            SessionEvent::GroupParticipantsUpdate(_) => "GROUP_PARTICIPANTS_UPDATE",
            SessionEvent::IdentityMappingUpdate(_) => "LID_MAPPING_UPDATE",
            SessionEvent::PresenceUpdate(_) => "PRESENCE_UPDATE",
            SessionEvent::BlocklistSet(_) => "BLOCKLIST_SET",
            SessionEvent::BlocklistUpdate(_) => "BLOCKLIST_UPDATE",
            SessionEvent::QrCodeUpdated(_) => "QRCODE_UPDATED",
        }
    }

    /// Payload forwarded to the notification sink. Serialization of these
    /// types cannot fail, so a null payload only appears for exotic inputs.
    pub fn payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_reason_classification() {
        assert!(DisconnectReason::LoggedOut.is_logged_out());
        assert!(!DisconnectReason::LoggedOut.bypasses_backoff());
        assert!(DisconnectReason::RestartRequired.bypasses_backoff());
        assert!(!DisconnectReason::ConnectionLost.is_logged_out());
        assert!(!DisconnectReason::ConnectionLost.bypasses_backoff());
    }

    #[test]
    fn passthrough_categories_keep_their_webhook_names() {
        use serde_json::json;
        let cases = [
            (SessionEvent::MessagesReaction(json!([])), "MESSAGES_REACTION"),
            (
                SessionEvent::MessagesReceiptUpdate(json!([])),
                "MESSAGES_RECEIPT_UPDATE",
            ),
            (
                SessionEvent::MessagesMediaUpdate(json!([])),
                "MESSAGES_MEDIA_UPDATE",
            ),
            (
                SessionEvent::MessagingHistorySet(json!({})),
                "MESSAGING_HISTORY_SET",
            ),
            (SessionEvent::BlocklistSet(json!({})), "BLOCKLIST_SET"),
            (SessionEvent::BlocklistUpdate(json!({})), "BLOCKLIST_UPDATE"),
            (SessionEvent::QrCodeUpdated(json!("2@qr")), "QRCODE_UPDATED"),
        ];
        for (event, expected) in cases {
            assert_eq!(event.event_type(), expected);
        }
    }

    #[test]
    fn event_type_covers_connection_updates() {
        let ev = SessionEvent::ConnectionUpdate {
            state: ConnectionState::Open,
            qr: None,
        };
        assert_eq!(ev.event_type(), "CONNECTION_UPDATE");
        assert!(ev.payload().is_object() || ev.payload().is_string() || ev.payload().is_null());
    }
}
