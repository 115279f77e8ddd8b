use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifies one message inside one chat. Pagination cursors and upsert
/// idempotency both key on `(chat, id, from_me)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub id: String,
    #[serde(default)]
    pub from_me: bool,
}

impl MessageKey {
    pub fn new(id: impl Into<String>, from_me: bool) -> Self {
        Self {
            id: id.into(),
            from_me,
        }
    }
}

/// A message as held by the store: a key, an ordering timestamp and an
/// opaque payload. The payload is whatever the protocol client decoded;
/// the store never interprets it beyond shallow-merging fields on upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub chat_jid: String,
    pub id: String,
    #[serde(default)]
    pub from_me: bool,
    /// Unix timestamp in seconds. Missing timestamps sort as 0.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl StoredMessage {
    pub fn new(chat_jid: impl Into<String>, id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            chat_jid: chat_jid.into(),
            id: id.into(),
            from_me: false,
            timestamp,
            payload: Map::new(),
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.id.clone(), self.from_me)
    }
}

/// Exclusive lower bound for pagination: the page starts immediately after
/// the message matching this key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub id: String,
    #[serde(default)]
    pub from_me: bool,
}

impl Cursor {
    pub fn new(id: impl Into<String>, from_me: bool) -> Self {
        Self {
            id: id.into(),
            from_me,
        }
    }
}

/// One page of chat history, oldest first.
///
/// `cursor_found` is false when a cursor was given but its message no longer
/// exists (typically pruned mid-pagination); the page then restarts from the
/// beginning so callers can detect the reset instead of silently re-reading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePage {
    pub messages: Vec<StoredMessage>,
    pub cursor_found: bool,
}

/// A chat keyed by JID. Everything besides the JID is opaque metadata
/// merged last-write-wins per field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    #[serde(rename = "id")]
    pub jid: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Chat {
    pub fn new(jid: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(rename = "id")]
    pub jid: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Contact {
    pub fn new(jid: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            fields: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMetadata {
    #[serde(rename = "id")]
    pub jid: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl GroupMetadata {
    pub fn new(jid: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            fields: Map::new(),
        }
    }
}

/// One LID/phone-number pairing learned from the protocol client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LidMapping {
    pub lid: String,
    pub pn: String,
}
