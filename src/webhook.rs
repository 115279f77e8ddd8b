//! Outbound event notifications.
//!
//! Every protocol event a session emits is offered to a [`NotificationSink`].
//! Delivery is strictly best-effort: failures are logged and never affect the
//! session lifecycle.

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{Value, json};
use std::time::Duration;

/// Hard cap on a webhook POST, so a hung endpoint cannot pin a blocking
/// thread indefinitely.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, session_id: &str, event_type: &str, payload: Value);
}

/// Sink used when no webhook URL is configured.
#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl NotificationSink for NoopSink {
    async fn deliver(&self, _session_id: &str, _event_type: &str, _payload: Value) {}
}

/// POSTs `{instance, type, data}` to a fixed URL for every allowed event.
pub struct WebhookSink {
    url: String,
    /// Event type allowlist; the single entry "ALL" admits everything.
    allowed: Vec<String>,
    agent: ureq::Agent,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, allowed: Vec<String>) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(DELIVERY_TIMEOUT))
            .build()
            .into();
        Self {
            url: url.into(),
            allowed,
            agent,
        }
    }

    fn is_allowed(&self, event_type: &str) -> bool {
        self.allowed
            .iter()
            .any(|a| a == "ALL" || a == event_type)
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn deliver(&self, session_id: &str, event_type: &str, payload: Value) {
        if !self.is_allowed(event_type) {
            debug!(target: "Webhook", "[{session_id}] Skipping filtered event {event_type}");
            return;
        }

        let body = json!({
            "instance": session_id,
            "type": event_type,
            "data": payload,
        });
        let bytes = match serde_json::to_vec(&body) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(target: "Webhook", "[{session_id}] Failed to encode {event_type}: {e}");
                return;
            }
        };

        let url = self.url.clone();
        let agent = self.agent.clone();
        let session = session_id.to_string();
        let kind = event_type.to_string();

        // ureq is blocking, so the POST runs on the blocking pool.
        let result = tokio::task::spawn_blocking(move || {
            agent
                .post(&url)
                .header("Content-Type", "application/json")
                .send(&bytes[..])
                .map(|resp| resp.status().as_u16())
        })
        .await;

        match result {
            Ok(Ok(status)) => {
                debug!(target: "Webhook", "[{session}] Delivered {kind} ({status})")
            }
            Ok(Err(e)) => {
                warn!(target: "Webhook", "[{session}] Delivery of {kind} failed: {e}")
            }
            Err(e) => {
                warn!(target: "Webhook", "[{session}] Delivery task for {kind} panicked: {e}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_admits_every_event() {
        let sink = WebhookSink::new("http://localhost/hook", vec!["ALL".into()]);
        assert!(sink.is_allowed("CONNECTION_UPDATE"));
        assert!(sink.is_allowed("MESSAGES_UPSERT"));
    }

    #[test]
    fn allowlist_filters_by_exact_type() {
        let sink = WebhookSink::new(
            "http://localhost/hook",
            vec!["MESSAGES_UPSERT".into(), "CONNECTION_UPDATE".into()],
        );
        assert!(sink.is_allowed("MESSAGES_UPSERT"));
        assert!(!sink.is_allowed("CHATS_UPSERT"));
    }

    #[test]
    fn empty_allowlist_blocks_everything() {
        let sink = WebhookSink::new("http://localhost/hook", Vec::new());
        assert!(!sink.is_allowed("MESSAGES_UPSERT"));
    }
}
