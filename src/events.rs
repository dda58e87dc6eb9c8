use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::sidecar::SidecarStatus;
use crate::store::types::Message;

/// Events published to the view layer.
///
/// Delivery is per-channel ordered: events for a given message id arrive in
/// emission order, and a `chat:complete` / `chat:error` is terminal for that
/// id. Cross-channel ordering is unspecified.
#[derive(Debug, Clone)]
pub enum AppEvent {
    ChatStart {
        conversation_id: String,
        message_id: String,
    },
    ChatToken {
        conversation_id: String,
        message_id: String,
        token: String,
    },
    ChatComplete {
        conversation_id: String,
        message: Message,
    },
    ChatError {
        conversation_id: String,
        message_id: Option<String>,
        error: String,
    },
    ChatWarning {
        message: String,
    },
    DownloadProgress {
        id: String,
        downloaded_bytes: i64,
        total_bytes: Option<i64>,
        speed_bps: f64,
    },
    DownloadComplete {
        id: String,
        path: String,
    },
    DownloadError {
        id: String,
        error: String,
    },
    ModelStatus {
        status: SidecarStatus,
        message: Option<String>,
    },
}

impl AppEvent {
    pub fn channel(&self) -> &'static str {
        match self {
            AppEvent::ChatStart { .. } => "chat:start",
            AppEvent::ChatToken { .. } => "chat:token",
            AppEvent::ChatComplete { .. } => "chat:complete",
            AppEvent::ChatError { .. } => "chat:error",
            AppEvent::ChatWarning { .. } => "chat:warning",
            AppEvent::DownloadProgress { .. } => "download:progress",
            AppEvent::DownloadComplete { .. } => "download:complete",
            AppEvent::DownloadError { .. } => "download:error",
            AppEvent::ModelStatus { .. } => "model:status",
        }
    }

    /// Wire form sent to subscribers; field names are camelCase at the
    /// boundary.
    pub fn to_json(&self) -> Value {
        match self {
            AppEvent::ChatStart {
                conversation_id,
                message_id,
            } => json!({
                "type": self.channel(),
                "conversationId": conversation_id,
                "messageId": message_id,
            }),
            AppEvent::ChatToken {
                conversation_id,
                message_id,
                token,
            } => json!({
                "type": self.channel(),
                "conversationId": conversation_id,
                "messageId": message_id,
                "token": token,
            }),
            AppEvent::ChatComplete {
                conversation_id,
                message,
            } => json!({
                "type": self.channel(),
                "conversationId": conversation_id,
                "message": message,
            }),
            AppEvent::ChatError {
                conversation_id,
                message_id,
                error,
            } => json!({
                "type": self.channel(),
                "conversationId": conversation_id,
                "messageId": message_id,
                "error": error,
            }),
            AppEvent::ChatWarning { message } => json!({
                "type": self.channel(),
                "message": message,
            }),
            AppEvent::DownloadProgress {
                id,
                downloaded_bytes,
                total_bytes,
                speed_bps,
            } => json!({
                "type": self.channel(),
                "id": id,
                "downloadedBytes": downloaded_bytes,
                "totalBytes": total_bytes,
                "speedBps": speed_bps,
            }),
            AppEvent::DownloadComplete { id, path } => json!({
                "type": self.channel(),
                "id": id,
                "path": path,
            }),
            AppEvent::DownloadError { id, error } => json!({
                "type": self.channel(),
                "id": id,
                "error": error,
            }),
            AppEvent::ModelStatus { status, message } => json!({
                "type": self.channel(),
                "status": status,
                "message": message,
            }),
        }
    }
}

/// Bounded single-producer multi-consumer fan-out to the view.
///
/// Producers emit after their state is committed; a slow subscriber lags and
/// skips, it never blocks the core.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: AppEvent) {
        tracing::trace!("event {}", event.channel());
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        for i in 0..3 {
            bus.emit(AppEvent::ChatToken {
                conversation_id: "c".to_string(),
                message_id: "m".to_string(),
                token: i.to_string(),
            });
        }

        for expected in ["0", "1", "2"] {
            match rx.recv().await.unwrap() {
                AppEvent::ChatToken { token, .. } => assert_eq!(token, expected),
                other => panic!("unexpected event {:?}", other.channel()),
            }
        }
    }

    #[test]
    fn wire_form_uses_camel_case() {
        let event = AppEvent::DownloadProgress {
            id: "d1".to_string(),
            downloaded_bytes: 10,
            total_bytes: Some(100),
            speed_bps: 5.0,
        };
        let json = event.to_json();
        assert_eq!(json["type"], "download:progress");
        assert_eq!(json["downloadedBytes"], 10);
        assert_eq!(json["totalBytes"], 100);
    }
}
