//! Message bridge between the background engine and foreground UI
//! instances.
//!
//! Events flow out over a broadcast channel: every open dashboard tab
//! subscribes and receives every event. Commands flow in over an mpsc
//! channel into the engine run loop. The wire format is tagged JSON with
//! SCREAMING_SNAKE type names, matching what the dashboard's foreground
//! code already speaks.
//!
//! A lagged subscriber loses the oldest events; that is acceptable because
//! every event is re-derivable from durable state (conflicts can be
//! re-listed, the version can be re-queried).

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::conflict::ConflictRecord;
use crate::metrics;

/// Events pushed to every open foreground instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum WorkerEvent {
    /// A replay hit a server conflict; the UI must surface it
    SyncConflict {
        tenant_id: String,
        conflict: ConflictRecord,
    },
    /// A new deployment generation is ready to activate
    UpdateAvailable { version: u32 },
    /// Answer to a GET_VERSION query
    VersionInfo { version: u32 },
    /// The sticky tenant changed; other tabs should follow
    TenantSwitched { tenant_id: String },
}

impl WorkerEvent {
    /// Stable label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SyncConflict { .. } => "SYNC_CONFLICT",
            Self::UpdateAvailable { .. } => "UPDATE_AVAILABLE",
            Self::VersionInfo { .. } => "VERSION_INFO",
            Self::TenantSwitched { .. } => "TENANT_SWITCHED",
        }
    }
}

/// Commands a foreground instance sends into the engine run loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Activate the pending deployment generation now
    SkipWaiting,
    /// Ask for the active version (answered with VERSION_INFO)
    GetVersion,
    /// The user switched tenants
    TenantChanged { tenant_id: String },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SkipWaiting => "SKIP_WAITING",
            Self::GetVersion => "GET_VERSION",
            Self::TenantChanged { .. } => "TENANT_CHANGED",
        }
    }
}

/// Both channel ends the engine shares with the foreground.
pub struct MessageBridge {
    events_tx: broadcast::Sender<WorkerEvent>,
    commands_tx: mpsc::Sender<ClientMessage>,
}

impl MessageBridge {
    /// Create the bridge. The returned receiver is the engine run loop's
    /// command inbox.
    pub fn new(
        event_capacity: usize,
        command_capacity: usize,
    ) -> (Self, mpsc::Receiver<ClientMessage>) {
        let (events_tx, _) = broadcast::channel(event_capacity.max(1));
        let (commands_tx, commands_rx) = mpsc::channel(command_capacity.max(1));
        (
            Self {
                events_tx,
                commands_tx,
            },
            commands_rx,
        )
    }

    /// Subscribe a foreground instance to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events_tx.subscribe()
    }

    /// Broadcast an event to every subscriber. No subscribers is fine; the
    /// event is simply dropped.
    pub fn broadcast(&self, event: WorkerEvent) {
        metrics::record_broadcast(event.kind());
        debug!(event = event.kind(), "Broadcasting to foreground");
        let _ = self.events_tx.send(event);
    }

    /// Send a command into the engine run loop.
    pub async fn post(
        &self,
        message: ClientMessage,
    ) -> Result<(), mpsc::error::SendError<ClientMessage>> {
        metrics::record_client_message(message.kind());
        self.commands_tx.send(message).await
    }

    /// Number of currently subscribed foreground instances.
    pub fn subscriber_count(&self) -> usize {
        self.events_tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_format() {
        let event = WorkerEvent::UpdateAvailable { version: 4 };
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire, json!({"type": "UPDATE_AVAILABLE", "version": 4}));

        let event = WorkerEvent::TenantSwitched {
            tenant_id: "acme".to_string(),
        };
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire, json!({"type": "TENANT_SWITCHED", "tenantId": "acme"}));
    }

    #[test]
    fn test_conflict_event_carries_record() {
        let conflict = ConflictRecord {
            id: "m-1".to_string(),
            tenant: "acme".to_string(),
            entity_kind: "workitems".to_string(),
            entity_id: "42".to_string(),
            local_value: json!({"status": "done"}),
            remote_value: json!({"status": "blocked"}),
            local_timestamp_ms: 1_000,
            remote_timestamp_ms: 2_000,
            auto_resolvable: false,
            resolved: false,
        };
        let wire = serde_json::to_value(WorkerEvent::SyncConflict {
            tenant_id: "acme".to_string(),
            conflict,
        })
        .unwrap();

        assert_eq!(wire["type"], "SYNC_CONFLICT");
        assert_eq!(wire["tenantId"], "acme");
        assert_eq!(wire["conflict"]["entityId"], "42");
        assert_eq!(wire["conflict"]["autoResolvable"], false);
    }

    #[test]
    fn test_client_message_wire_format() {
        let msg: ClientMessage = serde_json::from_value(json!({"type": "SKIP_WAITING"})).unwrap();
        assert_eq!(msg, ClientMessage::SkipWaiting);

        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "TENANT_CHANGED", "tenantId": "globex"})).unwrap();
        assert_eq!(
            msg,
            ClientMessage::TenantChanged {
                tenant_id: "globex".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let (bridge, _commands) = MessageBridge::new(8, 8);
        let mut a = bridge.subscribe();
        let mut b = bridge.subscribe();
        assert_eq!(bridge.subscriber_count(), 2);

        bridge.broadcast(WorkerEvent::VersionInfo { version: 3 });

        assert_eq!(a.recv().await.unwrap(), WorkerEvent::VersionInfo { version: 3 });
        assert_eq!(b.recv().await.unwrap(), WorkerEvent::VersionInfo { version: 3 });
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_fine() {
        let (bridge, _commands) = MessageBridge::new(8, 8);
        bridge.broadcast(WorkerEvent::VersionInfo { version: 3 });
    }

    #[tokio::test]
    async fn test_post_reaches_run_loop() {
        let (bridge, mut commands) = MessageBridge::new(8, 8);
        bridge.post(ClientMessage::GetVersion).await.unwrap();
        assert_eq!(commands.recv().await.unwrap(), ClientMessage::GetVersion);
    }
}
