//! Hand-off from committed writes to the realtime layer
//!
//! The lifecycle service publishes after commit; a single relay task owns the
//! receiving end. Delivery is at-most-once and in publish order. Nothing is
//! persisted, so events published while no relay is running are dropped.

use crate::models::{Conversation, Message, Participant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum BridgeEvent {
    NewMessage {
        conversation_id: Uuid,
        message: Message,
    },
    ConversationUpdated {
        conversation_id: Uuid,
        conversation: Conversation,
        changed_fields: Vec<String>,
    },
    ParticipantChanged {
        conversation_id: Uuid,
        participants: Vec<Participant>,
    },
}

impl BridgeEvent {
    pub fn conversation_id(&self) -> Uuid {
        match self {
            Self::NewMessage {
                conversation_id, ..
            }
            | Self::ConversationUpdated {
                conversation_id, ..
            }
            | Self::ParticipantChanged {
                conversation_id, ..
            } => *conversation_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new_message",
            Self::ConversationUpdated { .. } => "conversation_updated",
            Self::ParticipantChanged { .. } => "participant_changed",
        }
    }
}

#[derive(Clone)]
pub struct EventBridge {
    tx: UnboundedSender<BridgeEvent>,
}

impl EventBridge {
    /// Create the bridge and the receiver the relay task consumes
    pub fn channel() -> (Self, UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, event: BridgeEvent) {
        let kind = event.kind();
        let conversation_id = event.conversation_id();
        if self.tx.send(event).is_err() {
            tracing::warn!(
                kind,
                %conversation_id,
                "no relay subscribed, dropping realtime event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ParticipantRole;
    use chrono::Utc;

    fn participant_event(conversation_id: Uuid) -> BridgeEvent {
        BridgeEvent::ParticipantChanged {
            conversation_id,
            participants: vec![Participant::joining(
                conversation_id,
                Uuid::new_v4(),
                ParticipantRole::Admin,
                Utc::now(),
            )],
        }
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let (bridge, mut rx) = EventBridge::channel();
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();

        for id in &ids {
            bridge.publish(participant_event(*id));
        }

        for id in &ids {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.conversation_id(), *id);
            assert_eq!(event.kind(), "participant_changed");
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_is_dropped() {
        let (bridge, rx) = EventBridge::channel();
        drop(rx);
        // Must not panic or block
        bridge.publish(participant_event(Uuid::new_v4()));
    }
}
