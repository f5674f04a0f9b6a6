//! Room-based fan-out
//!
//! Client commands (join, leave, typing) are answered here directly. Committed
//! changes arrive through the event bridge and go to everyone currently in the
//! conversation room. Delivery is gated by room membership only: a user removed
//! from a group keeps receiving room broadcasts until they leave the room or
//! disconnect.

use super::bridge::BridgeEvent;
use super::events::ServerEvent;
use super::message_types::ClientCommand;
use super::{conversation_room, ConnectionId, ConnectionRegistry};
use crate::metrics;
use crate::services::AccessControl;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Clone)]
pub struct BroadcastDispatcher {
    registry: ConnectionRegistry,
    access: AccessControl,
}

impl BroadcastDispatcher {
    pub fn new(registry: ConnectionRegistry, access: AccessControl) -> Self {
        Self { registry, access }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Parse and handle one text frame from a connection
    pub async fn handle_frame(&self, connection_id: ConnectionId, user_id: Uuid, text: &str) {
        match serde_json::from_str::<ClientCommand>(text) {
            Ok(command) => self.handle_command(connection_id, user_id, command).await,
            Err(e) => {
                tracing::warn!(%connection_id, error = %e, "malformed realtime frame");
                self.registry
                    .send_event(connection_id, &ServerEvent::error("malformed command"))
                    .await;
            }
        }
    }

    pub async fn handle_command(
        &self,
        connection_id: ConnectionId,
        user_id: Uuid,
        command: ClientCommand,
    ) {
        match command {
            ClientCommand::JoinConversation { conversation_id } => {
                self.join(connection_id, user_id, conversation_id).await
            }
            ClientCommand::LeaveConversation { conversation_id } => {
                self.registry
                    .leave_room(connection_id, &conversation_room(conversation_id))
                    .await;
                self.registry
                    .send_event(connection_id, &ServerEvent::ConversationLeft { conversation_id })
                    .await;
            }
            ClientCommand::TypingStart { conversation_id } => {
                let event = ServerEvent::TypingStart {
                    conversation_id,
                    user_id,
                };
                self.relay_typing(connection_id, conversation_id, &event).await;
            }
            ClientCommand::TypingStop { conversation_id } => {
                let event = ServerEvent::TypingStop {
                    conversation_id,
                    user_id,
                };
                self.relay_typing(connection_id, conversation_id, &event).await;
            }
        }
    }

    async fn join(&self, connection_id: ConnectionId, user_id: Uuid, conversation_id: Uuid) {
        if let Err(e) = self.access.check(user_id, conversation_id).await {
            tracing::debug!(%user_id, %conversation_id, error = %e, "join refused");
            self.registry
                .send_event(connection_id, &ServerEvent::error("conversation not found"))
                .await;
            return;
        }

        let room = conversation_room(conversation_id);
        let left = self
            .registry
            .leave_conversation_rooms(connection_id, &room)
            .await;
        if !left.is_empty() {
            tracing::debug!(%connection_id, rooms = ?left, "left previous conversation rooms");
        }
        self.registry.join_room(connection_id, &room).await;
        self.registry
            .send_event(connection_id, &ServerEvent::ConversationJoined { conversation_id })
            .await;
    }

    /// Fire-and-forget to the rest of the room
    async fn relay_typing(
        &self,
        connection_id: ConnectionId,
        conversation_id: Uuid,
        event: &ServerEvent,
    ) {
        let Ok(frame) = event.to_frame() else {
            return;
        };
        self.registry
            .broadcast_room(&conversation_room(conversation_id), &frame, Some(connection_id))
            .await;
    }

    /// Fan a committed change out to its conversation room
    pub async fn relay(&self, event: BridgeEvent) -> usize {
        let kind = event.kind();
        let conversation_id = event.conversation_id();
        let server_event = match event {
            BridgeEvent::NewMessage {
                conversation_id,
                message,
            } => ServerEvent::MessageNew {
                conversation_id,
                message,
            },
            BridgeEvent::ConversationUpdated {
                conversation_id,
                conversation,
                changed_fields,
            } => ServerEvent::ConversationUpdated {
                conversation_id,
                conversation,
                changed_fields,
            },
            BridgeEvent::ParticipantChanged {
                conversation_id,
                participants,
            } => ServerEvent::ParticipantChanged {
                conversation_id,
                participants,
            },
        };

        let frame = match server_event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, kind, "failed to encode relayed event");
                return 0;
            }
        };

        let delivered = self
            .registry
            .broadcast_room(&conversation_room(conversation_id), &frame, None)
            .await;
        metrics::record_relayed(kind);
        tracing::debug!(%conversation_id, kind, delivered, "relayed event");
        delivered
    }

    /// Consume the bridge until every publisher is dropped
    pub fn spawn_relay(self, mut rx: UnboundedReceiver<BridgeEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.relay(event).await;
            }
            tracing::info!("event bridge closed, relay stopped");
        })
    }
}
