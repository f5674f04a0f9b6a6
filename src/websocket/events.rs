//! Server-to-client realtime events
//!
//! Every frame has the same envelope:
//! ```json
//! { "event": "message:new", "data": { ... } }
//! ```

use crate::models::{Conversation, Message, Participant};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "conversation:joined", rename_all = "camelCase")]
    ConversationJoined { conversation_id: Uuid },

    #[serde(rename = "conversation:left", rename_all = "camelCase")]
    ConversationLeft { conversation_id: Uuid },

    #[serde(rename = "typing:start", rename_all = "camelCase")]
    TypingStart { conversation_id: Uuid, user_id: Uuid },

    #[serde(rename = "typing:stop", rename_all = "camelCase")]
    TypingStop { conversation_id: Uuid, user_id: Uuid },

    #[serde(rename = "message:new", rename_all = "camelCase")]
    MessageNew {
        conversation_id: Uuid,
        message: Message,
    },

    #[serde(rename = "conversation:updated", rename_all = "camelCase")]
    ConversationUpdated {
        conversation_id: Uuid,
        conversation: Conversation,
        changed_fields: Vec<String>,
    },

    #[serde(rename = "participant:changed", rename_all = "camelCase")]
    ParticipantChanged {
        conversation_id: Uuid,
        participants: Vec<Participant>,
    },

    #[serde(rename = "user:online", rename_all = "camelCase")]
    UserOnline { user_id: Uuid },

    #[serde(rename = "user:offline", rename_all = "camelCase")]
    UserOffline { user_id: Uuid },

    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ServerEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ConversationJoined { .. } => "conversation:joined",
            Self::ConversationLeft { .. } => "conversation:left",
            Self::TypingStart { .. } => "typing:start",
            Self::TypingStop { .. } => "typing:stop",
            Self::MessageNew { .. } => "message:new",
            Self::ConversationUpdated { .. } => "conversation:updated",
            Self::ParticipantChanged { .. } => "participant:changed",
            Self::UserOnline { .. } => "user:online",
            Self::UserOffline { .. } => "user:offline",
            Self::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Serialize into a text frame
    pub fn to_frame(&self) -> Result<String, BroadcastError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_envelope_shape() {
        let conversation_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let frame = ServerEvent::TypingStart {
            conversation_id,
            user_id,
        }
        .to_frame()
        .unwrap();

        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "typing:start");
        assert_eq!(value["data"]["conversationId"], conversation_id.to_string());
        assert_eq!(value["data"]["userId"], user_id.to_string());
    }

    #[test]
    fn test_event_name_matches_wire_tag() {
        let events = vec![
            ServerEvent::ConversationJoined {
                conversation_id: Uuid::new_v4(),
            },
            ServerEvent::UserOffline {
                user_id: Uuid::new_v4(),
            },
            ServerEvent::error("bad frame"),
        ];
        for event in events {
            let value: Value = serde_json::from_str(&event.to_frame().unwrap()).unwrap();
            assert_eq!(value["event"], event.event_name());
        }
    }
}
