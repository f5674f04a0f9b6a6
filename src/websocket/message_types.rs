use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inbound commands from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    #[serde(rename = "join-conversation", rename_all = "camelCase")]
    JoinConversation { conversation_id: Uuid },

    #[serde(rename = "leave-conversation", rename_all = "camelCase")]
    LeaveConversation { conversation_id: Uuid },

    #[serde(rename = "typing-start", rename_all = "camelCase")]
    TypingStart { conversation_id: Uuid },

    #[serde(rename = "typing-stop", rename_all = "camelCase")]
    TypingStop { conversation_id: Uuid },
}
