pub mod conversation;
pub mod message;
pub mod participant;

// Re-export for convenience
pub use conversation::{
    Conversation, ConversationKind, ConversationOptions, ConversationSummary, MetadataUpdate,
    DEFAULT_CATEGORY, DEFAULT_PRIORITY,
};
pub use message::{Message, MessageView, ReadReceipt, SendMessageOptions, DEFAULT_MESSAGE_TYPE};
pub use participant::{build_participant_set, Participant, ParticipantRole};
