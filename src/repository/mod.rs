//! Persisted store abstraction for conversations, participants, messages and
//! read receipts.
//!
//! Multi-step writes are exposed as single trait methods. Each adapter runs
//! such a method as one atomic unit (one SQL transaction, or one critical
//! section for the in-memory store); the timeout and retry policy around it
//! lives in `services::transaction`.

use crate::models::{Conversation, Message, MetadataUpdate, Participant, ReadReceipt};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryRepository;
pub use postgres::PgConversationRepository;

pub type RepoResult<T> = Result<T, RepositoryError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    /// Serialization failure or deadlock; the transaction can be replayed
    #[error("serialization conflict: {0}")]
    SerializationConflict(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl RepositoryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::SerializationConflict(_))
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("row".to_string()),
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01") => {
                    RepositoryError::SerializationConflict(db_err.message().to_string())
                }
                Some("23505") => RepositoryError::UniqueViolation(
                    db_err.constraint().unwrap_or("unknown").to_string(),
                ),
                _ => RepositoryError::Backend(e.to_string()),
            },
            _ => RepositoryError::Backend(e.to_string()),
        }
    }
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    // ------------------------------------------------------------------
    // Users (owned by the identity side, read-only here)
    // ------------------------------------------------------------------

    /// Subset of `user_ids` that resolve to real users
    async fn existing_user_ids(&self, user_ids: &[Uuid]) -> RepoResult<HashSet<Uuid>>;

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    async fn get_conversation(&self, conversation_id: Uuid) -> RepoResult<Option<Conversation>>;

    /// Individual conversation whose direct parties are exactly (party_a, party_b)
    async fn find_individual_conversation(
        &self,
        party_a: Uuid,
        party_b: Uuid,
    ) -> RepoResult<Option<Conversation>>;

    /// Conversations where the user is a direct party or an active
    /// participant, most recent `last_message_at` first
    async fn list_accessible_conversations(&self, user_id: Uuid) -> RepoResult<Vec<Conversation>>;

    /// Atomic: insert an individual conversation unless its (party_a, party_b)
    /// pair already has one, in which case the existing row is returned and
    /// nothing is written
    async fn insert_individual_conversation(
        &self,
        conversation: &Conversation,
    ) -> RepoResult<Option<Conversation>>;

    /// Atomic: conversation row plus its initial participant rows
    async fn create_group_conversation(
        &self,
        conversation: &Conversation,
        participants: &[Participant],
    ) -> RepoResult<()>;

    /// Atomic: conversation row, optional participant rows and the first message
    async fn create_conversation_with_message(
        &self,
        conversation: &Conversation,
        participants: &[Participant],
        message: &Message,
    ) -> RepoResult<()>;

    async fn update_conversation_metadata(
        &self,
        conversation_id: Uuid,
        update: &MetadataUpdate,
    ) -> RepoResult<Conversation>;

    async fn touch_last_message_at(
        &self,
        conversation_id: Uuid,
        at: DateTime<Utc>,
    ) -> RepoResult<()>;

    // ------------------------------------------------------------------
    // Participants
    // ------------------------------------------------------------------

    async fn active_participants(&self, conversation_id: Uuid) -> RepoResult<Vec<Participant>>;

    /// Atomic: set `left_at = now` on every active row, insert `participants`
    /// as fresh rows and bump `last_message_at` to `now`
    async fn replace_active_participants(
        &self,
        conversation_id: Uuid,
        participants: &[Participant],
        now: DateTime<Utc>,
    ) -> RepoResult<()>;

    // ------------------------------------------------------------------
    // Messages and read receipts
    // ------------------------------------------------------------------

    async fn get_message(&self, message_id: Uuid) -> RepoResult<Option<Message>>;

    async fn find_message_in_conversation(
        &self,
        message_id: Uuid,
        conversation_id: Uuid,
    ) -> RepoResult<Option<Message>>;

    async fn insert_message(&self, message: &Message) -> RepoResult<()>;

    async fn latest_message(&self, conversation_id: Uuid) -> RepoResult<Option<Message>>;

    /// Oldest first
    async fn list_messages(&self, conversation_id: Uuid) -> RepoResult<Vec<Message>>;

    async fn read_receipts_for(&self, message_ids: &[Uuid]) -> RepoResult<Vec<ReadReceipt>>;

    async fn upsert_read_receipt(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        read_at: DateTime<Utc>,
    ) -> RepoResult<ReadReceipt>;

    /// Messages in `conversation_ids` sent by someone other than `user_id`
    /// that carry no receipt from `user_id`
    async fn count_unread(&self, user_id: Uuid, conversation_ids: &[Uuid]) -> RepoResult<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_serialization_conflicts_are_transient() {
        assert!(RepositoryError::SerializationConflict("40001".into()).is_transient());
        assert!(!RepositoryError::Backend("io".into()).is_transient());
        assert!(!RepositoryError::UniqueViolation("pk".into()).is_transient());
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err = RepositoryError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }
}
