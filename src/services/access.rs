//! Who may read or write a conversation
//!
//! A user has access iff they are a direct party of an individual
//! conversation or an active participant. Denied and unknown both come back
//! as `NotFound`.

use crate::error::{AppError, AppResult};
use crate::models::{Conversation, Participant};
use crate::repository::ConversationRepository;
use std::sync::Arc;
use uuid::Uuid;

pub fn can_access(user_id: Uuid, conversation: &Conversation, active: &[Participant]) -> bool {
    conversation.is_direct_party(user_id)
        || active
            .iter()
            .any(|p| p.user_id == user_id && p.is_active())
}

pub fn is_active_admin(user_id: Uuid, active: &[Participant]) -> bool {
    active
        .iter()
        .any(|p| p.user_id == user_id && p.is_active() && p.role.is_privileged())
}

/// Conversation loaded together with the rows that granted access
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub conversation: Conversation,
    pub active_participants: Vec<Participant>,
}

impl AccessGrant {
    pub fn is_admin(&self, user_id: Uuid) -> bool {
        is_active_admin(user_id, &self.active_participants)
    }
}

#[derive(Clone)]
pub struct AccessControl {
    repo: Arc<dyn ConversationRepository>,
}

impl AccessControl {
    pub fn new(repo: Arc<dyn ConversationRepository>) -> Self {
        Self { repo }
    }

    /// Load the conversation and fail closed unless `user_id` may access it
    pub async fn check(&self, user_id: Uuid, conversation_id: Uuid) -> AppResult<AccessGrant> {
        let conversation = self
            .repo
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| AppError::NotFound("conversation".into()))?;
        let active_participants = self.repo.active_participants(conversation_id).await?;

        if !can_access(user_id, &conversation, &active_participants) {
            tracing::debug!(%user_id, %conversation_id, "access denied");
            return Err(AppError::NotFound("conversation".into()));
        }

        Ok(AccessGrant {
            conversation,
            active_participants,
        })
    }
}
