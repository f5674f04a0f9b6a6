//! In-memory `ConversationRepository`
//!
//! Every trait method takes the state lock once, so multi-step writes are
//! atomic with respect to each other. Used by the test suite and by local
//! runs with `STORAGE_BACKEND=memory`.

use super::{ConversationRepository, RepoResult, RepositoryError};
use crate::models::{
    Conversation, ConversationKind, Message, MetadataUpdate, Participant, ReadReceipt,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    users: HashSet<Uuid>,
    conversations: HashMap<Uuid, Conversation>,
    // Full history, including expired membership periods
    participants: Vec<Participant>,
    messages: Vec<Message>,
    receipts: HashMap<(Uuid, Uuid), ReadReceipt>,
}

impl MemoryState {
    fn active_participants(&self, conversation_id: Uuid) -> Vec<Participant> {
        self.participants
            .iter()
            .filter(|p| p.conversation_id == conversation_id && p.is_active())
            .cloned()
            .collect()
    }

    fn can_access(&self, conversation: &Conversation, user_id: Uuid) -> bool {
        conversation.is_direct_party(user_id)
            || self.participants.iter().any(|p| {
                p.conversation_id == conversation.id && p.user_id == user_id && p.is_active()
            })
    }

    fn insert_conversation(&mut self, conversation: &Conversation) -> RepoResult<()> {
        if self.conversations.contains_key(&conversation.id) {
            return Err(RepositoryError::UniqueViolation(
                "conversations_pkey".to_string(),
            ));
        }
        self.conversations
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    /// Oldest individual conversation for the pair
    fn find_individual(&self, party_a: Uuid, party_b: Uuid) -> Option<Conversation> {
        self.conversations
            .values()
            .filter(|c| {
                c.kind == ConversationKind::Individual
                    && c.party_a == Some(party_a)
                    && c.party_b == Some(party_b)
            })
            .min_by_key(|c| c.created_at)
            .cloned()
    }

    fn insert_participants(&mut self, participants: &[Participant]) -> RepoResult<()> {
        for participant in participants {
            let duplicate_active = self.participants.iter().any(|p| {
                p.conversation_id == participant.conversation_id
                    && p.user_id == participant.user_id
                    && p.is_active()
            });
            if duplicate_active {
                return Err(RepositoryError::UniqueViolation(
                    "conversation_participants_active_idx".to_string(),
                ));
            }
            self.participants.push(participant.clone());
        }
        Ok(())
    }
}

/// Process-local store behind a single `RwLock`
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<RwLock<MemoryState>>,
    // Remaining atomic writes that should fail with a serialization conflict
    injected_conflicts: Arc<AtomicU32>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register ids that `existing_user_ids` will resolve
    pub async fn register_users(&self, user_ids: &[Uuid]) {
        let mut state = self.state.write().await;
        state.users.extend(user_ids.iter().copied());
    }

    /// Make the next `count` atomic writes fail with a serialization conflict
    /// before touching any state
    pub fn inject_serialization_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Every participant row for the conversation, expired ones included
    pub async fn participant_history(&self, conversation_id: Uuid) -> Vec<Participant> {
        let state = self.state.read().await;
        state
            .participants
            .iter()
            .filter(|p| p.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.len()
    }

    pub async fn receipt_count(&self) -> usize {
        self.state.read().await.receipts.len()
    }

    fn take_injected_conflict(&self) -> RepoResult<()> {
        let claimed = self
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match claimed {
            Ok(_) => Err(RepositoryError::SerializationConflict(
                "could not serialize access due to concurrent update".to_string(),
            )),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ConversationRepository for InMemoryRepository {
    async fn existing_user_ids(&self, user_ids: &[Uuid]) -> RepoResult<HashSet<Uuid>> {
        let state = self.state.read().await;
        Ok(user_ids
            .iter()
            .filter(|id| state.users.contains(id))
            .copied()
            .collect())
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> RepoResult<Option<Conversation>> {
        let state = self.state.read().await;
        Ok(state.conversations.get(&conversation_id).cloned())
    }

    async fn find_individual_conversation(
        &self,
        party_a: Uuid,
        party_b: Uuid,
    ) -> RepoResult<Option<Conversation>> {
        let state = self.state.read().await;
        Ok(state.find_individual(party_a, party_b))
    }

    async fn list_accessible_conversations(&self, user_id: Uuid) -> RepoResult<Vec<Conversation>> {
        let state = self.state.read().await;
        let mut conversations: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| state.can_access(c, user_id))
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(conversations)
    }

    async fn insert_individual_conversation(
        &self,
        conversation: &Conversation,
    ) -> RepoResult<Option<Conversation>> {
        self.take_injected_conflict()?;
        let mut state = self.state.write().await;

        if let (Some(party_a), Some(party_b)) = (conversation.party_a, conversation.party_b) {
            if let Some(existing) = state.find_individual(party_a, party_b) {
                return Ok(Some(existing));
            }
        }
        state.insert_conversation(conversation)?;
        Ok(None)
    }

    async fn create_group_conversation(
        &self,
        conversation: &Conversation,
        participants: &[Participant],
    ) -> RepoResult<()> {
        self.take_injected_conflict()?;
        let mut state = self.state.write().await;

        state.insert_conversation(conversation)?;
        if let Err(e) = state.insert_participants(participants) {
            state.conversations.remove(&conversation.id);
            state.participants.retain(|p| p.conversation_id != conversation.id);
            return Err(e);
        }
        Ok(())
    }

    async fn create_conversation_with_message(
        &self,
        conversation: &Conversation,
        participants: &[Participant],
        message: &Message,
    ) -> RepoResult<()> {
        self.take_injected_conflict()?;
        let mut state = self.state.write().await;

        state.insert_conversation(conversation)?;
        if let Err(e) = state.insert_participants(participants) {
            state.conversations.remove(&conversation.id);
            state.participants.retain(|p| p.conversation_id != conversation.id);
            return Err(e);
        }
        state.messages.push(message.clone());
        if let Some(c) = state.conversations.get_mut(&conversation.id) {
            c.last_message_at = message.created_at;
        }
        Ok(())
    }

    async fn update_conversation_metadata(
        &self,
        conversation_id: Uuid,
        update: &MetadataUpdate,
    ) -> RepoResult<Conversation> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| RepositoryError::NotFound("conversation".to_string()))?;
        update.apply_to(conversation);
        Ok(conversation.clone())
    }

    async fn touch_last_message_at(
        &self,
        conversation_id: Uuid,
        at: DateTime<Utc>,
    ) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| RepositoryError::NotFound("conversation".to_string()))?;
        conversation.last_message_at = at;
        Ok(())
    }

    async fn active_participants(&self, conversation_id: Uuid) -> RepoResult<Vec<Participant>> {
        let state = self.state.read().await;
        Ok(state.active_participants(conversation_id))
    }

    async fn replace_active_participants(
        &self,
        conversation_id: Uuid,
        participants: &[Participant],
        now: DateTime<Utc>,
    ) -> RepoResult<()> {
        self.take_injected_conflict()?;
        let mut state = self.state.write().await;

        if !state.conversations.contains_key(&conversation_id) {
            return Err(RepositoryError::NotFound("conversation".to_string()));
        }

        let expired: Vec<usize> = state
            .participants
            .iter()
            .enumerate()
            .filter(|(_, p)| p.conversation_id == conversation_id && p.is_active())
            .map(|(i, _)| i)
            .collect();
        let rollback_len = state.participants.len();
        for &i in &expired {
            state.participants[i].left_at = Some(now);
        }
        if let Err(e) = state.insert_participants(participants) {
            state.participants.truncate(rollback_len);
            for i in expired {
                state.participants[i].left_at = None;
            }
            return Err(e);
        }

        if let Some(c) = state.conversations.get_mut(&conversation_id) {
            c.last_message_at = now;
        }
        Ok(())
    }

    async fn get_message(&self, message_id: Uuid) -> RepoResult<Option<Message>> {
        let state = self.state.read().await;
        Ok(state.messages.iter().find(|m| m.id == message_id).cloned())
    }

    async fn find_message_in_conversation(
        &self,
        message_id: Uuid,
        conversation_id: Uuid,
    ) -> RepoResult<Option<Message>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .iter()
            .find(|m| m.id == message_id && m.conversation_id == conversation_id)
            .cloned())
    }

    async fn insert_message(&self, message: &Message) -> RepoResult<()> {
        let mut state = self.state.write().await;
        if !state.conversations.contains_key(&message.conversation_id) {
            return Err(RepositoryError::NotFound("conversation".to_string()));
        }
        state.messages.push(message.clone());
        Ok(())
    }

    async fn latest_message(&self, conversation_id: Uuid) -> RepoResult<Option<Message>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .max_by_key(|m| m.created_at)
            .cloned())
    }

    async fn list_messages(&self, conversation_id: Uuid) -> RepoResult<Vec<Message>> {
        let state = self.state.read().await;
        let mut messages: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn read_receipts_for(&self, message_ids: &[Uuid]) -> RepoResult<Vec<ReadReceipt>> {
        let state = self.state.read().await;
        Ok(state
            .receipts
            .values()
            .filter(|r| message_ids.contains(&r.message_id))
            .cloned()
            .collect())
    }

    async fn upsert_read_receipt(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        read_at: DateTime<Utc>,
    ) -> RepoResult<ReadReceipt> {
        let mut state = self.state.write().await;
        let receipt = ReadReceipt {
            message_id,
            user_id,
            read_at,
        };
        state.receipts.insert((message_id, user_id), receipt.clone());
        Ok(receipt)
    }

    async fn count_unread(&self, user_id: Uuid, conversation_ids: &[Uuid]) -> RepoResult<i64> {
        let state = self.state.read().await;
        let count = state
            .messages
            .iter()
            .filter(|m| conversation_ids.contains(&m.conversation_id))
            .filter(|m| m.sender_id != user_id)
            .filter(|m| !state.receipts.contains_key(&(m.id, user_id)))
            .count();
        Ok(count as i64)
    }
}
