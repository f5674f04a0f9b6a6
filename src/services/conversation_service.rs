//! Conversation lifecycle: creation, membership, messages and read receipts
//!
//! Every read and write is access-checked first. Multi-step writes go through
//! a `TransactionPolicy`; realtime events are published only after commit.

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{
    build_participant_set, Conversation, ConversationKind, ConversationOptions,
    ConversationSummary, Message, MessageView, MetadataUpdate, Participant, ReadReceipt,
    SendMessageOptions, DEFAULT_MESSAGE_TYPE, DEFAULT_PRIORITY,
};
use crate::repository::{ConversationRepository, RepositoryError};
use crate::services::access::AccessControl;
use crate::services::transaction::TransactionPolicy;
use crate::websocket::bridge::{BridgeEvent, EventBridge};
use chrono::Utc;
use futures::future::try_join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";
pub const QUICK_MESSAGE_TITLE: &str = "Quick Message";

/// Policies for the two kinds of multi-step write
#[derive(Debug, Clone)]
pub struct TransactionPolicies {
    /// Group creation, participant replacement and the individual pair
    /// check-and-insert
    pub group: TransactionPolicy,
    /// Conversation plus first message
    pub initial_message: TransactionPolicy,
}

impl Default for TransactionPolicies {
    fn default() -> Self {
        Self {
            group: TransactionPolicy::with_timeout(Duration::from_secs(10), 3),
            initial_message: TransactionPolicy::with_timeout(Duration::from_secs(15), 3),
        }
    }
}

enum IndividualOutcome {
    Created(Conversation),
    Existing(Conversation),
}

/// Input for `create_conversation_with_initial_message`
#[derive(Debug, Clone)]
pub struct NewConversationWithMessage {
    pub kind: ConversationKind,
    pub participant_ids: Vec<Uuid>,
    pub initial_message: String,
    pub options: ConversationOptions,
}

pub struct ConversationService {
    repo: Arc<dyn ConversationRepository>,
    access: AccessControl,
    bridge: EventBridge,
    policies: TransactionPolicies,
}

fn observe<T>(operation: &str, result: &AppResult<T>) {
    match result {
        Ok(_) => metrics::record_operation(operation, "ok"),
        Err(e) => metrics::record_operation(operation, e.code()),
    }
}

impl ConversationService {
    pub fn new(
        repo: Arc<dyn ConversationRepository>,
        bridge: EventBridge,
        policies: TransactionPolicies,
    ) -> Self {
        Self {
            access: AccessControl::new(repo.clone()),
            repo,
            bridge,
            policies,
        }
    }

    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    async fn ensure_users_exist(&self, user_ids: &[Uuid]) -> AppResult<()> {
        let wanted: HashSet<Uuid> = user_ids.iter().copied().collect();
        let wanted: Vec<Uuid> = wanted.into_iter().collect();
        let found = self.repo.existing_user_ids(&wanted).await?;
        if let Some(missing) = wanted.iter().find(|id| !found.contains(id)) {
            return Err(AppError::NotFound(format!("user {missing}")));
        }
        Ok(())
    }

    fn individual(
        client_id: Uuid,
        therapist_id: Uuid,
        title: String,
        opts: &ConversationOptions,
    ) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: Uuid::new_v4(),
            kind: ConversationKind::Individual,
            title,
            category: opts.category_or_default(),
            priority: opts.priority_or_default(),
            party_a: Some(client_id),
            party_b: Some(therapist_id),
            last_message_at: now,
            created_by: therapist_id,
            created_at: now,
        }
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Individual conversation between a client and the calling therapist.
    /// Fails with `Conflict` if the pair already has one.
    pub async fn create_individual_conversation(
        &self,
        client_id: Uuid,
        therapist_id: Uuid,
        opts: ConversationOptions,
    ) -> AppResult<Conversation> {
        let result = self
            .create_individual_inner(client_id, therapist_id, &opts)
            .await;
        observe("create_individual_conversation", &result);
        result
    }

    async fn create_individual_inner(
        &self,
        client_id: Uuid,
        therapist_id: Uuid,
        opts: &ConversationOptions,
    ) -> AppResult<Conversation> {
        match self
            .insert_individual(client_id, therapist_id, opts, DEFAULT_CONVERSATION_TITLE)
            .await?
        {
            IndividualOutcome::Created(conversation) => Ok(conversation),
            IndividualOutcome::Existing(_) => Err(AppError::Conflict(
                "conversation already exists for this client and therapist".into(),
            )),
        }
    }

    /// Check-and-insert for the pair, run as one atomic repository write
    async fn insert_individual(
        &self,
        client_id: Uuid,
        therapist_id: Uuid,
        opts: &ConversationOptions,
        default_title: &str,
    ) -> AppResult<IndividualOutcome> {
        if client_id == therapist_id {
            return Err(AppError::Validation(
                "an individual conversation needs two distinct parties".into(),
            ));
        }
        if let Some(existing) = self
            .repo
            .find_individual_conversation(client_id, therapist_id)
            .await?
        {
            return Ok(IndividualOutcome::Existing(existing));
        }
        self.ensure_users_exist(&[client_id, therapist_id]).await?;

        let conversation =
            Self::individual(client_id, therapist_id, opts.title_or(default_title), opts);
        let repo = self.repo.as_ref();
        let conv_ref = &conversation;
        let existing = self
            .policies
            .group
            .run("insert_individual_conversation", move || {
                repo.insert_individual_conversation(conv_ref)
            })
            .await?;
        if let Some(existing) = existing {
            tracing::debug!(conversation_id = %existing.id, "pair created concurrently");
            return Ok(IndividualOutcome::Existing(existing));
        }

        tracing::info!(
            conversation_id = %conversation.id,
            %client_id,
            %therapist_id,
            "individual conversation created"
        );
        Ok(IndividualOutcome::Created(conversation))
    }

    /// Existing individual conversation for the pair, or a new one titled
    /// "Quick Message"
    pub async fn find_or_create_individual_conversation(
        &self,
        client_id: Uuid,
        therapist_id: Uuid,
        opts: ConversationOptions,
    ) -> AppResult<Conversation> {
        match self
            .insert_individual(client_id, therapist_id, &opts, QUICK_MESSAGE_TITLE)
            .await?
        {
            IndividualOutcome::Created(conversation) | IndividualOutcome::Existing(conversation) => {
                Ok(conversation)
            }
        }
    }

    /// Group conversation with `creator_id` as admin and everyone else as
    /// plain participants, written in one transaction
    pub async fn create_group_conversation(
        &self,
        title: &str,
        participant_ids: &[Uuid],
        creator_id: Uuid,
        opts: ConversationOptions,
    ) -> AppResult<Conversation> {
        let result = self
            .create_group_inner(title, participant_ids, creator_id, &opts)
            .await;
        observe("create_group_conversation", &result);
        result
    }

    async fn create_group_inner(
        &self,
        title: &str,
        participant_ids: &[Uuid],
        creator_id: Uuid,
        opts: &ConversationOptions,
    ) -> AppResult<Conversation> {
        let title = title.trim();
        if title.is_empty() {
            return Err(AppError::Validation("group title is required".into()));
        }

        let mut everyone = participant_ids.to_vec();
        everyone.push(creator_id);
        self.ensure_users_exist(&everyone).await?;

        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            kind: ConversationKind::Group,
            title: title.to_string(),
            category: opts.category_or_default(),
            priority: opts.priority_or_default(),
            party_a: None,
            party_b: None,
            last_message_at: now,
            created_by: creator_id,
            created_at: now,
        };
        let participants = build_participant_set(conversation.id, creator_id, participant_ids, now);

        let repo = self.repo.as_ref();
        let (conv_ref, parts_ref) = (&conversation, participants.as_slice());
        self.policies
            .group
            .run("create_group_conversation", move || {
                repo.create_group_conversation(conv_ref, parts_ref)
            })
            .await?;

        tracing::info!(
            conversation_id = %conversation.id,
            %creator_id,
            participants = participants.len(),
            "group conversation created"
        );
        Ok(conversation)
    }

    /// Conversation, its membership and the first message in one
    /// transaction. Publishes `NewMessage` after commit.
    pub async fn create_conversation_with_initial_message(
        &self,
        creator_id: Uuid,
        request: NewConversationWithMessage,
    ) -> AppResult<(Conversation, Message)> {
        let result = self.create_with_message_inner(creator_id, request).await;
        observe("create_conversation_with_initial_message", &result);
        result
    }

    async fn create_with_message_inner(
        &self,
        creator_id: Uuid,
        request: NewConversationWithMessage,
    ) -> AppResult<(Conversation, Message)> {
        let NewConversationWithMessage {
            kind,
            participant_ids,
            initial_message,
            options,
        } = request;

        if initial_message.trim().is_empty() {
            return Err(AppError::Validation("initial message is required".into()));
        }
        if participant_ids.is_empty() {
            return Err(AppError::Validation("participant list is empty".into()));
        }

        let (party_a, party_b) = match kind {
            ConversationKind::Individual => {
                let distinct: HashSet<Uuid> = participant_ids.iter().copied().collect();
                let other = participant_ids.iter().copied().find(|id| *id != creator_id);
                match other {
                    Some(client) if participant_ids.len() == 2 && distinct.len() == 2 => {
                        (Some(client), Some(creator_id))
                    }
                    _ => {
                        return Err(AppError::Validation(
                            "an individual conversation takes the creator and one other participant"
                                .into(),
                        ))
                    }
                }
            }
            ConversationKind::Group => (None, None),
        };

        let mut everyone = participant_ids.clone();
        everyone.push(creator_id);
        self.ensure_users_exist(&everyone).await?;

        let now = Utc::now();
        let mut conversation = Conversation {
            id: Uuid::new_v4(),
            kind,
            title: options.title_or(DEFAULT_CONVERSATION_TITLE),
            category: options.category_or_default(),
            priority: options.priority_or_default(),
            party_a,
            party_b,
            last_message_at: now,
            created_by: creator_id,
            created_at: now,
        };
        let participants = match kind {
            ConversationKind::Group => {
                build_participant_set(conversation.id, creator_id, &participant_ids, now)
            }
            ConversationKind::Individual => Vec::new(),
        };
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            sender_id: creator_id,
            content: initial_message,
            priority: conversation.priority.clone(),
            message_type: DEFAULT_MESSAGE_TYPE.to_string(),
            reply_to_id: None,
            created_at: now,
        };

        let repo = self.repo.as_ref();
        let (conv_ref, parts_ref, msg_ref) = (&conversation, participants.as_slice(), &message);
        self.policies
            .initial_message
            .run("create_conversation_with_initial_message", move || {
                repo.create_conversation_with_message(conv_ref, parts_ref, msg_ref)
            })
            .await?;

        conversation.last_message_at = message.created_at;
        self.bridge.publish(BridgeEvent::NewMessage {
            conversation_id: conversation.id,
            message: message.clone(),
        });

        tracing::info!(
            conversation_id = %conversation.id,
            kind = %conversation.kind,
            %creator_id,
            "conversation created with initial message"
        );
        Ok((conversation, message))
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
        opts: SendMessageOptions,
    ) -> AppResult<Message> {
        let result = self
            .send_message_inner(conversation_id, sender_id, content, opts)
            .await;
        observe("send_message", &result);
        result
    }

    async fn send_message_inner(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
        opts: SendMessageOptions,
    ) -> AppResult<Message> {
        self.access.check(sender_id, conversation_id).await?;

        if content.trim().is_empty() {
            return Err(AppError::Validation("message content is required".into()));
        }

        if let Some(parent_id) = opts.reply_to_id {
            self.repo
                .find_message_in_conversation(parent_id, conversation_id)
                .await?
                .ok_or_else(|| AppError::NotFound("reply target".into()))?;
        }

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            content: content.to_string(),
            priority: opts
                .priority
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PRIORITY.to_string()),
            message_type: opts
                .message_type
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MESSAGE_TYPE.to_string()),
            reply_to_id: opts.reply_to_id,
            created_at: Utc::now(),
        };

        self.repo.insert_message(&message).await?;
        // Separate write; concurrent senders settle last-write-wins
        self.repo
            .touch_last_message_at(conversation_id, message.created_at)
            .await?;

        self.bridge.publish(BridgeEvent::NewMessage {
            conversation_id,
            message: message.clone(),
        });

        tracing::debug!(
            message_id = %message.id,
            %conversation_id,
            %sender_id,
            "message sent"
        );
        Ok(message)
    }

    /// Record that `user_id` read the message; repeating refreshes `read_at`
    pub async fn mark_read(&self, message_id: Uuid, user_id: Uuid) -> AppResult<ReadReceipt> {
        let message = self
            .repo
            .get_message(message_id)
            .await?
            .ok_or_else(|| AppError::NotFound("message".into()))?;
        self.access
            .check(user_id, message.conversation_id)
            .await
            .map_err(|e| match e {
                AppError::NotFound(_) => AppError::NotFound("message".into()),
                other => other,
            })?;

        let receipt = self
            .repo
            .upsert_read_receipt(message_id, user_id, Utc::now())
            .await?;
        Ok(receipt)
    }

    /// Messages in accessible conversations, sent by others, with no receipt
    /// from `user_id`
    pub async fn get_unread_count(&self, user_id: Uuid) -> AppResult<i64> {
        let conversations = self.repo.list_accessible_conversations(user_id).await?;
        if conversations.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = conversations.iter().map(|c| c.id).collect();
        Ok(self.repo.count_unread(user_id, &ids).await?)
    }

    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Vec<MessageView>> {
        self.access.check(user_id, conversation_id).await?;

        let messages = self.repo.list_messages(conversation_id).await?;
        let ids: Vec<Uuid> = messages.iter().map(|m| m.id).collect();
        let mut receipts: HashMap<Uuid, Vec<ReadReceipt>> = HashMap::new();
        if !ids.is_empty() {
            for receipt in self.repo.read_receipts_for(&ids).await? {
                receipts.entry(receipt.message_id).or_default().push(receipt);
            }
        }

        Ok(messages
            .into_iter()
            .map(|message| {
                let read_receipts = receipts.remove(&message.id).unwrap_or_default();
                MessageView {
                    message,
                    read_receipts,
                }
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Accessible conversations, most recent activity first
    pub async fn list_conversations(&self, user_id: Uuid) -> AppResult<Vec<ConversationSummary>> {
        let conversations = self.repo.list_accessible_conversations(user_id).await?;
        let repo = self.repo.as_ref();
        let summaries = try_join_all(conversations.into_iter().map(|conversation| async move {
            let participants = repo.active_participants(conversation.id).await?;
            let last_message = repo.latest_message(conversation.id).await?;
            Ok::<_, RepositoryError>(ConversationSummary {
                conversation,
                participants,
                last_message,
            })
        }))
        .await?;
        Ok(summaries)
    }

    pub async fn get_conversation(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<ConversationSummary> {
        let grant = self.access.check(user_id, conversation_id).await?;
        let last_message = self.repo.latest_message(conversation_id).await?;
        Ok(ConversationSummary {
            conversation: grant.conversation,
            participants: grant.active_participants,
            last_message,
        })
    }

    // ------------------------------------------------------------------
    // Group administration
    // ------------------------------------------------------------------

    /// Partial update of title, category and priority. Group conversations
    /// require an active admin; an empty update returns the current row.
    pub async fn update_conversation_metadata(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        update: MetadataUpdate,
    ) -> AppResult<Conversation> {
        let result = self
            .update_metadata_inner(conversation_id, user_id, update)
            .await;
        observe("update_conversation_metadata", &result);
        result
    }

    async fn update_metadata_inner(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        update: MetadataUpdate,
    ) -> AppResult<Conversation> {
        let grant = self.access.check(user_id, conversation_id).await?;

        if update.is_empty() {
            return Ok(grant.conversation);
        }
        if grant.conversation.is_group() && !grant.is_admin(user_id) {
            return Err(AppError::Forbidden(
                "only a group admin can change conversation details".into(),
            ));
        }
        if let Some(field) = update.blank_field() {
            return Err(AppError::Validation(format!("{field} cannot be blank")));
        }

        let conversation = self
            .repo
            .update_conversation_metadata(conversation_id, &update)
            .await?;

        self.bridge.publish(BridgeEvent::ConversationUpdated {
            conversation_id,
            conversation: conversation.clone(),
            changed_fields: update.changed_fields(),
        });
        Ok(conversation)
    }

    /// Expire the current membership and install `new_ids` (plus the caller
    /// as admin) as fresh rows, atomically
    pub async fn replace_group_participants(
        &self,
        conversation_id: Uuid,
        admin_user_id: Uuid,
        new_ids: &[Uuid],
    ) -> AppResult<Vec<Participant>> {
        let result = self
            .replace_participants_inner(conversation_id, admin_user_id, new_ids)
            .await;
        observe("replace_group_participants", &result);
        result
    }

    async fn replace_participants_inner(
        &self,
        conversation_id: Uuid,
        admin_user_id: Uuid,
        new_ids: &[Uuid],
    ) -> AppResult<Vec<Participant>> {
        let grant = self.access.check(admin_user_id, conversation_id).await?;

        if !grant.conversation.is_group() {
            return Err(AppError::Forbidden(
                "participants can only be managed on group conversations".into(),
            ));
        }
        if !grant.is_admin(admin_user_id) {
            return Err(AppError::Forbidden(
                "only a group admin can manage participants".into(),
            ));
        }

        let mut everyone = new_ids.to_vec();
        everyone.push(admin_user_id);
        self.ensure_users_exist(&everyone).await?;

        let now = Utc::now();
        let participants = build_participant_set(conversation_id, admin_user_id, new_ids, now);

        let repo = self.repo.as_ref();
        let parts_ref = participants.as_slice();
        self.policies
            .group
            .run("replace_group_participants", move || {
                repo.replace_active_participants(conversation_id, parts_ref, now)
            })
            .await?;

        self.bridge.publish(BridgeEvent::ParticipantChanged {
            conversation_id,
            participants: participants.clone(),
        });

        tracing::info!(
            %conversation_id,
            %admin_user_id,
            participants = participants.len(),
            "group participants replaced"
        );
        Ok(participants)
    }
}
