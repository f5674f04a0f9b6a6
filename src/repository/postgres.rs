//! PostgreSQL `ConversationRepository` backed by sqlx
//!
//! Multi-step writes run in one SERIALIZABLE transaction; SQLSTATE 40001 and
//! 40P01 surface as `RepositoryError::SerializationConflict` so the caller's
//! transaction policy can replay them.

use super::{ConversationRepository, RepoResult, RepositoryError};
use crate::models::{
    Conversation, ConversationKind, Message, MetadataUpdate, Participant, ParticipantRole,
    ReadReceipt,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row, Transaction};
use std::collections::HashSet;
use uuid::Uuid;

const CONVERSATION_COLUMNS: &str = "id, kind, title, category, priority, party_a, party_b, \
     last_message_at, created_by, created_at";

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, content, priority, message_type, reply_to_id, created_at";

#[derive(Clone)]
pub struct PgConversationRepository {
    db: Pool<Postgres>,
}

impl PgConversationRepository {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    async fn begin_serializable(&self) -> RepoResult<Transaction<'static, Postgres>> {
        let mut tx = self.db.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }
}

fn conversation_from_row(row: &PgRow) -> RepoResult<Conversation> {
    let kind: String = row.try_get("kind")?;
    let kind = ConversationKind::from_db(&kind)
        .ok_or_else(|| RepositoryError::Backend(format!("unknown conversation kind: {kind}")))?;

    Ok(Conversation {
        id: row.try_get("id")?,
        kind,
        title: row.try_get("title")?,
        category: row.try_get("category")?,
        priority: row.try_get("priority")?,
        party_a: row.try_get("party_a")?,
        party_b: row.try_get("party_b")?,
        last_message_at: row.try_get("last_message_at")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
    })
}

fn participant_from_row(row: &PgRow) -> RepoResult<Participant> {
    let role: String = row.try_get("role")?;
    let role = ParticipantRole::from_db(&role)
        .ok_or_else(|| RepositoryError::Backend(format!("unknown participant role: {role}")))?;

    Ok(Participant {
        conversation_id: row.try_get("conversation_id")?,
        user_id: row.try_get("user_id")?,
        role,
        joined_at: row.try_get("joined_at")?,
        left_at: row.try_get("left_at")?,
    })
}

fn message_from_row(row: &PgRow) -> RepoResult<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: row.try_get("sender_id")?,
        content: row.try_get("content")?,
        priority: row.try_get("priority")?,
        message_type: row.try_get("message_type")?,
        reply_to_id: row.try_get("reply_to_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn receipt_from_row(row: &PgRow) -> RepoResult<ReadReceipt> {
    Ok(ReadReceipt {
        message_id: row.try_get("message_id")?,
        user_id: row.try_get("user_id")?,
        read_at: row.try_get("read_at")?,
    })
}

async fn insert_conversation_in(
    tx: &mut Transaction<'static, Postgres>,
    c: &Conversation,
) -> RepoResult<()> {
    sqlx::query(
        r#"
        INSERT INTO conversations
            (id, kind, title, category, priority, party_a, party_b,
             last_message_at, created_by, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(c.id)
    .bind(c.kind.to_db())
    .bind(&c.title)
    .bind(&c.category)
    .bind(&c.priority)
    .bind(c.party_a)
    .bind(c.party_b)
    .bind(c.last_message_at)
    .bind(c.created_by)
    .bind(c.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_participants_in(
    tx: &mut Transaction<'static, Postgres>,
    participants: &[Participant],
) -> RepoResult<()> {
    for p in participants {
        sqlx::query(
            r#"
            INSERT INTO conversation_participants
                (conversation_id, user_id, role, joined_at, left_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(p.conversation_id)
        .bind(p.user_id)
        .bind(p.role.to_db())
        .bind(p.joined_at)
        .bind(p.left_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl ConversationRepository for PgConversationRepository {
    async fn existing_user_ids(&self, user_ids: &[Uuid]) -> RepoResult<HashSet<Uuid>> {
        let rows = sqlx::query("SELECT id FROM users WHERE id = ANY($1)")
            .bind(user_ids)
            .fetch_all(&self.db)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<Uuid, _>("id").map_err(RepositoryError::from))
            .collect()
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> RepoResult<Option<Conversation>> {
        let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(conversation_id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn find_individual_conversation(
        &self,
        party_a: Uuid,
        party_b: Uuid,
    ) -> RepoResult<Option<Conversation>> {
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE kind = 'individual' AND party_a = $1 AND party_b = $2 \
             ORDER BY created_at ASC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(party_a)
            .bind(party_b)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn list_accessible_conversations(&self, user_id: Uuid) -> RepoResult<Vec<Conversation>> {
        let sql = format!(
            r#"
            SELECT {CONVERSATION_COLUMNS} FROM conversations c
            WHERE (c.kind = 'individual' AND (c.party_a = $1 OR c.party_b = $1))
               OR EXISTS (
                    SELECT 1 FROM conversation_participants cp
                    WHERE cp.conversation_id = c.id
                      AND cp.user_id = $1
                      AND cp.left_at IS NULL
               )
            ORDER BY c.last_message_at DESC
            "#
        );
        let rows = sqlx::query(&sql).bind(user_id).fetch_all(&self.db).await?;
        rows.iter().map(conversation_from_row).collect()
    }

    async fn insert_individual_conversation(
        &self,
        conversation: &Conversation,
    ) -> RepoResult<Option<Conversation>> {
        // The pair read takes a predicate lock, so two concurrent inserts for
        // the same pair cannot both commit
        let mut tx = self.begin_serializable().await?;
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE kind = 'individual' AND party_a = $1 AND party_b = $2 \
             ORDER BY created_at ASC LIMIT 1"
        );
        let existing = sqlx::query(&sql)
            .bind(conversation.party_a)
            .bind(conversation.party_b)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(row) = existing {
            let existing = conversation_from_row(&row)?;
            tx.rollback().await?;
            return Ok(Some(existing));
        }

        insert_conversation_in(&mut tx, conversation).await?;
        tx.commit().await?;
        Ok(None)
    }

    async fn create_group_conversation(
        &self,
        conversation: &Conversation,
        participants: &[Participant],
    ) -> RepoResult<()> {
        let mut tx = self.begin_serializable().await?;
        insert_conversation_in(&mut tx, conversation).await?;
        insert_participants_in(&mut tx, participants).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_conversation_with_message(
        &self,
        conversation: &Conversation,
        participants: &[Participant],
        message: &Message,
    ) -> RepoResult<()> {
        let mut tx = self.begin_serializable().await?;
        insert_conversation_in(&mut tx, conversation).await?;
        insert_participants_in(&mut tx, participants).await?;

        sqlx::query(
            r#"
            INSERT INTO messages
                (id, conversation_id, sender_id, content, priority, message_type,
                 reply_to_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(message.id)
        .bind(message.conversation_id)
        .bind(message.sender_id)
        .bind(&message.content)
        .bind(&message.priority)
        .bind(&message.message_type)
        .bind(message.reply_to_id)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE conversations SET last_message_at = $2 WHERE id = $1")
            .bind(conversation.id)
            .bind(message.created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_conversation_metadata(
        &self,
        conversation_id: Uuid,
        update: &MetadataUpdate,
    ) -> RepoResult<Conversation> {
        let sql = format!(
            r#"
            UPDATE conversations
            SET title = COALESCE($2, title),
                category = COALESCE($3, category),
                priority = COALESCE($4, priority)
            WHERE id = $1
            RETURNING {CONVERSATION_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(conversation_id)
            .bind(update.title.as_deref())
            .bind(update.category.as_deref())
            .bind(update.priority.as_deref())
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| RepositoryError::NotFound("conversation".to_string()))?;
        conversation_from_row(&row)
    }

    async fn touch_last_message_at(
        &self,
        conversation_id: Uuid,
        at: DateTime<Utc>,
    ) -> RepoResult<()> {
        let result = sqlx::query("UPDATE conversations SET last_message_at = $2 WHERE id = $1")
            .bind(conversation_id)
            .bind(at)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound("conversation".to_string()));
        }
        Ok(())
    }

    async fn active_participants(&self, conversation_id: Uuid) -> RepoResult<Vec<Participant>> {
        let rows = sqlx::query(
            r#"
            SELECT conversation_id, user_id, role, joined_at, left_at
            FROM conversation_participants
            WHERE conversation_id = $1 AND left_at IS NULL
            ORDER BY joined_at ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(participant_from_row).collect()
    }

    async fn replace_active_participants(
        &self,
        conversation_id: Uuid,
        participants: &[Participant],
        now: DateTime<Utc>,
    ) -> RepoResult<()> {
        let mut tx = self.begin_serializable().await?;

        sqlx::query(
            r#"
            UPDATE conversation_participants
            SET left_at = $2
            WHERE conversation_id = $1 AND left_at IS NULL
            "#,
        )
        .bind(conversation_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        insert_participants_in(&mut tx, participants).await?;

        let bumped = sqlx::query("UPDATE conversations SET last_message_at = $2 WHERE id = $1")
            .bind(conversation_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        if bumped.rows_affected() == 0 {
            // Dropping the transaction rolls it back
            return Err(RepositoryError::NotFound("conversation".to_string()));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_message(&self, message_id: Uuid) -> RepoResult<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(message_id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn find_message_in_conversation(
        &self,
        message_id: Uuid,
        conversation_id: Uuid,
    ) -> RepoResult<Option<Message>> {
        let sql =
            format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1 AND conversation_id = $2");
        let row = sqlx::query(&sql)
            .bind(message_id)
            .bind(conversation_id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn insert_message(&self, message: &Message) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO messages
                (id, conversation_id, sender_id, content, priority, message_type,
                 reply_to_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(message.id)
        .bind(message.conversation_id)
        .bind(message.sender_id)
        .bind(&message.content)
        .bind(&message.priority)
        .bind(&message.message_type)
        .bind(message.reply_to_id)
        .bind(message.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn latest_message(&self, conversation_id: Uuid) -> RepoResult<Option<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(conversation_id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn list_messages(&self, conversation_id: Uuid) -> RepoResult<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 \
             ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id)
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn read_receipts_for(&self, message_ids: &[Uuid]) -> RepoResult<Vec<ReadReceipt>> {
        let rows = sqlx::query(
            "SELECT message_id, user_id, read_at FROM message_read_receipts WHERE message_id = ANY($1)",
        )
        .bind(message_ids)
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(receipt_from_row).collect()
    }

    async fn upsert_read_receipt(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        read_at: DateTime<Utc>,
    ) -> RepoResult<ReadReceipt> {
        let row = sqlx::query(
            r#"
            INSERT INTO message_read_receipts (message_id, user_id, read_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (message_id, user_id) DO UPDATE SET read_at = EXCLUDED.read_at
            RETURNING message_id, user_id, read_at
            "#,
        )
        .bind(message_id)
        .bind(user_id)
        .bind(read_at)
        .fetch_one(&self.db)
        .await?;
        receipt_from_row(&row)
    }

    async fn count_unread(&self, user_id: Uuid, conversation_ids: &[Uuid]) -> RepoResult<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*)::bigint AS unread
            FROM messages m
            WHERE m.conversation_id = ANY($2)
              AND m.sender_id <> $1
              AND NOT EXISTS (
                    SELECT 1 FROM message_read_receipts r
                    WHERE r.message_id = m.id AND r.user_id = $1
              )
            "#,
        )
        .bind(user_id)
        .bind(conversation_ids)
        .fetch_one(&self.db)
        .await?;
        Ok(row.try_get("unread")?)
    }
}
