//! Participant role and membership rows
//!
//! Membership is soft-deleted: a row whose `left_at` is `None` is active.
//! Roles have a natural ordering: Participant < Admin

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Role held by an active participant of a group conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    /// Regular member - can read and send messages
    Participant = 0,
    /// Admin - can edit metadata and replace the participant set
    Admin = 1,
}

impl ParticipantRole {
    /// Parse role from database string
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "participant" => Some(Self::Participant),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// Convert role to database string
    pub fn to_db(&self) -> &'static str {
        match self {
            Self::Participant => "participant",
            Self::Admin => "admin",
        }
    }

    /// Check if this role can perform admin actions
    pub fn is_privileged(&self) -> bool {
        *self >= ParticipantRole::Admin
    }
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

impl Participant {
    /// Fresh membership period starting at `joined_at`
    pub fn joining(
        conversation_id: Uuid,
        user_id: Uuid,
        role: ParticipantRole,
        joined_at: DateTime<Utc>,
    ) -> Self {
        Self {
            conversation_id,
            user_id,
            role,
            joined_at,
            left_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

/// Build the participant set for a group write: duplicates collapse to one row,
/// `admin_id` is always present with the admin role, everyone else is a
/// plain participant. Input order is preserved with the admin first.
pub fn build_participant_set(
    conversation_id: Uuid,
    admin_id: Uuid,
    user_ids: &[Uuid],
    joined_at: DateTime<Utc>,
) -> Vec<Participant> {
    let mut ordered = vec![admin_id];
    for user_id in user_ids {
        if !ordered.contains(user_id) {
            ordered.push(*user_id);
        }
    }

    ordered
        .into_iter()
        .map(|user_id| {
            let role = if user_id == admin_id {
                ParticipantRole::Admin
            } else {
                ParticipantRole::Participant
            };
            Participant::joining(conversation_id, user_id, role, joined_at)
        })
        .collect()
}
