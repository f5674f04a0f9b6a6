use super::{Message, Participant};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub const DEFAULT_CATEGORY: &str = "general";
pub const DEFAULT_PRIORITY: &str = "normal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    /// Two fixed direct parties, no participant rows
    Individual,
    /// Membership tracked through participant rows
    Group,
}

impl ConversationKind {
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "individual" => Some(Self::Individual),
            "group" => Some(Self::Group),
            _ => None,
        }
    }

    pub fn to_db(&self) -> &'static str {
        match self {
            Self::Individual => "individual",
            Self::Group => "group",
        }
    }
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub kind: ConversationKind,
    pub title: String,
    pub category: String,
    pub priority: String,
    /// Client side of an individual conversation
    pub party_a: Option<Uuid>,
    /// Therapist side of an individual conversation
    pub party_b: Option<Uuid>,
    pub last_message_at: DateTime<Utc>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_group(&self) -> bool {
        self.kind == ConversationKind::Group
    }

    /// Direct parties only exist on individual conversations
    pub fn is_direct_party(&self, user_id: Uuid) -> bool {
        self.kind == ConversationKind::Individual
            && (self.party_a == Some(user_id) || self.party_b == Some(user_id))
    }
}

/// Optional fields supplied when creating a conversation
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationOptions {
    pub title: Option<String>,
    pub category: Option<String>,
    pub priority: Option<String>,
}

impl ConversationOptions {
    pub fn category_or_default(&self) -> String {
        non_blank(self.category.as_deref()).unwrap_or(DEFAULT_CATEGORY).to_string()
    }

    pub fn priority_or_default(&self) -> String {
        non_blank(self.priority.as_deref()).unwrap_or(DEFAULT_PRIORITY).to_string()
    }

    pub fn title_or(&self, fallback: &str) -> String {
        non_blank(self.title.as_deref()).unwrap_or(fallback).to_string()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Partial metadata change; `None` leaves the field untouched
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataUpdate {
    pub title: Option<String>,
    pub category: Option<String>,
    pub priority: Option<String>,
}

impl MetadataUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.category.is_none() && self.priority.is_none()
    }

    /// Names of the fields this update touches, in wire naming
    pub fn changed_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        if self.title.is_some() {
            fields.push("title".to_string());
        }
        if self.category.is_some() {
            fields.push("category".to_string());
        }
        if self.priority.is_some() {
            fields.push("priority".to_string());
        }
        fields
    }

    /// First field set to an empty or whitespace-only value
    pub fn blank_field(&self) -> Option<&'static str> {
        [
            ("title", &self.title),
            ("category", &self.category),
            ("priority", &self.priority),
        ]
        .into_iter()
        .find(|(_, value)| value.as_deref().is_some_and(|v| v.trim().is_empty()))
        .map(|(name, _)| name)
    }

    pub fn apply_to(&self, conversation: &mut Conversation) {
        if let Some(title) = &self.title {
            conversation.title = title.clone();
        }
        if let Some(category) = &self.category {
            conversation.category = category.clone();
        }
        if let Some(priority) = &self.priority {
            conversation.priority = priority.clone();
        }
    }
}

/// List/detail view: conversation with its active participants and latest message
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub participants: Vec<Participant>,
    pub last_message: Option<Message>,
}
