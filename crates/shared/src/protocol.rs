use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{GeoPoint, GroupId, MessageId, MessageKind, UserId};

/// One row of the `group_chat_messages` table as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub group_id: GroupId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub message_type: MessageKind,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_duration: Option<u32>,
    #[serde(default)]
    pub mentions: Vec<UserId>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sos_location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sos_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload; the store assigns `id`, `created_at` and `updated_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessageRow {
    pub group_id: GroupId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub message_type: MessageKind,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_duration: Option<u32>,
    #[serde(default)]
    pub mentions: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sos_location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sos_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePatch {
    pub text: String,
    pub edited: bool,
}

/// Change feed delta scoped to a single group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChangeEvent {
    Insert { row: MessageRow },
    Update { row: MessageRow },
    Delete { id: MessageId, group_id: GroupId },
}

impl ChangeEvent {
    pub fn group_id(&self) -> GroupId {
        match self {
            ChangeEvent::Insert { row } | ChangeEvent::Update { row } => row.group_id,
            ChangeEvent::Delete { group_id, .. } => *group_id,
        }
    }
}
