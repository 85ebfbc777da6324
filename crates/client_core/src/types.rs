use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{GeoPoint, GroupId, MessageId, MessageKind, UserId},
    protocol::MessageRow,
};
use uuid::Uuid;

/// Prefix that keeps locally generated ids visibly apart from store ids.
pub const TEMP_ID_PREFIX: &str = "temp-";

const UNKNOWN_SENDER_NAME: &str = "Traveler";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TempId(Uuid);

impl TempId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TEMP_ID_PREFIX}{}", self.0)
    }
}

/// Identifies a message: either the id assigned by the store, or a temporary
/// id for an optimistic entry that has not been confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MessageKey {
    Persisted(MessageId),
    Temporary(TempId),
}

impl MessageKey {
    pub fn persisted(&self) -> Option<MessageId> {
        match self {
            MessageKey::Persisted(id) => Some(*id),
            MessageKey::Temporary(_) => None,
        }
    }

    pub fn temporary(&self) -> Option<TempId> {
        match self {
            MessageKey::Persisted(_) => None,
            MessageKey::Temporary(id) => Some(*id),
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, MessageKey::Temporary(_))
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKey::Persisted(id) => write!(f, "{id}"),
            MessageKey::Temporary(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceClip {
    pub url: String,
    pub duration_secs: Option<u32>,
}

/// Position attached to SOS alerts and location updates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationPayload {
    pub point: GeoPoint,
    pub recorded_at: DateTime<Utc>,
}

/// Canonical message shape every delivery path works with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub key: MessageKey,
    pub group_id: GroupId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub kind: MessageKind,
    pub body: Option<String>,
    pub voice: Option<VoiceClip>,
    pub mentions: Vec<UserId>,
    pub edited: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub location: Option<LocationPayload>,
}

impl Message {
    /// Builds the placeholder shown while a send is in flight.
    pub fn optimistic(
        group_id: GroupId,
        sender: &Identity,
        payload: &OutgoingMessage,
        now: DateTime<Utc>,
    ) -> Self {
        let body = payload.body();
        let (kind, voice, mentions) = match payload {
            OutgoingMessage::Text { mentions, .. } => (MessageKind::Text, None, mentions.clone()),
            OutgoingMessage::Voice { url, duration_secs, .. } => (
                MessageKind::Voice,
                Some(VoiceClip {
                    url: url.clone(),
                    duration_secs: *duration_secs,
                }),
                Vec::new(),
            ),
        };
        Self {
            key: MessageKey::Temporary(TempId::generate()),
            group_id,
            sender_id: sender.user_id,
            sender_name: sender.display_name.clone(),
            kind,
            body,
            voice,
            mentions,
            edited: false,
            created_at: now,
            updated_at: now,
            location: None,
        }
    }

    pub fn persisted_id(&self) -> Option<MessageId> {
        self.key.persisted()
    }

    pub fn is_optimistic(&self) -> bool {
        self.key.is_temporary()
    }

    pub fn is_sos(&self) -> bool {
        self.kind == MessageKind::Sos
    }

    pub fn is_location_update(&self) -> bool {
        self.kind == MessageKind::Text && self.location.is_some()
    }

    /// Same logical event as `other` under the sender + body rule.
    pub fn same_content(&self, other: &Message) -> bool {
        self.sender_id == other.sender_id && self.body == other.body
    }
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        let sender_name = match row.sender_name.trim() {
            "" => UNKNOWN_SENDER_NAME.to_string(),
            name => name.to_string(),
        };
        let voice = row.voice_url.filter(|url| !url.is_empty()).map(|url| VoiceClip {
            url,
            duration_secs: row.voice_duration,
        });
        let location = row.sos_location.map(|point| LocationPayload {
            point,
            recorded_at: row.sos_timestamp.unwrap_or(row.created_at),
        });
        Self {
            key: MessageKey::Persisted(row.id),
            group_id: row.group_id,
            sender_id: row.sender_id,
            sender_name,
            kind: row.message_type,
            body: row.text.filter(|text| !text.is_empty()),
            voice,
            mentions: row.mentions,
            edited: row.edited,
            created_at: row.created_at,
            updated_at: row.updated_at,
            location,
        }
    }
}

/// The signed-in user as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingMessage {
    Text {
        body: String,
        mentions: Vec<UserId>,
    },
    Voice {
        url: String,
        duration_secs: Option<u32>,
        caption: Option<String>,
    },
}

impl OutgoingMessage {
    pub fn text(body: impl Into<String>) -> Self {
        OutgoingMessage::Text {
            body: body.into(),
            mentions: Vec::new(),
        }
    }

    /// Body as it is stored. A blank voice caption is stored as no body, and
    /// the optimistic placeholder must carry the same value to be confirmed.
    pub fn body(&self) -> Option<String> {
        match self {
            OutgoingMessage::Text { body, .. } => Some(body.clone()),
            OutgoingMessage::Voice { caption, .. } => caption
                .as_ref()
                .filter(|caption| !caption.trim().is_empty())
                .cloned(),
        }
    }
}

/// Text entry state for the optimistic send flow: cleared on submit and
/// restored when the send fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Composer {
    text: String,
}

impl Composer {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.text)
    }

    pub fn restore(&mut self, text: String) {
        self.text = text;
    }
}
