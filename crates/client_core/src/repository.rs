use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use shared::{
    domain::{GeoPoint, GroupId, MessageId, MessageKind, UserId},
    protocol::{MessagePatch, NewMessageRow},
};
use tracing::info;

use crate::{
    error::ChatError,
    format::{location_update_body, sos_body},
    store::MessageStore,
    types::{Identity, Message, OutgoingMessage},
};

/// Typed operations over the message table. Store failures are returned to
/// the caller as-is; nothing here retries.
#[derive(Clone)]
pub struct ChatRepository {
    store: Arc<dyn MessageStore>,
}

impl ChatRepository {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    pub async fn send(
        &self,
        group_id: GroupId,
        sender: &Identity,
        payload: &OutgoingMessage,
    ) -> Result<Message, ChatError> {
        let row = match payload {
            OutgoingMessage::Text { body, mentions } => {
                if body.trim().is_empty() {
                    return Err(ChatError::Validation("message text is empty".into()));
                }
                NewMessageRow {
                    mentions: mentions.clone(),
                    ..new_row(group_id, sender, MessageKind::Text, Some(body.clone()))
                }
            }
            OutgoingMessage::Voice { url, duration_secs, .. } => {
                if url.trim().is_empty() {
                    return Err(ChatError::Validation("voice message needs a clip url".into()));
                }
                NewMessageRow {
                    voice_url: Some(url.clone()),
                    voice_duration: *duration_secs,
                    ..new_row(group_id, sender, MessageKind::Voice, payload.body())
                }
            }
        };
        self.insert(row).await
    }

    pub async fn send_sos_alert(
        &self,
        group_id: GroupId,
        sender: &Identity,
        location: GeoPoint,
    ) -> Result<Message, ChatError> {
        let at = Utc::now();
        let body = sos_body(&sender.display_name, location, at);
        let row = NewMessageRow {
            sos_location: Some(location),
            sos_timestamp: Some(at),
            ..new_row(group_id, sender, MessageKind::Sos, Some(body))
        };
        let message = self.insert_located(row).await?;
        info!(
            group_id = group_id.0,
            sender_id = sender.user_id.0,
            "sos alert sent"
        );
        Ok(message)
    }

    /// Location updates are ordinary text messages that carry a position.
    pub async fn send_location_update(
        &self,
        group_id: GroupId,
        sender: &Identity,
        location: GeoPoint,
    ) -> Result<Message, ChatError> {
        let at = Utc::now();
        let body = location_update_body(&sender.display_name, location, at);
        let row = NewMessageRow {
            sos_location: Some(location),
            sos_timestamp: Some(at),
            ..new_row(group_id, sender, MessageKind::Text, Some(body))
        };
        self.insert_located(row).await
    }

    /// Every message of the group, oldest first.
    pub async fn fetch_all(&self, group_id: GroupId) -> Result<Vec<Message>, ChatError> {
        let rows = self
            .store
            .select_by_group(group_id)
            .await
            .with_context(|| format!("failed to fetch messages for group {group_id}"))?;
        let mut messages: Vec<Message> = rows.into_iter().map(Message::from).collect();
        messages.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.persisted_id().cmp(&b.persisted_id()))
        });
        Ok(messages)
    }

    pub async fn edit(
        &self,
        message_id: MessageId,
        new_text: &str,
        requester: UserId,
    ) -> Result<Message, ChatError> {
        if new_text.trim().is_empty() {
            return Err(ChatError::Validation("edited text is empty".into()));
        }
        let existing = self.load(message_id).await?;
        if existing.sender_id != requester {
            return Err(ChatError::PermissionDenied {
                message_id,
                requester,
            });
        }
        let row = self
            .store
            .update(
                message_id,
                MessagePatch {
                    text: new_text.to_string(),
                    edited: true,
                },
            )
            .await
            .with_context(|| format!("failed to update message {message_id}"))?;
        Ok(Message::from(row))
    }

    /// Privileged callers (group admins) may delete any message.
    pub async fn delete(
        &self,
        message_id: MessageId,
        requester: UserId,
        is_privileged: bool,
    ) -> Result<(), ChatError> {
        if !is_privileged {
            let existing = self.load(message_id).await?;
            if existing.sender_id != requester {
                return Err(ChatError::PermissionDenied {
                    message_id,
                    requester,
                });
            }
        }
        self.store
            .delete(message_id)
            .await
            .with_context(|| format!("failed to delete message {message_id}"))?;
        Ok(())
    }

    async fn load(&self, message_id: MessageId) -> Result<Message, ChatError> {
        self.store
            .select_by_id(message_id)
            .await
            .with_context(|| format!("failed to load message {message_id}"))?
            .map(Message::from)
            .ok_or(ChatError::NotFound(message_id))
    }

    async fn insert_located(&self, row: NewMessageRow) -> Result<Message, ChatError> {
        if !row.sos_location.is_some_and(|point| point.is_valid()) {
            return Err(ChatError::Validation(
                "location is outside valid coordinates".into(),
            ));
        }
        self.insert(row).await
    }

    async fn insert(&self, row: NewMessageRow) -> Result<Message, ChatError> {
        let group_id = row.group_id;
        let row = self
            .store
            .insert(row)
            .await
            .with_context(|| format!("failed to insert message into group {group_id}"))?;
        Ok(Message::from(row))
    }
}

fn new_row(
    group_id: GroupId,
    sender: &Identity,
    message_type: MessageKind,
    text: Option<String>,
) -> NewMessageRow {
    NewMessageRow {
        group_id,
        sender_id: sender.user_id,
        sender_name: sender.display_name.clone(),
        message_type,
        text,
        voice_url: None,
        voice_duration: None,
        mentions: Vec::new(),
        sos_location: None,
        sos_timestamp: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryMessageStore;

    fn repository() -> (ChatRepository, Arc<MemoryMessageStore>) {
        let store = Arc::new(MemoryMessageStore::new());
        (ChatRepository::new(store.clone()), store)
    }

    fn ana() -> Identity {
        Identity::new(UserId(1), "Ana")
    }

    fn ben() -> Identity {
        Identity::new(UserId(2), "Ben")
    }

    #[tokio::test]
    async fn send_returns_persisted_message() {
        let (repo, _store) = repository();
        let message = repo
            .send(GroupId(1), &ana(), &OutgoingMessage::text("hello"))
            .await
            .expect("send");
        assert!(message.persisted_id().is_some());
        assert_eq!(message.body.as_deref(), Some("hello"));
        assert_eq!(message.sender_name, "Ana");
    }

    #[tokio::test]
    async fn blank_text_is_rejected_before_the_store() {
        let (repo, store) = repository();
        let err = repo
            .send(GroupId(1), &ana(), &OutgoingMessage::text("  "))
            .await
            .expect_err("blank");
        assert!(matches!(err, ChatError::Validation(_)));
        assert!(store.rows(GroupId(1)).is_empty());
    }

    #[tokio::test]
    async fn voice_message_keeps_clip_and_optional_caption() {
        let (repo, _store) = repository();
        let message = repo
            .send(
                GroupId(1),
                &ana(),
                &OutgoingMessage::Voice {
                    url: "https://cdn.example/voice/1.m4a".into(),
                    duration_secs: Some(12),
                    caption: None,
                },
            )
            .await
            .expect("send voice");
        assert_eq!(message.kind, MessageKind::Voice);
        assert!(message.body.is_none());
        assert_eq!(message.voice.as_ref().and_then(|v| v.duration_secs), Some(12));
    }

    #[tokio::test]
    async fn sos_alert_embeds_link_and_location() {
        let (repo, _store) = repository();
        let message = repo
            .send_sos_alert(GroupId(1), &ana(), GeoPoint::new(48.8584, 2.2945))
            .await
            .expect("sos");
        assert!(message.is_sos());
        let body = message.body.as_deref().unwrap_or_default();
        assert!(body.contains("SOS ALERT from Ana"));
        assert!(body.contains("https://www.google.com/maps?q=48.858400,2.294500"));
        assert_eq!(
            message.location.map(|l| l.point),
            Some(GeoPoint::new(48.8584, 2.2945))
        );
    }

    #[tokio::test]
    async fn location_update_is_a_located_text_message() {
        let (repo, _store) = repository();
        let message = repo
            .send_location_update(GroupId(1), &ana(), GeoPoint::new(10.0, 20.0))
            .await
            .expect("location");
        assert!(message.is_location_update());
        assert!(!message.is_sos());
    }

    #[tokio::test]
    async fn invalid_coordinates_are_rejected() {
        let (repo, _store) = repository();
        let err = repo
            .send_sos_alert(GroupId(1), &ana(), GeoPoint::new(123.0, 0.0))
            .await
            .expect_err("invalid");
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn fetch_all_orders_by_creation_time() {
        let (repo, _store) = repository();
        for text in ["one", "two", "three"] {
            repo.send(GroupId(1), &ana(), &OutgoingMessage::text(text))
                .await
                .expect("send");
        }
        repo.send(GroupId(2), &ana(), &OutgoingMessage::text("elsewhere"))
            .await
            .expect("send");

        let bodies: Vec<String> = repo
            .fetch_all(GroupId(1))
            .await
            .expect("fetch")
            .into_iter()
            .filter_map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn only_the_sender_may_edit() {
        let (repo, _store) = repository();
        let sent = repo
            .send(GroupId(1), &ana(), &OutgoingMessage::text("typo"))
            .await
            .expect("send");
        let id = sent.persisted_id().expect("id");

        let err = repo
            .edit(id, "hijacked", ben().user_id)
            .await
            .expect_err("not the sender");
        assert!(err.is_permission_denied());

        let edited = repo.edit(id, "fixed", ana().user_id).await.expect("edit");
        assert!(edited.edited);
        assert_eq!(edited.body.as_deref(), Some("fixed"));
        assert!(edited.updated_at >= sent.updated_at);
    }

    #[tokio::test]
    async fn delete_requires_sender_unless_privileged() {
        let (repo, store) = repository();
        let sent = repo
            .send(GroupId(1), &ana(), &OutgoingMessage::text("bye"))
            .await
            .expect("send");
        let id = sent.persisted_id().expect("id");

        let err = repo
            .delete(id, ben().user_id, false)
            .await
            .expect_err("not the sender");
        assert!(err.is_permission_denied());
        assert_eq!(store.rows(GroupId(1)).len(), 1);

        repo.delete(id, ben().user_id, true)
            .await
            .expect("admin delete");
        assert!(store.rows(GroupId(1)).is_empty());
    }

    #[tokio::test]
    async fn editing_missing_message_is_not_found() {
        let (repo, _store) = repository();
        let err = repo
            .edit(MessageId(99), "x", ana().user_id)
            .await
            .expect_err("missing");
        assert!(matches!(err, ChatError::NotFound(MessageId(99))));
    }

    #[tokio::test]
    async fn store_failures_propagate_without_retry() {
        let (repo, store) = repository();
        store.fail_next_inserts(1);
        let err = repo
            .send(GroupId(1), &ana(), &OutgoingMessage::text("hello"))
            .await
            .expect_err("injected");
        assert!(matches!(err, ChatError::Store(_)));
        assert!(store.rows(GroupId(1)).is_empty());
    }
}
