use shared::{
    domain::{GroupId, MessageId, MessageKind},
    error::{ApiError, ErrorCode},
    protocol::{ChangeEvent, MessagePatch, MessageRow, NewMessageRow},
};
use storage::Storage;
use tracing::debug;

const MAX_TEXT_CHARS: usize = 4000;
const MAX_SENDER_NAME_CHARS: usize = 120;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

pub async fn list_messages(
    ctx: &ApiContext,
    group_id: GroupId,
) -> Result<Vec<MessageRow>, ApiError> {
    ctx.storage
        .list_group_messages(group_id)
        .await
        .map_err(internal)
}

pub async fn get_message(ctx: &ApiContext, message_id: MessageId) -> Result<MessageRow, ApiError> {
    ctx.storage
        .load_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(message_id))
}

pub async fn insert_message(
    ctx: &ApiContext,
    message: NewMessageRow,
) -> Result<(MessageRow, ChangeEvent), ApiError> {
    validate_new_message(&message)?;
    let row = ctx
        .storage
        .insert_message(&message)
        .await
        .map_err(internal)?;
    debug!(
        group_id = row.group_id.0,
        message_id = row.id.0,
        kind = row.message_type.as_str(),
        "message inserted"
    );
    Ok((row.clone(), ChangeEvent::Insert { row }))
}

pub async fn update_message(
    ctx: &ApiContext,
    message_id: MessageId,
    patch: MessagePatch,
) -> Result<(MessageRow, ChangeEvent), ApiError> {
    validate_text(&patch.text)?;
    let row = ctx
        .storage
        .update_message_text(message_id, &patch.text, patch.edited)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(message_id))?;
    Ok((row.clone(), ChangeEvent::Update { row }))
}

pub async fn delete_message(
    ctx: &ApiContext,
    message_id: MessageId,
) -> Result<ChangeEvent, ApiError> {
    let group_id = ctx
        .storage
        .delete_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(message_id))?;
    Ok(ChangeEvent::Delete {
        id: message_id,
        group_id,
    })
}

fn validate_new_message(message: &NewMessageRow) -> Result<(), ApiError> {
    let sender_name = message.sender_name.trim();
    if sender_name.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "sender_name is required"));
    }
    if sender_name.chars().count() > MAX_SENDER_NAME_CHARS {
        return Err(ApiError::new(ErrorCode::Validation, "sender_name is too long"));
    }

    match message.message_type {
        MessageKind::Text => {
            let text = message.text.as_deref().unwrap_or_default();
            validate_text(text)?;
        }
        MessageKind::Voice => {
            if message.voice_url.as_deref().map_or(true, |url| url.trim().is_empty()) {
                return Err(ApiError::new(
                    ErrorCode::Validation,
                    "voice messages require voice_url",
                ));
            }
        }
        MessageKind::Sos => {
            let Some(location) = message.sos_location else {
                return Err(ApiError::new(
                    ErrorCode::Validation,
                    "sos messages require sos_location",
                ));
            };
            if !location.is_valid() {
                return Err(ApiError::new(
                    ErrorCode::Validation,
                    "sos_location is out of range",
                ));
            }
        }
    }

    if let Some(location) = message.sos_location {
        if !location.is_valid() {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "sos_location is out of range",
            ));
        }
    }

    Ok(())
}

fn validate_text(text: &str) -> Result<(), ApiError> {
    if text.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "text cannot be empty"));
    }
    if text.chars().count() > MAX_TEXT_CHARS {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("text exceeds {MAX_TEXT_CHARS} characters"),
        ));
    }
    Ok(())
}

fn not_found(message_id: MessageId) -> ApiError {
    ApiError::new(
        ErrorCode::NotFound,
        format!("message {} not found", message_id.0),
    )
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::{GeoPoint, UserId};

    async fn setup() -> ApiContext {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        ApiContext { storage }
    }

    fn text(group_id: i64, body: &str) -> NewMessageRow {
        NewMessageRow {
            group_id: GroupId(group_id),
            sender_id: UserId(1),
            sender_name: "Ana".into(),
            message_type: MessageKind::Text,
            text: Some(body.into()),
            voice_url: None,
            voice_duration: None,
            mentions: Vec::new(),
            sos_location: None,
            sos_timestamp: None,
        }
    }

    #[tokio::test]
    async fn insert_emits_insert_event_for_the_row() {
        let ctx = setup().await;
        let (row, event) = insert_message(&ctx, text(4, "hi")).await.expect("insert");
        assert_eq!(event, ChangeEvent::Insert { row: row.clone() });
        assert_eq!(event.group_id(), GroupId(4));
    }

    #[tokio::test]
    async fn blank_text_is_rejected() {
        let ctx = setup().await;
        let err = insert_message(&ctx, text(4, "   "))
            .await
            .expect_err("should fail");
        assert_eq!(err.code, ErrorCode::Validation);
    }

    #[tokio::test]
    async fn sos_requires_valid_location() {
        let ctx = setup().await;
        let mut message = text(4, "help");
        message.message_type = MessageKind::Sos;
        let err = insert_message(&ctx, message.clone())
            .await
            .expect_err("missing location");
        assert_eq!(err.code, ErrorCode::Validation);

        message.sos_location = Some(GeoPoint::new(123.0, 0.0));
        let err = insert_message(&ctx, message)
            .await
            .expect_err("bad latitude");
        assert_eq!(err.code, ErrorCode::Validation);
    }

    #[tokio::test]
    async fn delete_of_missing_message_is_not_found() {
        let ctx = setup().await;
        let err = delete_message(&ctx, MessageId(77))
            .await
            .expect_err("should fail");
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn update_emits_update_event_with_edited_row() {
        let ctx = setup().await;
        let (row, _) = insert_message(&ctx, text(4, "draft")).await.expect("insert");
        let (updated, event) = update_message(
            &ctx,
            row.id,
            MessagePatch {
                text: "final".into(),
                edited: true,
            },
        )
        .await
        .expect("update");
        assert!(updated.edited);
        assert_eq!(event, ChangeEvent::Update { row: updated });
    }
}
