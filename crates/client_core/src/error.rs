use shared::domain::{MessageId, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message store request failed: {0:#}")]
    Store(#[from] anyhow::Error),
    #[error("user {requester} is not allowed to modify message {message_id}")]
    PermissionDenied {
        message_id: MessageId,
        requester: UserId,
    },
    #[error("message {0} not found")]
    NotFound(MessageId),
    #[error("invalid message: {0}")]
    Validation(String),
    #[error("no signed-in identity")]
    NotSignedIn,
    #[error("no group is being viewed")]
    NoActiveGroup,
}

impl ChatError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, ChatError::PermissionDenied { .. })
    }
}
