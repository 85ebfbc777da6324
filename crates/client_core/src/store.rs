use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use shared::{
    domain::{GroupId, MessageId},
    protocol::{ChangeEvent, MessagePatch, MessageRow, NewMessageRow},
};

/// Deltas for one group. The stream ending means the subscription was lost.
pub type ChangeStream = BoxStream<'static, ChangeEvent>;

/// Row operations against the remote `group_chat_messages` table.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: NewMessageRow) -> Result<MessageRow>;
    /// Rows of one group ordered by `created_at` ascending.
    async fn select_by_group(&self, group_id: GroupId) -> Result<Vec<MessageRow>>;
    async fn select_by_id(&self, message_id: MessageId) -> Result<Option<MessageRow>>;
    async fn update(&self, message_id: MessageId, patch: MessagePatch) -> Result<MessageRow>;
    async fn delete(&self, message_id: MessageId) -> Result<()>;
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, group_id: GroupId) -> Result<ChangeStream>;
}
