use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use shared::{
    domain::{GroupId, MessageId},
    protocol::{ChangeEvent, MessagePatch, MessageRow, NewMessageRow},
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::warn;

use crate::store::{ChangeFeed, ChangeStream, MessageStore};

const EVENT_BUFFER: usize = 256;

#[derive(Default)]
struct MemoryState {
    rows: Vec<MessageRow>,
    next_id: i64,
    last_created_at: Option<DateTime<Utc>>,
    failing_fetches: usize,
    failing_inserts: usize,
    failing_subscribes: usize,
    fetches: usize,
}

/// Process-local message table with its own change feed.
///
/// Used for offline sessions and for exercising the sync core. Failures can
/// be injected per operation to reproduce flaky backends.
pub struct MemoryMessageStore {
    state: Mutex<MemoryState>,
    events: Mutex<broadcast::Sender<ChangeEvent>>,
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: Mutex::new(MemoryState {
                next_id: 1,
                ..MemoryState::default()
            }),
            events: Mutex::new(events),
        }
    }

    pub fn fail_next_fetches(&self, count: usize) {
        self.state().failing_fetches = count;
    }

    pub fn fail_next_inserts(&self, count: usize) {
        self.state().failing_inserts = count;
    }

    pub fn fail_next_subscribes(&self, count: usize) {
        self.state().failing_subscribes = count;
    }

    /// Number of `select_by_group` calls seen so far, failed ones included.
    pub fn fetch_count(&self) -> usize {
        self.state().fetches
    }

    /// Persists a row without publishing a change event, as if the push
    /// channel had dropped it.
    pub fn insert_silently(&self, message: NewMessageRow) -> MessageRow {
        self.state().insert(message)
    }

    /// Publishes an arbitrary event to current subscribers.
    pub fn emit(&self, event: ChangeEvent) {
        let _ = self.sender().send(event);
    }

    /// Ends every open change stream. Later subscriptions work normally.
    pub fn disconnect_subscribers(&self) {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        *self.sender() = events;
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender().receiver_count()
    }

    pub fn rows(&self, group_id: GroupId) -> Vec<MessageRow> {
        self.state().group_rows(group_id)
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sender(&self) -> MutexGuard<'_, broadcast::Sender<ChangeEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MemoryState {
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_created_at {
            if now <= last {
                now = last + Duration::milliseconds(1);
            }
        }
        self.last_created_at = Some(now);
        now
    }

    fn insert(&mut self, message: NewMessageRow) -> MessageRow {
        let created_at = self.next_timestamp();
        let row = MessageRow {
            id: MessageId(self.next_id),
            group_id: message.group_id,
            sender_id: message.sender_id,
            sender_name: message.sender_name,
            message_type: message.message_type,
            text: message.text,
            voice_url: message.voice_url,
            voice_duration: message.voice_duration,
            mentions: message.mentions,
            edited: false,
            sos_location: message.sos_location,
            sos_timestamp: message.sos_timestamp,
            created_at,
            updated_at: created_at,
        };
        self.next_id += 1;
        self.rows.push(row.clone());
        row
    }

    fn group_rows(&self, group_id: GroupId) -> Vec<MessageRow> {
        let mut rows: Vec<MessageRow> = self
            .rows
            .iter()
            .filter(|row| row.group_id == group_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rows
    }

    fn take_failure(counter: &mut usize) -> bool {
        if *counter == 0 {
            return false;
        }
        *counter -= 1;
        true
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, message: NewMessageRow) -> Result<MessageRow> {
        let row = {
            let mut state = self.state();
            if MemoryState::take_failure(&mut state.failing_inserts) {
                bail!("injected insert failure");
            }
            state.insert(message)
        };
        self.emit(ChangeEvent::Insert { row: row.clone() });
        Ok(row)
    }

    async fn select_by_group(&self, group_id: GroupId) -> Result<Vec<MessageRow>> {
        let mut state = self.state();
        state.fetches += 1;
        if MemoryState::take_failure(&mut state.failing_fetches) {
            bail!("injected fetch failure");
        }
        Ok(state.group_rows(group_id))
    }

    async fn select_by_id(&self, message_id: MessageId) -> Result<Option<MessageRow>> {
        Ok(self
            .state()
            .rows
            .iter()
            .find(|row| row.id == message_id)
            .cloned())
    }

    async fn update(&self, message_id: MessageId, patch: MessagePatch) -> Result<MessageRow> {
        let row = {
            let mut state = self.state();
            let now = state.next_timestamp();
            let row = state
                .rows
                .iter_mut()
                .find(|row| row.id == message_id)
                .ok_or_else(|| anyhow!("message {message_id} not found"))?;
            row.text = Some(patch.text);
            row.edited = patch.edited;
            row.updated_at = now;
            row.clone()
        };
        self.emit(ChangeEvent::Update { row: row.clone() });
        Ok(row)
    }

    async fn delete(&self, message_id: MessageId) -> Result<()> {
        let group_id = {
            let mut state = self.state();
            let idx = state
                .rows
                .iter()
                .position(|row| row.id == message_id)
                .ok_or_else(|| anyhow!("message {message_id} not found"))?;
            state.rows.remove(idx).group_id
        };
        self.emit(ChangeEvent::Delete {
            id: message_id,
            group_id,
        });
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MemoryMessageStore {
    async fn subscribe(&self, group_id: GroupId) -> Result<ChangeStream> {
        if MemoryState::take_failure(&mut self.state().failing_subscribes) {
            bail!("injected subscribe failure");
        }
        let receiver = self.sender().subscribe();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| {
            let event = match item {
                Ok(event) if event.group_id() == group_id => Some(event),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(group_id = group_id.0, skipped, "change feed lagged");
                    None
                }
            };
            futures::future::ready(event)
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::{MessageKind, UserId};

    fn text(group: i64, body: &str) -> NewMessageRow {
        NewMessageRow {
            group_id: GroupId(group),
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
    async fn created_at_is_strictly_increasing() {
        let store = MemoryMessageStore::new();
        let first = store.insert(text(1, "a")).await.expect("a");
        let second = store.insert(text(1, "b")).await.expect("b");
        assert!(second.created_at > first.created_at);
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn subscription_only_sees_its_group() {
        let store = MemoryMessageStore::new();
        let mut stream = store.subscribe(GroupId(1)).await.expect("subscribe");
        store.insert(text(2, "other")).await.expect("other");
        let row = store.insert(text(1, "mine")).await.expect("mine");

        let event = stream.next().await.expect("event");
        assert_eq!(event, ChangeEvent::Insert { row });
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_once() {
        let store = MemoryMessageStore::new();
        store.fail_next_fetches(1);
        assert!(store.select_by_group(GroupId(1)).await.is_err());
        assert!(store.select_by_group(GroupId(1)).await.is_ok());
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn disconnect_ends_open_streams() {
        let store = MemoryMessageStore::new();
        let mut stream = store.subscribe(GroupId(1)).await.expect("subscribe");
        store.disconnect_subscribers();
        assert!(stream.next().await.is_none());
        assert_eq!(store.subscriber_count(), 0);
    }
}
