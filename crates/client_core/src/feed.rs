use std::sync::{Arc, Mutex, MutexGuard};

use shared::{
    domain::{GroupId, MessageId},
    protocol::ChangeEvent,
};
use tracing::debug;

use crate::{
    overlay::OptimisticOverlay,
    types::{Message, TempId},
};

/// Receives the full ordered message list after every change.
///
/// Runs while the feed lock is held, which is what makes cancellation
/// deterministic. It must not call back into the same feed.
pub type DeliveryCallback = Arc<dyn Fn(&Delivery) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryTrigger {
    /// Full snapshot fetched when a subscription was (re)established.
    Snapshot,
    Poll,
    Inserted(MessageId),
    Updated(MessageId),
    Deleted(MessageId),
    Staged(TempId),
    RolledBack(TempId),
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub group_id: GroupId,
    /// Confirmed messages plus still-pending optimistic ones, oldest first.
    pub messages: Vec<Message>,
    pub trigger: DeliveryTrigger,
}

#[derive(Debug, Clone)]
pub enum FeedInput {
    Snapshot(Vec<Message>),
    Poll(Vec<Message>),
    Change(ChangeEvent),
}

struct FeedState {
    confirmed: Vec<Message>,
    overlay: OptimisticOverlay,
    callback: DeliveryCallback,
    cancelled: bool,
}

/// Per-group working snapshot shared by the realtime listener and the poller.
///
/// Both producers go through [`GroupFeed::apply`], which owns ordering and
/// de-duplication.
#[derive(Clone)]
pub struct GroupFeed {
    group_id: GroupId,
    state: Arc<Mutex<FeedState>>,
}

impl GroupFeed {
    pub fn new(group_id: GroupId, callback: DeliveryCallback) -> Self {
        Self {
            group_id,
            state: Arc::new(Mutex::new(FeedState {
                confirmed: Vec::new(),
                overlay: OptimisticOverlay::new(),
                callback,
                cancelled: false,
            })),
        }
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Applies one producer input. Returns whether a delivery was made.
    pub fn apply(&self, input: FeedInput) -> bool {
        let mut state = self.lock();
        if state.cancelled {
            return false;
        }

        let trigger = match input {
            FeedInput::Snapshot(messages) => {
                state.confirmed = self.accept(messages);
                DeliveryTrigger::Snapshot
            }
            FeedInput::Poll(messages) => {
                state.confirmed = self.accept(messages);
                DeliveryTrigger::Poll
            }
            FeedInput::Change(event) => {
                if event.group_id() != self.group_id {
                    debug!(
                        group_id = self.group_id.0,
                        event_group_id = event.group_id().0,
                        "ignoring change for another group"
                    );
                    return false;
                }
                match apply_change(&mut state.confirmed, event) {
                    Some(trigger) => trigger,
                    None => return false,
                }
            }
        };

        let confirmed = std::mem::take(&mut state.confirmed);
        state.overlay.reconcile(&confirmed);
        state.confirmed = confirmed;
        deliver(&state, self.group_id, trigger);
        true
    }

    /// Shows a temporary message until a matching confirmed one arrives.
    pub fn stage(&self, message: Message) -> Option<TempId> {
        let mut state = self.lock();
        if state.cancelled || message.group_id != self.group_id {
            return None;
        }
        let confirmed = std::mem::take(&mut state.confirmed);
        let staged = state.overlay.stage(message, &confirmed);
        state.confirmed = confirmed;
        let temp_id = staged?;
        deliver(&state, self.group_id, DeliveryTrigger::Staged(temp_id));
        Some(temp_id)
    }

    /// Withdraws a temporary message whose send failed.
    pub fn rollback(&self, temp_id: &TempId) -> bool {
        let mut state = self.lock();
        if state.cancelled || state.overlay.remove(temp_id).is_none() {
            return false;
        }
        deliver(&state, self.group_id, DeliveryTrigger::RolledBack(*temp_id));
        true
    }

    /// Stops all further deliveries. Once this returns no callback runs.
    pub fn cancel(&self) {
        let mut state = self.lock();
        state.cancelled = true;
        state.overlay.clear();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn messages(&self) -> Vec<Message> {
        displayed(&self.lock())
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.lock().overlay.len()
    }

    fn accept(&self, messages: Vec<Message>) -> Vec<Message> {
        let mut accepted: Vec<Message> = Vec::with_capacity(messages.len());
        for message in messages {
            if message.group_id != self.group_id || message.is_optimistic() {
                continue;
            }
            match accepted.iter_mut().find(|m| m.key == message.key) {
                Some(existing) => *existing = message,
                None => accepted.push(message),
            }
        }
        sort_messages(&mut accepted);
        accepted
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn apply_change(confirmed: &mut Vec<Message>, event: ChangeEvent) -> Option<DeliveryTrigger> {
    match event {
        ChangeEvent::Insert { row } => {
            let id = row.id;
            if confirmed.iter().any(|m| m.persisted_id() == Some(id)) {
                return None;
            }
            confirmed.push(Message::from(row));
            sort_messages(confirmed);
            Some(DeliveryTrigger::Inserted(id))
        }
        ChangeEvent::Update { row } => {
            let id = row.id;
            let existing = confirmed
                .iter_mut()
                .find(|m| m.persisted_id() == Some(id))?;
            *existing = Message::from(row);
            sort_messages(confirmed);
            Some(DeliveryTrigger::Updated(id))
        }
        ChangeEvent::Delete { id, .. } => {
            let idx = confirmed.iter().position(|m| m.persisted_id() == Some(id))?;
            confirmed.remove(idx);
            Some(DeliveryTrigger::Deleted(id))
        }
    }
}

fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.persisted_id().cmp(&b.persisted_id()))
    });
}

fn displayed(state: &FeedState) -> Vec<Message> {
    let mut messages = state.confirmed.clone();
    messages.extend(state.overlay.entries().cloned());
    // Stable: a pending entry sorts after confirmed ones with the same time.
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    messages
}

fn deliver(state: &FeedState, group_id: GroupId, trigger: DeliveryTrigger) {
    let delivery = Delivery {
        group_id,
        messages: displayed(state),
        trigger,
    };
    (state.callback)(&delivery);
}

#[cfg(test)]
#[path = "tests/feed_tests.rs"]
mod tests;
