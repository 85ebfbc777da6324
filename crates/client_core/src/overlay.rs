use std::collections::HashSet;

use shared::domain::MessageId;

use crate::types::{Message, TempId};

#[derive(Debug, Clone)]
struct PendingEntry {
    temp_id: TempId,
    message: Message,
    /// Confirmed messages with the same sender and body that already existed
    /// when this entry was staged. They can never confirm it.
    baseline: HashSet<MessageId>,
}

/// Messages shown before the store has confirmed them.
///
/// A pending entry is superseded by a confirmed message with the same sender
/// and body. Each confirmed message supersedes at most one pending entry, and
/// only if it was not already visible when the entry was staged, so repeating
/// an earlier message does not make the new placeholder vanish early.
#[derive(Debug, Clone, Default)]
pub struct OptimisticOverlay {
    pending: Vec<PendingEntry>,
    claimed: HashSet<MessageId>,
}

impl OptimisticOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a temporary message. Returns `None` for a message that already
    /// carries a store id.
    pub fn stage(&mut self, message: Message, confirmed: &[Message]) -> Option<TempId> {
        let temp_id = message.key.temporary()?;
        let baseline = confirmed
            .iter()
            .filter(|candidate| candidate.same_content(&message))
            .filter_map(Message::persisted_id)
            .collect();
        self.pending.push(PendingEntry {
            temp_id,
            message,
            baseline,
        });
        Some(temp_id)
    }

    pub fn remove(&mut self, temp_id: &TempId) -> Option<Message> {
        let idx = self
            .pending
            .iter()
            .position(|entry| entry.temp_id == *temp_id)?;
        Some(self.pending.remove(idx).message)
    }

    /// Drops every pending entry confirmed by `confirmed` and returns the ids
    /// of the dropped entries in staging order.
    pub fn reconcile(&mut self, confirmed: &[Message]) -> Vec<TempId> {
        let present: HashSet<MessageId> =
            confirmed.iter().filter_map(Message::persisted_id).collect();
        self.claimed.retain(|id| present.contains(id));

        let mut superseded = Vec::new();
        let claimed = &mut self.claimed;
        self.pending.retain(|entry| {
            let confirmation = confirmed.iter().find_map(|candidate| {
                let id = candidate.persisted_id()?;
                let eligible = candidate.same_content(&entry.message)
                    && !entry.baseline.contains(&id)
                    && !claimed.contains(&id);
                eligible.then_some(id)
            });
            match confirmation {
                Some(id) => {
                    claimed.insert(id);
                    superseded.push(entry.temp_id);
                    false
                }
                None => true,
            }
        });
        superseded
    }

    pub fn entries(&self) -> impl Iterator<Item = &Message> {
        self.pending.iter().map(|entry| &entry.message)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.claimed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Identity, MessageKey, OutgoingMessage};
    use chrono::{Duration, Utc};
    use shared::domain::{GroupId, UserId};

    fn ana() -> Identity {
        Identity::new(UserId(1), "Ana")
    }

    fn optimistic(text: &str) -> Message {
        Message::optimistic(GroupId(1), &ana(), &OutgoingMessage::text(text), Utc::now())
    }

    fn confirmed(id: i64, sender: i64, text: &str) -> Message {
        let mut message = optimistic(text);
        message.key = MessageKey::Persisted(MessageId(id));
        message.sender_id = UserId(sender);
        message.created_at = Utc::now() + Duration::milliseconds(id);
        message
    }

    #[test]
    fn matching_confirmation_removes_pending_entry() {
        let mut overlay = OptimisticOverlay::new();
        let temp = overlay.stage(optimistic("hello"), &[]).expect("staged");

        let removed = overlay.reconcile(&[confirmed(42, 1, "hello")]);
        assert_eq!(removed, vec![temp]);
        assert!(overlay.is_empty());
    }

    #[test]
    fn other_sender_or_body_does_not_confirm() {
        let mut overlay = OptimisticOverlay::new();
        overlay.stage(optimistic("hello"), &[]).expect("staged");

        let removed = overlay.reconcile(&[confirmed(42, 2, "hello"), confirmed(43, 1, "hello!")]);
        assert!(removed.is_empty());
        assert_eq!(overlay.len(), 1);
    }

    #[test]
    fn earlier_identical_message_does_not_confirm_a_repeat() {
        let history = vec![confirmed(10, 1, "ok")];
        let mut overlay = OptimisticOverlay::new();
        overlay.stage(optimistic("ok"), &history).expect("staged");

        assert!(overlay.reconcile(&history).is_empty());
        assert_eq!(overlay.len(), 1);

        let mut with_repeat = history.clone();
        with_repeat.push(confirmed(11, 1, "ok"));
        assert_eq!(overlay.reconcile(&with_repeat).len(), 1);
        assert!(overlay.is_empty());
    }

    #[test]
    fn one_confirmation_supersedes_one_entry() {
        let mut overlay = OptimisticOverlay::new();
        let first = overlay.stage(optimistic("ok"), &[]).expect("first");
        let second = overlay.stage(optimistic("ok"), &[]).expect("second");

        let snapshot = vec![confirmed(20, 1, "ok")];
        assert_eq!(overlay.reconcile(&snapshot), vec![first]);
        assert_eq!(overlay.reconcile(&snapshot), Vec::<TempId>::new());
        assert_eq!(overlay.len(), 1);

        let mut both = snapshot.clone();
        both.push(confirmed(21, 1, "ok"));
        assert_eq!(overlay.reconcile(&both), vec![second]);
    }

    #[test]
    fn persisted_messages_cannot_be_staged() {
        let mut overlay = OptimisticOverlay::new();
        assert!(overlay.stage(confirmed(5, 1, "hi"), &[]).is_none());
        assert!(overlay.is_empty());
    }

    #[test]
    fn remove_returns_the_staged_message() {
        let mut overlay = OptimisticOverlay::new();
        let message = optimistic("draft");
        let temp = overlay.stage(message.clone(), &[]).expect("staged");
        assert_eq!(overlay.remove(&temp), Some(message));
        assert_eq!(overlay.remove(&temp), None);
    }
}
