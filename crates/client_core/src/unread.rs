use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::domain::{GroupId, MessageId, UserId};

use crate::{
    feed::{Delivery, DeliveryTrigger},
    types::Message,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreadChange {
    pub group_id: GroupId,
    pub unread: usize,
    pub total: usize,
}

#[derive(Debug, Default)]
struct GroupUnread {
    known: HashSet<MessageId>,
    /// Set once the first full snapshot has been seen.
    primed: bool,
    last_read: Option<DateTime<Utc>>,
    latest_seen: Option<DateTime<Utc>>,
    unread: usize,
}

/// Per-group unread counters driven by feed deliveries.
///
/// A message counts when it comes from someone else and is newer than the
/// group's last-read marker. Groups without a marker count every foreign
/// message that arrives after the first snapshot.
#[derive(Debug, Default)]
pub struct UnreadTracker {
    current_user: Option<UserId>,
    viewed: Option<GroupId>,
    groups: HashMap<GroupId, GroupUnread>,
}

impl UnreadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_current_user(&mut self, user: Option<UserId>) {
        self.current_user = user;
    }

    pub fn marker(&self, group_id: GroupId) -> Option<DateTime<Utc>> {
        self.groups.get(&group_id).and_then(|g| g.last_read)
    }

    /// Loads a persisted marker. Never moves an existing marker backwards.
    pub fn set_marker(&mut self, group_id: GroupId, at: DateTime<Utc>) {
        let group = self.groups.entry(group_id).or_default();
        if group.last_read.map_or(true, |current| at > current) {
            group.last_read = Some(at);
        }
    }

    pub fn unread(&self, group_id: GroupId) -> usize {
        self.groups.get(&group_id).map_or(0, |g| g.unread)
    }

    pub fn total(&self) -> usize {
        self.groups
            .iter()
            .filter(|(group_id, _)| Some(**group_id) != self.viewed)
            .map(|(_, group)| group.unread)
            .sum()
    }

    /// Marks `group_id` as viewed: its count drops to zero and the marker
    /// moves to the newest message seen so far. Returns the change and the
    /// marker worth persisting.
    pub fn mark_viewed(&mut self, group_id: GroupId) -> (UnreadChange, Option<DateTime<Utc>>) {
        self.viewed = Some(group_id);
        let group = self.groups.entry(group_id).or_default();
        group.unread = 0;
        if let Some(latest) = group.latest_seen {
            if group.last_read.map_or(true, |current| latest > current) {
                group.last_read = Some(latest);
            }
        }
        let marker = group.last_read;
        (self.change(group_id), marker)
    }

    /// Stops treating the viewed group as read. Returns the group and its
    /// final marker.
    pub fn leave_view(&mut self) -> Option<(GroupId, Option<DateTime<Utc>>)> {
        let group_id = self.viewed.take()?;
        Some((group_id, self.marker(group_id)))
    }

    pub fn record_delivery(&mut self, delivery: &Delivery) -> Option<UnreadChange> {
        let group_id = delivery.group_id;
        let viewed = self.viewed == Some(group_id);
        let current_user = self.current_user;
        let group = self.groups.entry(group_id).or_default();

        if let Some(latest) = delivery
            .messages
            .iter()
            .filter(|m| !m.is_optimistic())
            .map(|m| m.created_at)
            .max()
        {
            if group.latest_seen.map_or(true, |seen| latest > seen) {
                group.latest_seen = Some(latest);
            }
        }

        if viewed {
            for message in &delivery.messages {
                if let Some(id) = message.persisted_id() {
                    group.known.insert(id);
                }
            }
            group.primed = true;
            group.unread = 0;
            if group.latest_seen > group.last_read {
                group.last_read = group.latest_seen;
            }
            return None;
        }

        let before = group.unread;
        match &delivery.trigger {
            DeliveryTrigger::Inserted(id) => {
                if group.known.insert(*id) {
                    let counts = delivery
                        .messages
                        .iter()
                        .find(|m| m.persisted_id() == Some(*id))
                        .is_some_and(|m| counts_as_unread(m, current_user, group.last_read));
                    if counts {
                        group.unread += 1;
                    }
                }
            }
            DeliveryTrigger::Snapshot | DeliveryTrigger::Poll => {
                // Without a marker the first snapshot is history, not news.
                let count_new = group.primed || group.last_read.is_some();
                for message in &delivery.messages {
                    let Some(id) = message.persisted_id() else {
                        continue;
                    };
                    if group.known.insert(id)
                        && count_new
                        && counts_as_unread(message, current_user, group.last_read)
                    {
                        group.unread += 1;
                    }
                }
                group.primed = true;
            }
            DeliveryTrigger::Updated(_)
            | DeliveryTrigger::Deleted(_)
            | DeliveryTrigger::Staged(_)
            | DeliveryTrigger::RolledBack(_) => {}
        }

        (group.unread != before).then(|| self.change(group_id))
    }

    /// Forgets every group not in `groups`.
    pub fn retain_groups(&mut self, groups: &[GroupId]) {
        self.groups.retain(|group_id, _| groups.contains(group_id));
        if self.viewed.is_some_and(|viewed| !groups.contains(&viewed)) {
            self.viewed = None;
        }
    }

    pub fn reset(&mut self) {
        self.viewed = None;
        self.groups.clear();
    }

    fn change(&self, group_id: GroupId) -> UnreadChange {
        UnreadChange {
            group_id,
            unread: self.unread(group_id),
            total: self.total(),
        }
    }
}

fn counts_as_unread(
    message: &Message,
    current_user: Option<UserId>,
    last_read: Option<DateTime<Utc>>,
) -> bool {
    if current_user == Some(message.sender_id) {
        return false;
    }
    last_read.map_or(true, |marker| message.created_at > marker)
}
