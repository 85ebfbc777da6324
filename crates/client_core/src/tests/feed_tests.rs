use super::*;
use crate::types::{Identity, MessageKey, OutgoingMessage};
use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::{MessageKind, UserId},
    protocol::MessageRow,
};

fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-07-01T09:00:00Z")
        .expect("timestamp")
        .with_timezone(&Utc)
}

fn row(id: i64, group: i64, sender: i64, text: &str, offset_secs: i64) -> MessageRow {
    let at = base_time() + Duration::seconds(offset_secs);
    MessageRow {
        id: MessageId(id),
        group_id: GroupId(group),
        sender_id: UserId(sender),
        sender_name: format!("user-{sender}"),
        message_type: MessageKind::Text,
        text: Some(text.to_string()),
        voice_url: None,
        voice_duration: None,
        mentions: Vec::new(),
        edited: false,
        sos_location: None,
        sos_timestamp: None,
        created_at: at,
        updated_at: at,
    }
}

fn recording_feed(group: i64) -> (GroupFeed, Arc<Mutex<Vec<Delivery>>>) {
    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&deliveries);
    let callback: DeliveryCallback = Arc::new(move |delivery: &Delivery| {
        sink.lock().expect("sink").push(delivery.clone());
    });
    (GroupFeed::new(GroupId(group), callback), deliveries)
}

fn last(deliveries: &Arc<Mutex<Vec<Delivery>>>) -> Delivery {
    deliveries
        .lock()
        .expect("deliveries")
        .last()
        .cloned()
        .expect("at least one delivery")
}

fn count(deliveries: &Arc<Mutex<Vec<Delivery>>>) -> usize {
    deliveries.lock().expect("deliveries").len()
}

fn ids(delivery: &Delivery) -> Vec<MessageKey> {
    delivery.messages.iter().map(|m| m.key).collect()
}

#[test]
fn realtime_and_poll_delivery_of_same_message_yield_one_entry() {
    let (feed, deliveries) = recording_feed(1);
    let hello = row(42, 1, 7, "hello", 5);

    feed.apply(FeedInput::Snapshot(Vec::new()));
    feed.apply(FeedInput::Change(ChangeEvent::Insert { row: hello.clone() }));
    feed.apply(FeedInput::Poll(vec![Message::from(hello.clone())]));
    assert!(!feed.apply(FeedInput::Change(ChangeEvent::Insert { row: hello })));

    let delivered = last(&deliveries);
    assert_eq!(delivered.trigger, DeliveryTrigger::Poll);
    assert_eq!(ids(&delivered), vec![MessageKey::Persisted(MessageId(42))]);
}

#[test]
fn poll_before_realtime_also_yields_one_entry() {
    let (feed, deliveries) = recording_feed(1);
    let hello = row(42, 1, 7, "hello", 5);

    feed.apply(FeedInput::Poll(vec![Message::from(hello.clone())]));
    let before = count(&deliveries);
    assert!(!feed.apply(FeedInput::Change(ChangeEvent::Insert { row: hello })));
    assert_eq!(count(&deliveries), before);
    assert_eq!(feed.messages().len(), 1);
}

#[test]
fn confirmed_insert_replaces_optimistic_entry() {
    let (feed, deliveries) = recording_feed(1);
    let ana = Identity::new(UserId(7), "Ana");
    feed.apply(FeedInput::Snapshot(Vec::new()));

    let temp = Message::optimistic(
        GroupId(1),
        &ana,
        &OutgoingMessage::text("hello"),
        base_time(),
    );
    let temp_id = feed.stage(temp).expect("staged");
    let staged = last(&deliveries);
    assert_eq!(staged.trigger, DeliveryTrigger::Staged(temp_id));
    assert_eq!(ids(&staged), vec![MessageKey::Temporary(temp_id)]);

    feed.apply(FeedInput::Change(ChangeEvent::Insert {
        row: row(42, 1, 7, "hello", 1),
    }));
    let confirmed = last(&deliveries);
    assert_eq!(ids(&confirmed), vec![MessageKey::Persisted(MessageId(42))]);
    assert_eq!(feed.pending_count(), 0);
}

#[test]
fn poll_keeps_unmatched_optimistic_entries() {
    let (feed, _deliveries) = recording_feed(1);
    let ana = Identity::new(UserId(7), "Ana");
    let temp = Message::optimistic(
        GroupId(1),
        &ana,
        &OutgoingMessage::text("still sending"),
        base_time() + Duration::seconds(30),
    );
    let temp_id = feed.stage(temp).expect("staged");

    feed.apply(FeedInput::Poll(vec![Message::from(row(1, 1, 8, "older", 0))]));
    let keys: Vec<MessageKey> = feed.messages().iter().map(|m| m.key).collect();
    assert_eq!(
        keys,
        vec![
            MessageKey::Persisted(MessageId(1)),
            MessageKey::Temporary(temp_id)
        ]
    );
}

#[test]
fn rollback_removes_only_the_failed_entry() {
    let (feed, deliveries) = recording_feed(1);
    let ana = Identity::new(UserId(7), "Ana");
    let first = feed
        .stage(Message::optimistic(
            GroupId(1),
            &ana,
            &OutgoingMessage::text("one"),
            base_time(),
        ))
        .expect("first");
    let second = feed
        .stage(Message::optimistic(
            GroupId(1),
            &ana,
            &OutgoingMessage::text("two"),
            base_time() + Duration::seconds(1),
        ))
        .expect("second");

    assert!(feed.rollback(&first));
    assert!(!feed.rollback(&first));
    let delivered = last(&deliveries);
    assert_eq!(delivered.trigger, DeliveryTrigger::RolledBack(first));
    assert_eq!(ids(&delivered), vec![MessageKey::Temporary(second)]);
}

#[test]
fn deltas_keep_creation_order_regardless_of_arrival() {
    let (feed, deliveries) = recording_feed(1);
    feed.apply(FeedInput::Snapshot(vec![Message::from(row(1, 1, 7, "a", 0))]));
    feed.apply(FeedInput::Change(ChangeEvent::Insert {
        row: row(3, 1, 7, "c", 20),
    }));
    feed.apply(FeedInput::Change(ChangeEvent::Insert {
        row: row(2, 1, 8, "b", 10),
    }));

    let bodies: Vec<Option<String>> = last(&deliveries)
        .messages
        .iter()
        .map(|m| m.body.clone())
        .collect();
    assert_eq!(
        bodies,
        vec![Some("a".into()), Some("b".into()), Some("c".into())]
    );
}

#[test]
fn update_replaces_in_place_and_delete_removes() {
    let (feed, deliveries) = recording_feed(1);
    feed.apply(FeedInput::Snapshot(vec![
        Message::from(row(1, 1, 7, "first", 0)),
        Message::from(row(2, 1, 7, "second", 1)),
    ]));

    let mut edited = row(1, 1, 7, "first (edited)", 0);
    edited.edited = true;
    assert!(feed.apply(FeedInput::Change(ChangeEvent::Update { row: edited })));
    let after_update = last(&deliveries);
    assert_eq!(after_update.trigger, DeliveryTrigger::Updated(MessageId(1)));
    assert_eq!(
        after_update.messages[0].body.as_deref(),
        Some("first (edited)")
    );
    assert!(after_update.messages[0].edited);

    assert!(feed.apply(FeedInput::Change(ChangeEvent::Delete {
        id: MessageId(2),
        group_id: GroupId(1),
    })));
    assert_eq!(
        ids(&last(&deliveries)),
        vec![MessageKey::Persisted(MessageId(1))]
    );

    assert!(!feed.apply(FeedInput::Change(ChangeEvent::Delete {
        id: MessageId(2),
        group_id: GroupId(1),
    })));
}

#[test]
fn changes_for_other_groups_are_ignored() {
    let (feed, deliveries) = recording_feed(1);
    assert!(!feed.apply(FeedInput::Change(ChangeEvent::Insert {
        row: row(9, 2, 7, "elsewhere", 0),
    })));
    feed.apply(FeedInput::Poll(vec![Message::from(row(9, 2, 7, "elsewhere", 0))]));
    assert!(last(&deliveries).messages.is_empty());
}

#[test]
fn cancelled_feed_never_delivers_again() {
    let (feed, deliveries) = recording_feed(1);
    feed.apply(FeedInput::Snapshot(Vec::new()));
    let before = count(&deliveries);

    feed.cancel();
    assert!(feed.is_cancelled());
    assert!(!feed.apply(FeedInput::Change(ChangeEvent::Insert {
        row: row(1, 1, 7, "late", 0),
    })));
    assert!(!feed.apply(FeedInput::Poll(Vec::new())));
    let ana = Identity::new(UserId(7), "Ana");
    assert!(feed
        .stage(Message::optimistic(
            GroupId(1),
            &ana,
            &OutgoingMessage::text("late"),
            base_time(),
        ))
        .is_none());
    assert_eq!(count(&deliveries), before);
}
