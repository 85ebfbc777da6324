use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use shared::domain::{GeoPoint, UserId};

use crate::types::Message;

pub fn format_alert_timestamp(at: DateTime<Utc>) -> String {
    at.format("%b %-d, %Y %H:%M:%S UTC").to_string()
}

/// Body stored with an SOS alert. It is the durable record of the alert, so
/// the link and the time are baked in at send time.
pub fn sos_body(sender_name: &str, location: GeoPoint, at: DateTime<Utc>) -> String {
    format!(
        "🚨 SOS ALERT from {sender_name}!\nLocation: {}\nTime: {}",
        location.map_link(),
        format_alert_timestamp(at)
    )
}

pub fn location_update_body(sender_name: &str, location: GeoPoint, at: DateTime<Utc>) -> String {
    format!(
        "📍 {sender_name} shared their location\nLocation: {}\nTime: {}",
        location.map_link(),
        format_alert_timestamp(at)
    )
}

/// Resolves `@Name` tokens against the group's members. Names may contain
/// spaces; the longest matching name wins and matching ignores case.
pub fn extract_mentions(text: &str, members: &[(UserId, String)]) -> Vec<UserId> {
    let mut candidates: Vec<&(UserId, String)> = members
        .iter()
        .filter(|(_, name)| !name.trim().is_empty())
        .collect();
    candidates.sort_by_key(|(_, name)| std::cmp::Reverse(name.chars().count()));

    let mut found = Vec::new();
    for (at, _) in text.match_indices('@') {
        let rest = &text[at + 1..];
        for (user_id, name) in &candidates {
            let Some(consumed) = strip_prefix_ignore_case(rest, name.trim()) else {
                continue;
            };
            let boundary = rest[consumed..]
                .chars()
                .next()
                .map_or(true, |c| !c.is_alphanumeric());
            if boundary {
                if !found.contains(user_id) {
                    found.push(*user_id);
                }
                break;
            }
        }
    }
    found
}

fn strip_prefix_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    let mut needle_chars = needle.chars().flat_map(char::to_lowercase).peekable();
    for (idx, c) in haystack.char_indices() {
        if needle_chars.peek().is_none() {
            return Some(idx);
        }
        for lower in c.to_lowercase() {
            if needle_chars.next() != Some(lower) {
                return None;
            }
        }
    }
    needle_chars.peek().is_none().then_some(haystack.len())
}

#[derive(Debug, Clone, PartialEq)]
pub struct DayBucket {
    pub date: NaiveDate,
    pub messages: Vec<Message>,
}

/// Splits an ordered message list into calendar days of the viewer's zone.
pub fn group_by_day<Tz: TimeZone>(messages: &[Message], tz: &Tz) -> Vec<DayBucket> {
    let mut buckets: Vec<DayBucket> = Vec::new();
    for message in messages {
        let date = message.created_at.with_timezone(tz).date_naive();
        match buckets.last_mut() {
            Some(bucket) if bucket.date == date => bucket.messages.push(message.clone()),
            _ => buckets.push(DayBucket {
                date,
                messages: vec![message.clone()],
            }),
        }
    }
    buckets
}
