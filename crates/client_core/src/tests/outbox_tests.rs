use chrono::{TimeZone, Utc};
use shared::domain::MessageId;

use super::*;

fn chat() -> ChatKey {
    ChatKey::new("telegram", "acct", "chat-1")
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn confirmed(text: &str, secs: i64) -> UnifiedMessage {
    UnifiedMessage {
        chat: chat(),
        message_id: MessageId::new("srv-1"),
        temp_id: None,
        text: text.to_string(),
        date: at(secs),
        direction: Direction::Outgoing,
        status: shared::domain::MessageStatus::Sent,
        media: None,
        views: None,
    }
}

#[test]
fn matches_within_window_in_fifo_order() {
    let mut outbox = Outbox::new();
    outbox.register(&chat(), "hello", LocalId::new("L1"), at(0));
    outbox.register(&chat(), "hello", LocalId::new("L2"), at(2));

    // Two identical texts in flight: confirmations drain front-first.
    assert_eq!(outbox.try_match(&confirmed("hello", 3)), Some(LocalId::new("L1")));
    assert_eq!(outbox.try_match(&confirmed("hello", 3)), Some(LocalId::new("L2")));
    assert_eq!(outbox.try_match(&confirmed("hello", 3)), None);
}

#[test]
fn no_match_outside_window() {
    let mut outbox = Outbox::new();
    outbox.register(&chat(), "hello", LocalId::new("L1"), at(0));

    assert_eq!(outbox.try_match(&confirmed("hello", 60)), None);
    // The entry stays for a confirmation that actually belongs to it.
    assert_eq!(outbox.try_match(&confirmed("hello", 3)), Some(LocalId::new("L1")));
}

#[test]
fn entry_never_matches_twice() {
    let mut outbox = Outbox::new();
    outbox.register(&chat(), "hello", LocalId::new("L1"), at(0));

    assert_eq!(outbox.try_match(&confirmed("hello", 1)), Some(LocalId::new("L1")));
    assert_eq!(outbox.try_match(&confirmed("hello", 1)), None);
    assert_eq!(outbox.pending(), 0);
}

#[test]
fn incoming_and_empty_texts_never_match() {
    let mut outbox = Outbox::new();
    outbox.register(&chat(), "hello", LocalId::new("L1"), at(0));
    outbox.register(&chat(), "", LocalId::new("L2"), at(0));

    let mut incoming = confirmed("hello", 1);
    incoming.direction = Direction::Incoming;
    assert_eq!(outbox.try_match(&incoming), None);

    assert_eq!(outbox.try_match(&confirmed("   ", 1)), None);
}

#[test]
fn whitespace_is_normalized_in_fingerprints() {
    let mut outbox = Outbox::new();
    outbox.register(&chat(), "hello   world", LocalId::new("L1"), at(0));

    assert_eq!(
        outbox.try_match(&confirmed("hello world", 1)),
        Some(LocalId::new("L1"))
    );
}

#[test]
fn discard_removes_only_the_given_entry() {
    let mut outbox = Outbox::new();
    outbox.register(&chat(), "hello", LocalId::new("L1"), at(0));
    outbox.register(&chat(), "hello", LocalId::new("L2"), at(1));

    outbox.discard(&chat(), "hello", &LocalId::new("L1"));
    assert_eq!(outbox.pending(), 1);
    assert_eq!(outbox.try_match(&confirmed("hello", 2)), Some(LocalId::new("L2")));
}

#[test]
fn clear_chat_drops_only_that_chat() {
    let other = ChatKey::new("vk", "acct", "chat-2");
    let mut outbox = Outbox::new();
    outbox.register(&chat(), "hello", LocalId::new("L1"), at(0));
    outbox.register(&other, "hello", LocalId::new("L2"), at(0));

    outbox.clear_chat(&chat());
    assert_eq!(outbox.pending(), 1);
    assert_eq!(outbox.try_match(&confirmed("hello", 1)), None);

    let mut other_confirmed = confirmed("hello", 1);
    other_confirmed.chat = other;
    assert_eq!(outbox.try_match(&other_confirmed), Some(LocalId::new("L2")));
}
