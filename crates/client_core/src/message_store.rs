//! Ordered, de-duplicated per-chat message lists with backward pagination.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::domain::{ChatKey, Direction, MessageId, MessageStatus, UnifiedMessage};
use shared::protocol::HistoryPage;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Page size requested from providers.
pub(crate) const HISTORY_PAGE_SIZE: u32 = 50;
/// Messages kept per chat after the chat is closed.
pub(crate) const RETAINED_ON_CLOSE: usize = 50;

/// Backward history fetch, one page at a time. `before` is the provider's
/// opaque cursor, or a message id when no cursor has been seen yet.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch_page(
        &self,
        chat: &ChatKey,
        limit: u32,
        before: Option<&str>,
    ) -> Result<HistoryPage>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationCursor {
    pub next_offset: Option<String>,
    pub fully_loaded: bool,
}

#[derive(Debug, Default)]
struct ChatEntry {
    messages: Vec<UnifiedMessage>,
    cursor: PaginationCursor,
    fetch_in_flight: bool,
    generation: u64,
    last_error: Option<String>,
}

#[derive(Default)]
struct StoreState {
    epoch: u64,
    chats: HashMap<ChatKey, ChatEntry>,
}

/// Sole owner of message lists and pagination cursors; previews and outbox
/// state live elsewhere and are updated through the shared event stream.
pub struct MessageStore {
    state: Mutex<StoreState>,
    source: Arc<dyn HistorySource>,
}

enum OlderPlan {
    Skip,
    Initial,
    Fetch { token: (u64, u64), before: Option<String> },
}

impl MessageStore {
    pub fn new(source: Arc<dyn HistorySource>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            source,
        }
    }

    /// Load the latest page for a chat. Single-flight per chat; merges with
    /// anything already present (a pushed message may have landed before the
    /// fetch resolved) de-duplicated by id. Returns whether the list changed.
    pub async fn fetch_initial(&self, chat: &ChatKey) -> Result<bool> {
        let token = {
            let mut state = self.state.lock().await;
            let epoch = state.epoch;
            let entry = state.chats.entry(chat.clone()).or_default();
            if entry.fetch_in_flight {
                debug!(chat = %chat, "store: initial fetch already in flight");
                return Ok(false);
            }
            entry.fetch_in_flight = true;
            entry.last_error = None;
            (epoch, entry.generation)
        };

        let outcome = self.source.fetch_page(chat, HISTORY_PAGE_SIZE, None).await;
        self.commit_page(chat, token, outcome, true).await
    }

    /// Load one more backward page. No-op while fully loaded or a fetch is
    /// in flight. Falls back to initial-fetch behavior when nothing is
    /// cached and no cursor exists yet.
    pub async fn fetch_older(&self, chat: &ChatKey) -> Result<bool> {
        let plan = {
            let mut state = self.state.lock().await;
            let epoch = state.epoch;
            let entry = state.chats.entry(chat.clone()).or_default();
            if entry.cursor.fully_loaded || entry.fetch_in_flight {
                OlderPlan::Skip
            } else if entry.messages.is_empty() && entry.cursor.next_offset.is_none() {
                OlderPlan::Initial
            } else {
                entry.fetch_in_flight = true;
                entry.last_error = None;
                let before = entry
                    .cursor
                    .next_offset
                    .clone()
                    .or_else(|| entry.messages.first().map(|m| m.message_id.0.clone()));
                OlderPlan::Fetch {
                    token: (epoch, entry.generation),
                    before,
                }
            }
        };

        match plan {
            OlderPlan::Skip => Ok(false),
            OlderPlan::Initial => self.fetch_initial(chat).await,
            OlderPlan::Fetch { token, before } => {
                let outcome = self
                    .source
                    .fetch_page(chat, HISTORY_PAGE_SIZE, before.as_deref())
                    .await;
                self.commit_page(chat, token, outcome, false).await
            }
        }
    }

    /// Merge the fetched page under the in-flight guard. Stale responses
    /// (chat cleared or store reset since the fetch started) are discarded
    /// without touching the guard of any newer fetch.
    async fn commit_page(
        &self,
        chat: &ChatKey,
        token: (u64, u64),
        outcome: Result<HistoryPage>,
        initial: bool,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.epoch != token.0 {
            debug!(chat = %chat, "store: dropping fetch result from torn-down session");
            return Ok(false);
        }
        let entry = state.chats.entry(chat.clone()).or_default();
        if entry.generation != token.1 {
            debug!(chat = %chat, "store: dropping stale fetch result");
            return Ok(false);
        }
        entry.fetch_in_flight = false;

        let page = match outcome {
            Ok(page) => page,
            Err(err) => {
                entry.last_error = Some(err.to_string());
                warn!(chat = %chat, error = %err, "store: history fetch failed");
                return Err(err);
            }
        };

        if !initial && page.messages.is_empty() {
            entry.cursor.fully_loaded = true;
            return Ok(false);
        }

        let short = (page.messages.len() as u32) < HISTORY_PAGE_SIZE;
        let mut changed = false;
        for message in page.messages {
            changed |= merge_into(&mut entry.messages, message);
        }
        entry.cursor.next_offset = page.next_cursor;
        if entry.cursor.next_offset.is_none() || (initial && short) {
            entry.cursor.fully_loaded = true;
        }
        Ok(changed)
    }

    /// Insert or update one message. Idempotent: re-applying an identical
    /// message leaves the list untouched. A `temp_id` match collapses the
    /// provisional entry and its confirmation into one slot.
    pub async fn add_or_update(&self, chat: &ChatKey, message: UnifiedMessage) -> bool {
        let mut state = self.state.lock().await;
        let entry = state.chats.entry(chat.clone()).or_default();
        merge_into(&mut entry.messages, message)
    }

    pub async fn remove(&self, chat: &ChatKey, message_id: &MessageId) -> bool {
        let mut state = self.state.lock().await;
        let Some(entry) = state.chats.get_mut(chat) else {
            return false;
        };
        let before = entry.messages.len();
        entry.messages.retain(|m| m.message_id != *message_id);
        entry.messages.len() != before
    }

    /// Outgoing messages acknowledged by a read receipt move to `Delivered`,
    /// up to the given id's date (or all of them when no id is carried).
    pub async fn mark_delivered(&self, chat: &ChatKey, up_to: Option<&MessageId>) -> bool {
        let mut state = self.state.lock().await;
        let Some(entry) = state.chats.get_mut(chat) else {
            return false;
        };
        let limit = up_to.and_then(|id| {
            entry
                .messages
                .iter()
                .find(|m| m.message_id == *id)
                .map(|m| m.date)
        });
        let mut changed = false;
        for message in entry.messages.iter_mut() {
            if message.direction != Direction::Outgoing || message.status != MessageStatus::Sent {
                continue;
            }
            if limit.is_some_and(|limit| message.date > limit) {
                continue;
            }
            message.status = MessageStatus::Delivered;
            changed = true;
        }
        changed
    }

    pub async fn apply_views(&self, chat: &ChatKey, message_id: &MessageId, views: u64) -> bool {
        let mut state = self.state.lock().await;
        let Some(message) = state
            .chats
            .get_mut(chat)
            .and_then(|entry| entry.messages.iter_mut().find(|m| m.message_id == *message_id))
        else {
            return false;
        };
        if message.views == Some(views) {
            return false;
        }
        message.views = Some(views);
        true
    }

    /// Called when a chat is closed: keep only the most recent retention
    /// window and forget the cursor, so reopening starts a fresh backward
    /// pagination from the provider's latest page. In-flight fetches for the
    /// chat become stale and their results are dropped.
    pub async fn clear(&self, chat: &ChatKey) {
        let mut state = self.state.lock().await;
        let Some(entry) = state.chats.get_mut(chat) else {
            return;
        };
        let len = entry.messages.len();
        if len > RETAINED_ON_CLOSE {
            entry.messages.drain(..len - RETAINED_ON_CLOSE);
        }
        entry.cursor = PaginationCursor::default();
        entry.generation += 1;
        entry.fetch_in_flight = false;
        entry.last_error = None;
    }

    /// Session teardown: everything goes, and any fetch still in flight is
    /// prevented from resurrecting state.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.epoch += 1;
        state.chats.clear();
    }

    pub async fn messages(&self, chat: &ChatKey) -> Vec<UnifiedMessage> {
        let state = self.state.lock().await;
        state
            .chats
            .get(chat)
            .map(|entry| entry.messages.clone())
            .unwrap_or_default()
    }

    pub async fn cursor(&self, chat: &ChatKey) -> PaginationCursor {
        let state = self.state.lock().await;
        state
            .chats
            .get(chat)
            .map(|entry| entry.cursor.clone())
            .unwrap_or_default()
    }

    pub async fn is_fetch_in_flight(&self, chat: &ChatKey) -> bool {
        let state = self.state.lock().await;
        state
            .chats
            .get(chat)
            .map(|entry| entry.fetch_in_flight)
            .unwrap_or(false)
    }

    pub async fn last_error(&self, chat: &ChatKey) -> Option<String> {
        let state = self.state.lock().await;
        state.chats.get(chat).and_then(|entry| entry.last_error.clone())
    }
}

/// Merge one message into a sorted list. Returns whether the list changed.
fn merge_into(messages: &mut Vec<UnifiedMessage>, incoming: UnifiedMessage) -> bool {
    if let Some(temp_id) = incoming.temp_id.as_ref() {
        if let Some(position) = messages
            .iter()
            .position(|m| m.temp_id.as_ref() == Some(temp_id))
        {
            if messages[position] == incoming {
                return false;
            }
            messages.remove(position);
            insert_sorted(messages, incoming);
            return true;
        }
    }
    if let Some(position) = messages
        .iter()
        .position(|m| m.message_id == incoming.message_id)
    {
        if messages[position] == incoming {
            return false;
        }
        messages.remove(position);
        insert_sorted(messages, incoming);
        return true;
    }
    insert_sorted(messages, incoming);
    true
}

fn insert_sorted(messages: &mut Vec<UnifiedMessage>, incoming: UnifiedMessage) {
    // Equal dates keep insertion order: the new entry lands after them.
    let position = messages.partition_point(|m| m.date <= incoming.date);
    messages.insert(position, incoming);
}

#[cfg(test)]
#[path = "tests/message_store_tests.rs"]
mod tests;
