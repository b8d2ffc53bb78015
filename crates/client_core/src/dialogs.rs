//! Chat-preview registry fed by the same event stream as the message store.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use shared::domain::{AccountId, ChatKey, ChatPreview, Direction, Platform, UnifiedMessage};
use shared::protocol::{DialogPage, PushEvent};
use tokio::sync::Mutex;
use tracing::debug;

/// Page size for dialog-list fetches.
pub(crate) const DIALOG_PAGE_SIZE: u32 = 40;
/// A typer with no fresh start event for this long is dropped, so a lost
/// stop signal cannot leave a stuck indicator.
pub(crate) const TYPING_IDLE_SECS: i64 = 6;

/// Paginated chat-preview fetch for one account.
#[async_trait]
pub trait DialogSource: Send + Sync {
    async fn fetch_dialogs(
        &self,
        platform: &Platform,
        account_id: &AccountId,
        limit: u32,
        offset: Option<&str>,
    ) -> Result<DialogPage>;
}

#[derive(Debug)]
struct DialogEntry {
    preview: ChatPreview,
    typing: HashMap<String, DateTime<Utc>>,
    shadow: bool,
}

impl DialogEntry {
    fn shadow(chat: &ChatKey) -> Self {
        Self {
            preview: ChatPreview::shadow(chat),
            typing: HashMap::new(),
            shadow: true,
        }
    }
}

#[derive(Default)]
struct AggregatorState {
    dialogs: HashMap<ChatKey, DialogEntry>,
    account_online: HashMap<(Platform, AccountId), bool>,
}

/// Sole owner of preview records. Message lists live in the store; the two
/// stay consistent because both fold the same event stream.
pub struct DialogAggregator {
    state: Mutex<AggregatorState>,
    source: Arc<dyn DialogSource>,
}

impl DialogAggregator {
    pub fn new(source: Arc<dyn DialogSource>) -> Self {
        Self {
            state: Mutex::new(AggregatorState::default()),
            source,
        }
    }

    pub async fn apply(&self, event: &PushEvent) {
        self.apply_at(event, Utc::now()).await;
    }

    async fn apply_at(&self, event: &PushEvent, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        match event {
            PushEvent::NewMessage { message } => {
                let entry = entry_mut(&mut state, &message.chat);
                // A replay of the latest message must not double-count.
                let replay = entry
                    .preview
                    .last_message
                    .as_ref()
                    .is_some_and(|m| m.message_id == message.message_id);
                if message.direction == Direction::Incoming && !replay {
                    entry.preview.unread_count += 1;
                }
                update_last_message(entry, message);
            }
            PushEvent::MessageConfirmed { message } => {
                let entry = entry_mut(&mut state, &message.chat);
                update_last_message(entry, message);
            }
            PushEvent::MessageEdited { message } => {
                let entry = entry_mut(&mut state, &message.chat);
                let replaces = entry
                    .preview
                    .last_message
                    .as_ref()
                    .is_some_and(|m| m.message_id == message.message_id);
                if replaces {
                    entry.preview.last_message = Some(message.clone());
                }
            }
            PushEvent::MessageDeleted { chat, message_id } => {
                let entry = entry_mut(&mut state, chat);
                let snapshot_gone = entry
                    .preview
                    .last_message
                    .as_ref()
                    .is_some_and(|m| m.message_id == *message_id);
                if snapshot_gone {
                    // The denormalized snapshot is gone; the store still has
                    // the remaining list, a later event repopulates this.
                    entry.preview.last_message = None;
                }
            }
            PushEvent::ReadReceipt { chat, .. } => {
                let entry = entry_mut(&mut state, chat);
                entry.preview.unread_count = 0;
            }
            PushEvent::TypingStart { chat, user } => {
                let entry = entry_mut(&mut state, chat);
                entry
                    .typing
                    .insert(user.clone(), now + Duration::seconds(TYPING_IDLE_SECS));
            }
            PushEvent::TypingStop { chat, user } => {
                let entry = entry_mut(&mut state, chat);
                entry.typing.remove(user);
            }
            PushEvent::AccountStatus {
                platform,
                account_id,
                online,
            } => {
                state
                    .account_online
                    .insert((platform.clone(), account_id.clone()), *online);
            }
            PushEvent::PinChanged { chat, pinned } => {
                let entry = entry_mut(&mut state, chat);
                entry.preview.pinned = *pinned;
            }
            PushEvent::ViewCount {
                chat,
                message_id,
                views,
            } => {
                let entry = entry_mut(&mut state, chat);
                if let Some(last) = entry.preview.last_message.as_mut() {
                    if last.message_id == *message_id {
                        last.views = Some(*views);
                    }
                }
            }
        }
    }

    /// Local read action: reset immediately rather than waiting for the
    /// provider's read-receipt echo. Scroll position alone never does this.
    pub async fn mark_read(&self, chat: &ChatKey) -> bool {
        let mut state = self.state.lock().await;
        match state.dialogs.get_mut(chat) {
            Some(entry) if entry.preview.unread_count != 0 => {
                entry.preview.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    /// Fetch one dialog page and fold it in. Fetched records enrich shadow
    /// previews; a last-message snapshot already ahead of the fetched one
    /// (push outran REST) is kept, and locally counted unread is never lost.
    pub async fn fetch_page(
        &self,
        platform: &Platform,
        account_id: &AccountId,
        offset: Option<&str>,
    ) -> Result<(Vec<ChatKey>, Option<String>)> {
        let page = self
            .source
            .fetch_dialogs(platform, account_id, DIALOG_PAGE_SIZE, offset)
            .await?;

        let mut state = self.state.lock().await;
        let mut changed = Vec::with_capacity(page.dialogs.len());
        for fetched in page.dialogs {
            let chat = fetched.chat.clone();
            let entry = entry_mut(&mut state, &chat);
            entry.preview.title = fetched.title;
            entry.preview.pinned = fetched.pinned;
            entry.preview.unread_count = entry.preview.unread_count.max(fetched.unread_count);
            let keep_local = match (&entry.preview.last_message, &fetched.last_message) {
                (Some(local), Some(remote)) => local.date >= remote.date,
                (Some(_), None) => true,
                _ => false,
            };
            if !keep_local {
                entry.preview.last_message = fetched.last_message;
            }
            if entry.shadow {
                debug!(chat = %chat, "dialogs: shadow preview enriched");
                entry.shadow = false;
            }
            changed.push(chat);
        }
        Ok((changed, page.next_offset))
    }

    pub async fn preview(&self, chat: &ChatKey) -> Option<ChatPreview> {
        let state = self.state.lock().await;
        state.dialogs.get(chat).map(|entry| entry.preview.clone())
    }

    /// Chat-list order: pinned first, then most recent activity.
    pub async fn previews(&self) -> Vec<ChatPreview> {
        let state = self.state.lock().await;
        let mut list: Vec<ChatPreview> = state
            .dialogs
            .values()
            .map(|entry| entry.preview.clone())
            .collect();
        list.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then_with(|| {
                    let a_date = a.last_message.as_ref().map(|m| m.date);
                    let b_date = b.last_message.as_ref().map(|m| m.date);
                    b_date.cmp(&a_date)
                })
                .then_with(|| a.title.cmp(&b.title))
        });
        list
    }

    pub async fn typists(&self, chat: &ChatKey) -> Vec<String> {
        self.typists_at(chat, Utc::now()).await
    }

    async fn typists_at(&self, chat: &ChatKey, now: DateTime<Utc>) -> Vec<String> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.dialogs.get_mut(chat) else {
            return Vec::new();
        };
        entry.typing.retain(|_, deadline| *deadline > now);
        let mut names: Vec<String> = entry.typing.keys().cloned().collect();
        names.sort();
        names
    }

    /// Periodic sweep; returns the chats whose typing set changed so the
    /// client can notify subscribers.
    pub async fn sweep_expired(&self) -> Vec<ChatKey> {
        self.sweep_expired_at(Utc::now()).await
    }

    async fn sweep_expired_at(&self, now: DateTime<Utc>) -> Vec<ChatKey> {
        let mut state = self.state.lock().await;
        let mut changed = Vec::new();
        for (chat, entry) in state.dialogs.iter_mut() {
            let before = entry.typing.len();
            entry.typing.retain(|_, deadline| *deadline > now);
            if entry.typing.len() != before {
                changed.push(chat.clone());
            }
        }
        changed
    }

    pub async fn account_online(&self, platform: &Platform, account_id: &AccountId) -> Option<bool> {
        let state = self.state.lock().await;
        state
            .account_online
            .get(&(platform.clone(), account_id.clone()))
            .copied()
    }

    /// Session teardown is the only way preview records are destroyed.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.dialogs.clear();
        state.account_online.clear();
    }
}

fn entry_mut<'a>(state: &'a mut AggregatorState, chat: &ChatKey) -> &'a mut DialogEntry {
    state
        .dialogs
        .entry(chat.clone())
        .or_insert_with(|| DialogEntry::shadow(chat))
}

fn update_last_message(entry: &mut DialogEntry, message: &UnifiedMessage) {
    let newer = entry
        .preview
        .last_message
        .as_ref()
        .map_or(true, |m| message.date >= m.date);
    if newer {
        entry.preview.last_message = Some(message.clone());
    }
}

#[cfg(test)]
#[path = "tests/dialogs_tests.rs"]
mod tests;
