//! Optimistic-send tracking and reconciliation against confirmations.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use shared::domain::{ChatKey, Direction, LocalId, UnifiedMessage};
use tracing::debug;

/// How far apart a provisional send and its confirmation may sit and still
/// be the same logical message. Providers rarely echo the client timestamp
/// exactly; the window tolerates clock and latency skew without
/// cross-matching identical texts sent far apart.
pub(crate) const MATCH_WINDOW_SECS: i64 = 10;

#[derive(Debug, Clone)]
struct OutboxEntry {
    local_id: LocalId,
    created_at: DateTime<Utc>,
}

/// Pending sends keyed by `(chat, normalized text)` fingerprint. Each
/// fingerprint holds a FIFO queue, so several in-flight sends with identical
/// text stay distinguishable.
#[derive(Debug, Default)]
pub struct Outbox {
    entries: HashMap<String, VecDeque<OutboxEntry>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        chat: &ChatKey,
        text: &str,
        local_id: LocalId,
        created_at: DateTime<Utc>,
    ) {
        self.entries
            .entry(fingerprint(chat, text))
            .or_default()
            .push_back(OutboxEntry {
                local_id,
                created_at,
            });
    }

    /// Reconcile a confirmed message against pending sends. The first queue
    /// entry inside the match window wins and is removed, so no entry ever
    /// matches twice. `None` means the message arrived independently and the
    /// caller should append it as-is.
    pub fn try_match(&mut self, confirmed: &UnifiedMessage) -> Option<LocalId> {
        if confirmed.direction != Direction::Outgoing || confirmed.text.trim().is_empty() {
            return None;
        }
        let key = fingerprint(&confirmed.chat, &confirmed.text);
        let queue = self.entries.get_mut(&key)?;
        let window = Duration::seconds(MATCH_WINDOW_SECS);
        let position = queue
            .iter()
            .position(|entry| (confirmed.date - entry.created_at).abs() <= window)?;
        let entry = queue.remove(position)?;
        if queue.is_empty() {
            self.entries.remove(&key);
        }
        debug!(chat = %confirmed.chat, local_id = %entry.local_id, "outbox: matched confirmation");
        Some(entry.local_id)
    }

    /// Rollback path: the send itself failed, so the entry must not linger
    /// and swallow an unrelated later confirmation.
    pub fn discard(&mut self, chat: &ChatKey, text: &str, local_id: &LocalId) {
        let key = fingerprint(chat, text);
        if let Some(queue) = self.entries.get_mut(&key) {
            queue.retain(|entry| entry.local_id != *local_id);
            if queue.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    /// Drop every pending entry for a closed chat; late confirmations then
    /// arrive as independent messages instead of matching stale sends.
    pub fn clear_chat(&mut self, chat: &ChatKey) {
        let prefix = format!("{chat}\n");
        self.entries.retain(|key, _| !key.starts_with(&prefix));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn pending(&self) -> usize {
        self.entries.values().map(VecDeque::len).sum()
    }
}

fn fingerprint(chat: &ChatKey, text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("{chat}\n{normalized}")
}

#[cfg(test)]
#[path = "tests/outbox_tests.rs"]
mod tests;
