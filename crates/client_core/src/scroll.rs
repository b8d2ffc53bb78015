//! Scroll-driven pagination triggers and anchor-based position restore.
//!
//! The engine does no rendering; the shell reports viewport geometry and row
//! layout, and gets back fetch decisions and target scroll offsets.

use std::collections::HashMap;

use shared::domain::{ChatKey, MessageId};
use tracing::debug;

/// Distance from the top edge under which backward pagination triggers.
pub(crate) const TOP_TRIGGER_PX: f32 = 200.0;
/// Distance from the bottom edge within which the view follows new messages.
pub(crate) const BOTTOM_STICKY_PX: f32 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub scroll_top: f32,
    pub viewport_height: f32,
    pub content_height: f32,
}

impl Viewport {
    pub fn distance_from_top(&self) -> f32 {
        self.scroll_top.max(0.0)
    }

    pub fn distance_from_bottom(&self) -> f32 {
        (self.content_height - self.viewport_height - self.scroll_top).max(0.0)
    }
}

/// One rendered message row: its id, top offset in content coordinates, and
/// height after layout.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageExtent {
    pub message_id: MessageId,
    pub top: f32,
    pub height: f32,
}

/// The topmost visible message and its pixel offset from the viewport's top
/// edge, captured before a prepend mutates the list.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrollAnchor {
    pub message_id: MessageId,
    pub offset_from_top: f32,
}

#[derive(Debug)]
struct ChatScrollState {
    near_bottom: bool,
}

impl Default for ChatScrollState {
    fn default() -> Self {
        // A chat opens scrolled to its latest message.
        Self { near_bottom: true }
    }
}

#[derive(Debug, Default)]
pub struct ScrollController {
    states: HashMap<ChatKey, ChatScrollState>,
}

impl ScrollController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the viewport after every scroll event; feeds bottom-stickiness.
    pub fn note_scroll(&mut self, chat: &ChatKey, viewport: Viewport) {
        let near_bottom = viewport.distance_from_bottom() <= BOTTOM_STICKY_PX;
        self.states
            .entry(chat.clone())
            .or_default()
            .near_bottom = near_bottom;
    }

    /// Whether this scroll position should trigger a backward page. Both
    /// guards are required: rapid scroll events must not stack fetches, and
    /// a fully loaded chat has nothing older to ask for.
    pub fn should_fetch_older(
        &self,
        viewport: Viewport,
        fetch_in_flight: bool,
        fully_loaded: bool,
    ) -> bool {
        if fetch_in_flight || fully_loaded {
            return false;
        }
        let trigger = viewport.distance_from_top() <= TOP_TRIGGER_PX;
        if trigger {
            debug!(
                distance = viewport.distance_from_top(),
                "scroll: backward page trigger"
            );
        }
        trigger
    }

    /// Auto-scroll on a new (non-paginated) message only when the user was
    /// already at the bottom; someone reading history is never yanked down.
    pub fn should_follow_new_message(&self, chat: &ChatKey) -> bool {
        self.states
            .get(chat)
            .map(|state| state.near_bottom)
            .unwrap_or(true)
    }

    pub fn clear(&mut self, chat: &ChatKey) {
        self.states.remove(chat);
    }
}

/// Capture the anchor before an asynchronous prepend mutates the list.
pub fn capture_anchor(viewport: Viewport, rows: &[MessageExtent]) -> Option<ScrollAnchor> {
    rows.iter()
        .find(|row| row.top + row.height > viewport.scroll_top)
        .map(|row| ScrollAnchor {
            message_id: row.message_id.clone(),
            offset_from_top: row.top - viewport.scroll_top,
        })
}

/// Locate the anchored message in the re-laid-out rows and return the scroll
/// offset that keeps it at the same pixel offset. Adjusting to the anchor
/// (rather than correcting by a height delta) stays correct when variable-
/// height content re-flows.
pub fn restore_anchor(anchor: &ScrollAnchor, rows: &[MessageExtent]) -> Option<f32> {
    rows.iter()
        .find(|row| row.message_id == anchor.message_id)
        .map(|row| (row.top - anchor.offset_from_top).max(0.0))
}

#[cfg(test)]
#[path = "tests/scroll_tests.rs"]
mod tests;
