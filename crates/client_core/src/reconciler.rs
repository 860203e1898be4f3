use std::collections::HashSet;

use shared::{domain::MessageId, protocol::Message};
use tracing::debug;

/// Messages per history page. A shorter page means the room has no older
/// messages left.
pub const HISTORY_PAGE_SIZE: usize = 20;

/// Distance from the bottom edge, in the caller's units, still treated as
/// "at the bottom".
const BOTTOM_TOLERANCE: f64 = 1.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryCursor {
    pub exhausted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrollAnchor {
    pub pinned_to_bottom: bool,
    /// Newest message that arrived while the view was scrolled away.
    pub pending_unread: Option<Message>,
}

impl Default for ScrollAnchor {
    fn default() -> Self {
        Self {
            pinned_to_bottom: true,
            pending_unread: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollPosition {
    pub top: f64,
    pub viewport_height: f64,
    pub content_height: f64,
}

impl ScrollPosition {
    pub fn at_bottom(&self) -> bool {
        self.top + self.viewport_height >= self.content_height - BOTTOM_TOLERANCE
    }
}

/// What the presentation layer has to do after a view mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEffect {
    None,
    ScrollToBottom,
    /// Older content was inserted above; keep `anchor` where it was on screen.
    PreserveOffset { anchor: Option<MessageId> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// First page after a (re)connect.
    Initial,
    More,
}

/// The message view of one connection generation: paged history in front,
/// live arrivals behind, plus the scroll bookkeeping that goes with it.
///
/// Messages are deduplicated by id, so a message that arrives both live and
/// inside a later history page is shown once, at its first position.
#[derive(Debug, Default)]
pub struct Reconciler {
    messages: Vec<Message>,
    seen: HashSet<MessageId>,
    cursor: HistoryCursor,
    anchor: ScrollAnchor,
    fetch_in_flight: bool,
    initial_loaded: bool,
    initial_failed: bool,
    last_scroll_top: Option<f64>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_live(&mut self, message: Message) -> ViewEffect {
        if !self.seen.insert(message.id.clone()) {
            debug!(message_id = %message.id, "dropping duplicate live message");
            return ViewEffect::None;
        }
        self.messages.push(message);

        if self.anchor.pinned_to_bottom {
            self.anchor.pending_unread = None;
            ViewEffect::ScrollToBottom
        } else {
            self.anchor.pending_unread = self.messages.last().cloned();
            ViewEffect::None
        }
    }

    /// Claims the single history fetch slot. `None` means the caller must not
    /// touch the network: a fetch is already running or nothing older exists.
    pub fn begin_fetch(&mut self) -> Option<PageKind> {
        if self.fetch_in_flight || self.cursor.exhausted {
            return None;
        }
        self.fetch_in_flight = true;
        Some(if self.initial_loaded {
            PageKind::More
        } else {
            PageKind::Initial
        })
    }

    pub fn apply_page(&mut self, kind: PageKind, page: Vec<Message>) -> ViewEffect {
        self.fetch_in_flight = false;
        self.cursor.exhausted = page.len() < HISTORY_PAGE_SIZE;
        self.initial_loaded = true;
        self.initial_failed = false;

        let previous_first = self.messages.first().map(|m| m.id.clone());
        let inserted = self.prepend(page);
        match kind {
            PageKind::Initial => ViewEffect::ScrollToBottom,
            PageKind::More if inserted == 0 => ViewEffect::None,
            PageKind::More => ViewEffect::PreserveOffset {
                anchor: previous_first,
            },
        }
    }

    /// Releases the fetch slot without touching the view or the cursor.
    pub fn fail_fetch(&mut self) {
        self.fetch_in_flight = false;
        if !self.initial_loaded {
            self.initial_failed = true;
        }
    }

    /// Server-pushed history batch. Pagination state is left alone.
    pub fn prepend_history(&mut self, page: Vec<Message>) -> ViewEffect {
        let previous_first = self.messages.first().map(|m| m.id.clone());
        if self.prepend(page) == 0 {
            return ViewEffect::None;
        }
        match previous_first {
            Some(anchor) => ViewEffect::PreserveOffset {
                anchor: Some(anchor),
            },
            None if self.anchor.pinned_to_bottom => ViewEffect::ScrollToBottom,
            None => ViewEffect::None,
        }
    }

    /// Scrolling up unpins the view; arriving at the bottom pins it again and
    /// clears the unread marker.
    pub fn on_scroll(&mut self, position: ScrollPosition) {
        let moved_up = self
            .last_scroll_top
            .is_some_and(|previous| position.top < previous);
        self.last_scroll_top = Some(position.top);

        if position.at_bottom() {
            self.anchor.pinned_to_bottom = true;
            self.anchor.pending_unread = None;
        } else if moved_up {
            self.anchor.pinned_to_bottom = false;
        }
    }

    pub fn pin_to_bottom(&mut self) -> ViewEffect {
        self.anchor.pinned_to_bottom = true;
        self.anchor.pending_unread = None;
        ViewEffect::ScrollToBottom
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn cursor(&self) -> HistoryCursor {
        self.cursor
    }

    pub fn anchor(&self) -> &ScrollAnchor {
        &self.anchor
    }

    pub fn initial_loaded(&self) -> bool {
        self.initial_loaded
    }

    /// True from (re)connect until the first page lands, and during every
    /// later page fetch.
    pub fn is_loading_history(&self) -> bool {
        self.fetch_in_flight || !(self.initial_loaded || self.initial_failed)
    }

    fn prepend(&mut self, page: Vec<Message>) -> usize {
        let mut fresh: Vec<Message> = page
            .into_iter()
            .filter(|message| self.seen.insert(message.id.clone()))
            .collect();
        let count = fresh.len();
        fresh.append(&mut self.messages);
        self.messages = fresh;
        count
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
