use serde::{Deserialize, Serialize};

/// Application name shown in the window or terminal title.
pub const APP_TITLE: &str = "Mambo";

/// Scroll geometry of the message list viewport, in rows or pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollPosition {
    pub scroll_top: u32,
    pub scroll_height: u32,
    pub client_height: u32,
}

impl ScrollPosition {
    /// Bottom check tolerates one unit of rounding.
    pub fn is_at_bottom(&self) -> bool {
        self.scroll_height.saturating_sub(self.scroll_top) <= self.client_height.saturating_add(1)
    }

    pub fn is_at_top(&self) -> bool {
        self.scroll_top == 0
    }
}

/// What the view should do after a live insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationCue {
    None,
    /// The viewer sent this message; jump to it.
    ScrollToBottom,
    /// Foreign message while at the bottom; keep following.
    StickToBottom,
    /// Foreign message while scrolled away; badge was incremented.
    PlaySound,
}

/// Unread badge bookkeeping.
#[derive(Debug, Clone)]
pub struct UnreadTracker {
    unread: u32,
    on_bottom: bool,
}

impl Default for UnreadTracker {
    fn default() -> Self {
        Self {
            unread: 0,
            on_bottom: true,
        }
    }
}

impl UnreadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unread_count(&self) -> u32 {
        self.unread
    }

    pub fn is_on_bottom(&self) -> bool {
        self.on_bottom
    }

    /// Record a scroll; reaching the bottom clears the badge.
    pub fn on_scroll(&mut self, position: ScrollPosition) {
        if position.is_at_bottom() {
            self.mark_at_bottom();
        } else {
            self.on_bottom = false;
        }
    }

    pub fn mark_at_bottom(&mut self) {
        self.on_bottom = true;
        self.unread = 0;
    }

    /// Account for one newly inserted message.
    pub fn on_insert(&mut self, is_own: bool) -> NotificationCue {
        if is_own {
            self.mark_at_bottom();
            return NotificationCue::ScrollToBottom;
        }
        if self.on_bottom {
            return NotificationCue::StickToBottom;
        }
        self.unread = self.unread.saturating_add(1);
        NotificationCue::PlaySound
    }

    pub fn title(&self) -> String {
        if self.unread > 0 {
            format!("({}) New Messages - {APP_TITLE}", self.unread)
        } else {
            APP_TITLE.to_owned()
        }
    }
}
