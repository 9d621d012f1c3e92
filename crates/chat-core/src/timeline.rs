use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{ChangeEvent, ChangeKind, Message, MessageId};

/// Hard ceiling on any page request.
pub const MAX_PAGE_SIZE: u16 = 100;

/// Errors from local (viewer-initiated) timeline mutations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimelineMergeError {
    #[error("message {0} is not in the timeline")]
    MissingMessage(MessageId),
    #[error("message {0} was deleted")]
    Tombstoned(MessageId),
}

/// Result of merging one change into the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Tombstoned,
    /// Insert for an id that is already present.
    IgnoredDuplicate,
    /// Change targeting a message that is already deleted.
    IgnoredTombstone,
    /// Update or delete for a message outside the loaded window.
    IgnoredUnknown,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated | Self::Tombstoned)
    }
}

/// In-memory message list reconciled from pages and live changes.
///
/// Items are kept sorted by id, newest first, with no duplicate ids. Deleted
/// messages stay in the list as tombstones.
#[derive(Debug, Clone, Default)]
pub struct MessageTimeline {
    items: Vec<Message>,
    loaded: bool,
    exhausted: bool,
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items newest first.
    pub fn items(&self) -> &[Message] {
        &self.items
    }

    /// Items oldest first, as they are displayed.
    pub fn display_order(&self) -> impl DoubleEndedIterator<Item = &Message> {
        self.items.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the initial page has been applied.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Whether the last page came back short, so there is nothing older.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn oldest_id(&self) -> Option<MessageId> {
        self.items.last().map(|message| message.id)
    }

    pub fn newest_id(&self) -> Option<MessageId> {
        self.items.first().map(|message| message.id)
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.search(id).ok().map(|index| &self.items[index])
    }

    /// Position of `id` in display order (oldest first).
    pub fn display_index(&self, id: MessageId) -> Option<usize> {
        self.search(id)
            .ok()
            .map(|index| self.items.len() - 1 - index)
    }

    /// Apply the newest page.
    ///
    /// The first call seeds the list. Later calls (after a reconnect) merge
    /// like an older page so earlier pages and tombstones survive; exhaustion
    /// is only decided by the first call and by older pages.
    pub fn load_initial(&mut self, page: Vec<Message>, requested: u16) -> usize {
        let page_len = page.len();
        let mut added = 0;
        for message in page {
            if self.insert_sorted(message) {
                added += 1;
            }
        }
        if !self.loaded {
            self.loaded = true;
            self.exhausted = page_len < usize::from(requested.max(1));
        }
        added
    }

    /// Merge a page of older messages. Returns how many entries were added.
    pub fn append_older(&mut self, page: Vec<Message>, requested: u16) -> usize {
        let page_len = page.len();
        let mut added = 0;
        for message in page {
            if self.insert_sorted(message) {
                added += 1;
            }
        }
        if page_len < usize::from(requested.max(1)) {
            self.exhausted = true;
        }
        added
    }

    /// Merge one live change.
    pub fn apply_change(&mut self, change: &ChangeEvent) -> MergeOutcome {
        let incoming = &change.message;
        match change.kind {
            ChangeKind::Insert => match self.search(incoming.id) {
                Ok(_) => MergeOutcome::IgnoredDuplicate,
                Err(index) => {
                    self.items.insert(index, incoming.clone());
                    MergeOutcome::Inserted
                }
            },
            ChangeKind::Update => {
                let Ok(index) = self.search(incoming.id) else {
                    return MergeOutcome::IgnoredUnknown;
                };
                let existing = &mut self.items[index];
                if existing.is_deleted {
                    return MergeOutcome::IgnoredTombstone;
                }
                merge_content(existing, incoming);
                MergeOutcome::Updated
            }
            ChangeKind::Delete => {
                let Ok(index) = self.search(incoming.id) else {
                    return MergeOutcome::IgnoredUnknown;
                };
                let existing = &mut self.items[index];
                if existing.is_deleted {
                    return MergeOutcome::IgnoredTombstone;
                }
                existing.is_deleted = true;
                if incoming.updated_at.is_some() {
                    existing.updated_at = incoming.updated_at;
                }
                MergeOutcome::Tombstoned
            }
        }
    }

    /// Local echo of the viewer's own edit.
    pub fn mark_edited(
        &mut self,
        id: MessageId,
        new_text: &str,
        at: DateTime<Utc>,
    ) -> Result<MergeOutcome, TimelineMergeError> {
        let message = self.live_message_mut(id)?;
        message.text = Some(new_text.to_owned());
        message.is_updated = true;
        message.updated_at = Some(at);
        Ok(MergeOutcome::Updated)
    }

    /// Local echo of the viewer's own delete.
    pub fn mark_deleted(&mut self, id: MessageId) -> Result<MergeOutcome, TimelineMergeError> {
        let message = self.live_message_mut(id)?;
        message.is_deleted = true;
        Ok(MergeOutcome::Tombstoned)
    }

    /// Clamp a requested page size against the server cap.
    ///
    /// The result is always in `1..=100`.
    pub fn bounded_page_size(requested: u16, server_cap: u16) -> u16 {
        let safe_requested = requested.max(1);
        let safe_cap = server_cap.max(1);
        safe_requested.min(safe_cap).min(MAX_PAGE_SIZE)
    }

    fn live_message_mut(&mut self, id: MessageId) -> Result<&mut Message, TimelineMergeError> {
        let index = self
            .search(id)
            .map_err(|_| TimelineMergeError::MissingMessage(id))?;
        let message = &mut self.items[index];
        if message.is_deleted {
            return Err(TimelineMergeError::Tombstoned(id));
        }
        Ok(message)
    }

    /// Insert keeping id-descending order. Existing ids keep their tombstone
    /// state; a live copy only refreshes content.
    fn insert_sorted(&mut self, message: Message) -> bool {
        match self.search(message.id) {
            Ok(index) => {
                let existing = &mut self.items[index];
                if !existing.is_deleted {
                    if message.is_deleted {
                        existing.is_deleted = true;
                    } else {
                        merge_content(existing, &message);
                    }
                }
                false
            }
            Err(index) => {
                self.items.insert(index, message);
                true
            }
        }
    }

    fn search(&self, id: MessageId) -> Result<usize, usize> {
        self.items.binary_search_by(|probe| id.cmp(&probe.id))
    }
}

/// Copy mutable fields, keeping identity and creation time.
fn merge_content(existing: &mut Message, incoming: &Message) {
    existing.text = incoming.text.clone();
    existing.gif_url = incoming.gif_url.clone();
    existing.image_url = incoming.image_url.clone();
    existing.country = incoming.country.clone();
    existing.is_authenticated = incoming.is_authenticated;
    existing.reply_to = incoming.reply_to.clone();
    existing.is_updated = existing.is_updated || incoming.is_updated;
    existing.updated_at = incoming.updated_at.or(existing.updated_at);
    existing.reactions = incoming.reactions.clone();
}
