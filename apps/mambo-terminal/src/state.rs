//! Frontend-facing state reducer for `mambo-terminal`.

use std::{
    collections::{HashMap, HashSet},
    ops::Range,
};

use chat_core::{
    ChatEvent, ChatLifecycleState, GifItem, GifResults, IdentitySummary, MergeOutcome, Message,
    MessageId, MessageTimeline, MutationAck, MutationKind, Notification, NotificationCue,
    ReplyRef, ScrollPosition, SendAck, SubscriptionStatus, UnreadTracker,
};
use chrono::{FixedOffset, Utc};
use tracing::{debug, trace, warn};

use crate::render::{
    MessageView, ReplyPreview, ReplyTarget, ViewerContext, render_list, target_preview,
};

const DEFAULT_STATUS: &str = "Starting";
const INITIAL_LOAD_FAILED: &str = "Failed to load messages. Use /reconnect to try again.";

/// Audible cues for the printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundCue {
    /// The viewer's message was stored.
    Sent,
    /// A message arrived while scrolled away from the bottom.
    Incoming,
}

/// Side effects produced while reducing an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEffect {
    Sound(SoundCue),
    Toast(Notification),
    /// A reply target is outside the loaded window.
    FetchMessage(MessageId),
}

/// Full UI snapshot emitted after state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSnapshot {
    pub title: String,
    pub status_text: String,
    pub error_text: Option<String>,
    pub identity: Option<IdentitySummary>,
    pub country_code: Option<String>,
    /// Every loaded message, oldest first.
    pub messages: Vec<MessageView>,
    /// Slice of `messages` currently on screen.
    pub visible: Range<usize>,
    pub unread_count: u32,
    pub history_exhausted: bool,
    pub reply_target: Option<ReplyPreview>,
    pub gifs: Vec<GifItem>,
    pub awaiting_otp_for: Option<String>,
    pub can_reconnect: bool,
}

/// Viewer mutation waiting for its acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingMutation {
    Edit { message_id: MessageId, text: String },
    Delete { message_id: MessageId },
    Reaction { message_id: MessageId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CachedReply {
    Pending,
    Loaded(Box<Message>),
    Missing,
}

#[derive(Debug, Default, Clone)]
struct PaginationTracker {
    in_flight: bool,
    last_requested_ms: Option<u64>,
}

impl PaginationTracker {
    fn should_request(&self, now_ms: u64, cooldown_ms: u64) -> bool {
        if self.in_flight {
            return false;
        }
        self.last_requested_ms
            .is_none_or(|last| now_ms.saturating_sub(last) >= cooldown_ms)
    }

    fn mark_requested(&mut self, now_ms: u64) {
        self.in_flight = true;
        self.last_requested_ms = Some(now_ms);
    }

    fn mark_complete(&mut self) {
        self.in_flight = false;
    }
}

/// Mutable app state that receives runtime events and user actions.
#[derive(Debug, Clone)]
pub struct ChatState {
    viewer: ViewerContext,
    identity: Option<IdentitySummary>,
    lifecycle: ChatLifecycleState,
    timeline: MessageTimeline,
    unread: UnreadTracker,
    scroll_top: u32,
    viewport_rows: u32,
    reply_cache: HashMap<MessageId, CachedReply>,
    pagination: PaginationTracker,
    pending_sends: HashSet<String>,
    pending_mutations: HashMap<String, PendingMutation>,
    status_text: String,
    error_text: Option<String>,
    country_code: Option<String>,
    gifs: Option<GifResults>,
    reply_to: Option<MessageId>,
    otp_phone: Option<String>,
}

impl ChatState {
    pub fn new(viewport_rows: u32, utc_offset: Option<FixedOffset>) -> Self {
        Self {
            viewer: ViewerContext::new(String::new(), utc_offset),
            identity: None,
            lifecycle: ChatLifecycleState::Cold,
            timeline: MessageTimeline::new(),
            unread: UnreadTracker::new(),
            scroll_top: 0,
            viewport_rows: viewport_rows.max(1),
            reply_cache: HashMap::new(),
            pagination: PaginationTracker::default(),
            pending_sends: HashSet::new(),
            pending_mutations: HashMap::new(),
            status_text: DEFAULT_STATUS.to_owned(),
            error_text: None,
            country_code: None,
            gifs: None,
            reply_to: None,
            otp_phone: None,
        }
    }

    /// Current immutable snapshot for rendering.
    pub fn snapshot(&self) -> ChatSnapshot {
        let messages = render_list(&self.timeline, &self.viewer, |id| self.reply_target_for(id));
        let start = (self.scroll_top as usize).min(messages.len());
        let end = (start + self.viewport_rows as usize).min(messages.len());

        ChatSnapshot {
            title: self.unread.title(),
            status_text: self.status_text.clone(),
            error_text: self.error_text.clone(),
            identity: self.identity.clone(),
            country_code: self.country_code.clone(),
            messages,
            visible: start..end,
            unread_count: self.unread.unread_count(),
            history_exhausted: self.timeline.is_exhausted(),
            reply_target: self.reply_to.map(|id| self.reply_preview(id)),
            gifs: self
                .gifs
                .as_ref()
                .map(|results| results.items.clone())
                .unwrap_or_default(),
            awaiting_otp_for: self.otp_phone.clone(),
            can_reconnect: self.lifecycle == ChatLifecycleState::Disconnected,
        }
    }

    pub fn set_error_text(&mut self, text: impl Into<String>) {
        self.error_text = Some(text.into());
    }

    pub fn clear_error(&mut self) {
        self.error_text = None;
    }

    pub fn viewer_username(&self) -> &str {
        &self.viewer.username
    }

    /// Whether `id` is a loaded, non-deleted message written by the viewer.
    pub fn owns_live_message(&self, id: MessageId) -> bool {
        self.timeline
            .get(id)
            .is_some_and(|message| !message.is_deleted && message.username == self.viewer.username)
    }

    pub fn mark_send_requested(&mut self, client_txn_id: String) {
        self.pending_sends.insert(client_txn_id);
    }

    pub fn mark_mutation_requested(&mut self, client_txn_id: String, mutation: PendingMutation) {
        self.pending_mutations.insert(client_txn_id, mutation);
    }

    /// Choose the message the next send replies to.
    pub fn set_reply_target(&mut self, id: MessageId) -> Result<(), String> {
        match self.timeline.get(id) {
            Some(message) if message.is_deleted => Err(format!("Message #{id} was deleted.")),
            Some(_) => {
                self.reply_to = Some(id);
                Ok(())
            }
            None => Err(format!("Message #{id} is not loaded.")),
        }
    }

    pub fn clear_reply_target(&mut self) {
        self.reply_to = None;
    }

    /// Reply target for the next send; cleared once taken.
    pub fn take_reply_target(&mut self) -> Option<MessageId> {
        self.reply_to.take()
    }

    /// One-based pick from the last GIF results.
    pub fn gif_at(&self, position: usize) -> Option<&GifItem> {
        let index = position.checked_sub(1)?;
        self.gifs.as_ref()?.items.get(index)
    }

    pub fn otp_phone(&self) -> Option<&str> {
        self.otp_phone.as_deref()
    }

    pub fn scroll_to_top(&mut self) {
        self.scroll_top = 0;
        self.record_scroll();
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll_top = self.max_scroll_top();
        self.record_scroll();
    }

    pub fn scroll_up(&mut self) {
        self.scroll_top = self.scroll_top.saturating_sub(self.viewport_rows);
        self.record_scroll();
    }

    pub fn scroll_down(&mut self) {
        self.scroll_top = self
            .scroll_top
            .saturating_add(self.viewport_rows)
            .min(self.max_scroll_top());
        self.record_scroll();
    }

    /// Scroll so the referenced message is the first visible row. Returns its
    /// display index.
    pub fn jump_to(&mut self, id: MessageId) -> Option<usize> {
        let index = self.timeline.display_index(id)?;
        self.scroll_top = (index as u32).min(self.max_scroll_top());
        self.record_scroll();
        Some(index)
    }

    /// Returns the `LoadOlder` arguments and marks the request in flight when
    /// the trigger conditions hold.
    pub fn request_pagination_if_needed(
        &mut self,
        now_ms: u64,
        cooldown_ms: u64,
        limit: u16,
    ) -> Option<(MessageId, u16)> {
        if !self.scroll_position().is_at_top()
            || !self.timeline.is_loaded()
            || self.timeline.is_exhausted()
            || !self.pagination.should_request(now_ms, cooldown_ms)
        {
            return None;
        }
        let before = self.timeline.oldest_id()?;
        self.pagination.mark_requested(now_ms);
        Some((before, limit.max(1)))
    }

    /// Feed one runtime event into the reducer.
    pub fn handle_event(&mut self, event: ChatEvent) -> Vec<UiEffect> {
        let mut effects = Vec::new();
        match event {
            ChatEvent::StateChanged { state } => {
                self.lifecycle = state;
                self.status_text = lifecycle_label(state).to_owned();
            }
            ChatEvent::IdentityChanged { identity } => {
                debug!(username = %identity.username, "identity changed");
                self.viewer.username = identity.username.clone();
                self.identity = Some(identity);
            }
            ChatEvent::CountryResolved { country_code } => {
                self.country_code = Some(country_code);
            }
            ChatEvent::OtpRequested { phone, success, .. } => {
                if success {
                    self.otp_phone = Some(phone);
                }
            }
            ChatEvent::AuthResult { success, .. } => {
                if success {
                    self.otp_phone = None;
                    self.clear_error();
                }
            }
            ChatEvent::InitialPage {
                messages,
                requested,
            } => {
                let reload = self.timeline.is_loaded();
                let added = self.timeline.load_initial(messages, requested);
                trace!(reload, added, "initial page merged");
                self.pagination = PaginationTracker::default();
                if reload {
                    // Retry reply targets whose lookup came back empty.
                    self.reply_cache
                        .retain(|_, entry| !matches!(entry, CachedReply::Missing));
                }
                self.clear_error();
                self.scroll_to_bottom();
                self.queue_reply_fetches(&mut effects);
            }
            ChatEvent::OlderPage {
                before,
                messages,
                requested,
            } => {
                self.pagination.mark_complete();
                let added = self.timeline.append_older(messages, requested);
                trace!(before, added, "older page merged");
                // Keep the rows that were on screen in place.
                self.scroll_top = self.scroll_top.saturating_add(added as u32);
                self.queue_reply_fetches(&mut effects);
            }
            ChatEvent::PageFailed { before, .. } => match before {
                None => self.set_error_text(INITIAL_LOAD_FAILED),
                Some(_) => self.pagination.mark_complete(),
            },
            ChatEvent::Change(change) => {
                let outcome = self.timeline.apply_change(&change);
                trace!(id = change.message.id, ?outcome, "change merged");
                if let Some(CachedReply::Loaded(cached)) = self.reply_cache.get_mut(&change.message.id)
                    && !cached.is_deleted
                {
                    **cached = change.message.clone();
                }
                if outcome == MergeOutcome::Inserted {
                    let is_own = change.message.username == self.viewer.username;
                    match self.unread.on_insert(is_own) {
                        NotificationCue::ScrollToBottom
                        | NotificationCue::StickToBottom => self.scroll_to_bottom(),
                        NotificationCue::PlaySound => {
                            effects.push(UiEffect::Sound(SoundCue::Incoming));
                        }
                        NotificationCue::None => {}
                    }
                    self.queue_reply_fetches(&mut effects);
                }
            }
            ChatEvent::SubscriptionStatus(SubscriptionStatus { connected }) => {
                debug!(connected, "subscription status changed");
            }
            ChatEvent::SendAck(ack) => self.handle_send_ack(ack, &mut effects),
            ChatEvent::MutationAck(ack) => self.handle_mutation_ack(ack),
            ChatEvent::MessageFetched {
                message_id,
                message,
            } => {
                let entry = match message {
                    Some(message) => CachedReply::Loaded(Box::new(message)),
                    None => CachedReply::Missing,
                };
                self.reply_cache.insert(message_id, entry);
            }
            ChatEvent::GifResults(results) => {
                self.gifs = Some(results);
            }
            ChatEvent::Notification(notification) => {
                effects.push(UiEffect::Toast(notification));
            }
        }
        effects
    }

    fn handle_send_ack(&mut self, ack: SendAck, effects: &mut Vec<UiEffect>) {
        self.pending_sends.remove(&ack.client_txn_id);
        match ack.error_message {
            Some(message) => {
                warn!(client_txn_id = %ack.client_txn_id, %message, "send acknowledgement reported failure");
            }
            None => {
                debug!(client_txn_id = %ack.client_txn_id, message_id = ?ack.message_id, "send acknowledged");
                effects.push(UiEffect::Sound(SoundCue::Sent));
            }
        }
    }

    fn handle_mutation_ack(&mut self, ack: MutationAck) {
        let pending = self.pending_mutations.remove(&ack.client_txn_id);
        if let Some(message) = ack.error_message {
            warn!(message_id = ack.message_id, kind = ?ack.kind, %message, "mutation failed");
            return;
        }
        let echoed = match (ack.kind, pending) {
            (MutationKind::Edit, Some(PendingMutation::Edit { message_id, text })) => {
                self.timeline.mark_edited(message_id, &text, Utc::now())
            }
            (MutationKind::Delete, Some(PendingMutation::Delete { message_id })) => {
                self.timeline.mark_deleted(message_id)
            }
            _ => return,
        };
        if let Err(err) = echoed {
            debug!(error = %err, "local echo skipped");
        }
    }

    /// Queue a fetch for every id-only reply whose target is unknown.
    fn queue_reply_fetches(&mut self, effects: &mut Vec<UiEffect>) {
        let wanted: Vec<MessageId> = self
            .timeline
            .items()
            .iter()
            .filter_map(|message| match &message.reply_to {
                Some(ReplyRef::Id(id)) => Some(*id),
                _ => None,
            })
            .filter(|id| self.timeline.get(*id).is_none() && !self.reply_cache.contains_key(id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        for id in wanted {
            self.reply_cache.insert(id, CachedReply::Pending);
            effects.push(UiEffect::FetchMessage(id));
        }
    }

    fn reply_target_for(&self, id: MessageId) -> ReplyTarget<'_> {
        if let Some(message) = self.timeline.get(id) {
            return ReplyTarget::Loaded(message);
        }
        match self.reply_cache.get(&id) {
            Some(CachedReply::Loaded(message)) => ReplyTarget::Loaded(message),
            Some(CachedReply::Missing) => ReplyTarget::Missing,
            Some(CachedReply::Pending) | None => ReplyTarget::Unknown,
        }
    }

    fn reply_preview(&self, id: MessageId) -> ReplyPreview {
        target_preview(id, self.reply_target_for(id))
    }

    fn scroll_position(&self) -> ScrollPosition {
        ScrollPosition {
            scroll_top: self.scroll_top,
            scroll_height: self.timeline.len() as u32,
            client_height: self.viewport_rows,
        }
    }

    fn max_scroll_top(&self) -> u32 {
        (self.timeline.len() as u32).saturating_sub(self.viewport_rows)
    }

    fn record_scroll(&mut self) {
        self.unread.on_scroll(self.scroll_position());
    }
}

fn lifecycle_label(state: ChatLifecycleState) -> &'static str {
    match state {
        ChatLifecycleState::Cold => "Starting",
        ChatLifecycleState::Configured => "Ready",
        ChatLifecycleState::Loading => "Loading messages",
        ChatLifecycleState::Live => "Connected",
        ChatLifecycleState::Disconnected => "Disconnected",
    }
}
