//! Core chat contract shared between the runtime and frontend consumers.
//!
//! This crate defines the command/event protocol, lifecycle model, message
//! timeline reconciliation, unread bookkeeping, and composer validation.

/// Async command/event channel primitives.
pub mod channel;
/// Draft validation and insert payload construction.
pub mod composer;
/// Stable chat error types and HTTP classification helpers.
pub mod error;
/// Event normalization helpers (send and mutation acknowledgements).
pub mod normalization;
/// Inline emoji reactions.
pub mod reactions;
/// Chat lifecycle state machine.
pub mod state_machine;
/// Message timeline merge rules.
pub mod timeline;
/// Frontend-facing protocol types (commands, events, payloads).
pub mod types;
/// Unread badge and scroll cues.
pub mod unread;

pub use channel::{ChatChannelError, ChatChannels, EventStream};
pub use composer::{
    AuthorStamp, ComposeError, MAX_TEXT_CHARS, attachment_extension, compose_message,
    validate_draft, validate_edit_text,
};
pub use error::{ChatError, ChatErrorCategory, classify_http_status};
pub use normalization::{
    SendOutcome, error_notification, normalize_mutation_outcome, normalize_send_outcome,
};
pub use reactions::ReactionMap;
pub use state_machine::ChatStateMachine;
pub use timeline::{MergeOutcome, MessageTimeline, TimelineMergeError};
pub use types::{
    AuthSession, ChangeEvent, ChangeKind, ChatCommand, ChatEvent, ChatInitConfig,
    ChatLifecycleState, DraftContent, GifItem, GifMode, GifResults, Identity, IdentitySummary,
    ImageAttachment, Message, MessageId, MessagePatch, MutationAck, MutationKind, NewMessage,
    Notification, NotificationLevel, OutgoingDraft, ReplyRef, ReplySnapshot, RowChangeType,
    SendAck, SubscriptionStatus,
};
pub use unread::{APP_TITLE, NotificationCue, ScrollPosition, UnreadTracker};
