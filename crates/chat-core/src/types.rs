use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::reactions::ReactionMap;

/// Server-assigned message identifier. Monotonic; used for ordering and pagination.
pub type MessageId = i64;

/// Connection lifecycle reported to the frontend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatLifecycleState {
    /// Runtime has not been initialized yet.
    Cold,
    /// Runtime accepted `Init`; no history loaded yet.
    Configured,
    /// Initial page fetch and change subscription are in progress.
    Loading,
    /// Initial page loaded and the change subscription is live.
    Live,
    /// Initial load failed or the change subscription dropped.
    Disconnected,
}

/// Optional runtime tuning values supplied with `ChatCommand::Init`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChatInitConfig {
    /// Page size for the initial fetch and for pagination.
    pub page_size: Option<u16>,
    /// Number of GIFs requested from the provider.
    pub gif_limit: Option<u8>,
    /// Storage bucket that receives image attachments.
    pub image_bucket: Option<String>,
}

/// Snapshot of a reply target inlined into the replying row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplySnapshot {
    pub id: MessageId,
    pub username: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub gif_url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Reference to the message being replied to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ReplyRef {
    /// Only the identifier is known; the target is resolved lazily.
    Id(MessageId),
    /// The target was inlined when the reply was written.
    Snapshot(ReplySnapshot),
}

impl ReplyRef {
    pub fn target_id(&self) -> MessageId {
        match self {
            Self::Id(id) => *id,
            Self::Snapshot(snapshot) => snapshot.id,
        }
    }
}

/// One row of the `messages` relation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "MessageRow")]
pub struct Message {
    pub id: MessageId,
    pub text: Option<String>,
    pub gif_url: Option<String>,
    pub image_url: Option<String>,
    pub username: String,
    /// ISO country code of the author's device, when known.
    pub country: Option<String>,
    /// Author was phone-verified when the message was written.
    pub is_authenticated: bool,
    pub reply_to: Option<ReplyRef>,
    pub is_deleted: bool,
    pub is_updated: bool,
    pub updated_at: Option<DateTime<Utc>>,
    /// Creation instant.
    pub timestamp: DateTime<Utc>,
    pub reactions: ReactionMap,
}

impl Message {
    /// Whether the row carries at least one of text, GIF or image.
    pub fn has_content(&self) -> bool {
        non_blank(self.text.as_deref()) || self.gif_url.is_some() || self.image_url.is_some()
    }
}

/// Lenient wire shape of a `messages` row.
///
/// Older rows use `imageUrl` and `created_at`; null booleans are treated as false.
#[derive(Debug, Deserialize)]
struct MessageRow {
    id: MessageId,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    gif_url: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default, rename = "imageUrl")]
    image_url_legacy: Option<String>,
    username: String,
    #[serde(default)]
    country: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    is_authenticated: bool,
    #[serde(default)]
    reply_to: Option<ReplyRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    is_deleted: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    is_updated: bool,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    reactions: ReactionMap,
}

impl TryFrom<MessageRow> for Message {
    type Error = String;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let timestamp = row
            .timestamp
            .or(row.created_at)
            .ok_or_else(|| format!("message {} has no timestamp", row.id))?;

        let message = Message {
            id: row.id,
            text: row.text,
            gif_url: non_blank_owned(row.gif_url),
            image_url: non_blank_owned(row.image_url.or(row.image_url_legacy)),
            username: row.username,
            country: normalize_country(row.country),
            is_authenticated: row.is_authenticated,
            reply_to: row.reply_to,
            is_deleted: row.is_deleted,
            is_updated: row.is_updated,
            updated_at: row.updated_at,
            timestamp,
            reactions: row.reactions,
        };

        if !message.has_content() {
            return Err(format!("message {} has no text, gif or image", message.id));
        }
        Ok(message)
    }
}

/// Insert payload for a new `messages` row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gif_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    pub is_authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

/// Partial update applied to an existing row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MessagePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_updated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reactions: Option<ReactionMap>,
}

impl MessagePatch {
    pub fn edit(text: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            text: Some(text.into()),
            is_updated: Some(true),
            updated_at: Some(at),
            ..Self::default()
        }
    }

    pub fn delete(at: DateTime<Utc>) -> Self {
        Self {
            is_deleted: Some(true),
            updated_at: Some(at),
            ..Self::default()
        }
    }

    pub fn reactions(reactions: ReactionMap) -> Self {
        Self {
            reactions: Some(reactions),
            ..Self::default()
        }
    }
}

/// Row-level change type as reported by the change feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RowChangeType {
    Insert,
    Update,
    Delete,
}

/// Change classification used by the reconciliation layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    /// An update whose new row carries `is_deleted = true`.
    Delete,
}

/// Live change event carrying the full new row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub message: Message,
}

impl ChangeEvent {
    /// Classify a raw row change. Physical deletes are never produced by this
    /// client and carry no new row, so they are dropped.
    pub fn classify(change: RowChangeType, message: Message) -> Option<Self> {
        let kind = match change {
            RowChangeType::Insert => ChangeKind::Insert,
            RowChangeType::Update if message.is_deleted => ChangeKind::Delete,
            RowChangeType::Update => ChangeKind::Update,
            RowChangeType::Delete => return None,
        };
        Some(Self { kind, message })
    }
}

/// Image bytes selected by the user for upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageAttachment {
    pub file_name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// What the composer is about to send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DraftContent {
    Text(String),
    Gif {
        url: String,
    },
    Image {
        attachment: ImageAttachment,
        caption: Option<String>,
    },
}

/// Composer output handed to the runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingDraft {
    pub content: DraftContent,
    pub reply_to: Option<MessageId>,
}

/// Authenticated backend session. Tokens never leave the runtime.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthSession {
    pub user_id: String,
    pub phone: Option<String>,
    /// Display name from user metadata, when the account has one.
    pub user_name: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("user_id", &self.user_id)
            .field("phone", &self.phone)
            .field("user_name", &self.user_name)
            .finish_non_exhaustive()
    }
}

/// The single active identity: phone-verified or device-local.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Anonymous { username: String },
    Authenticated { session: AuthSession, username: String },
}

impl Identity {
    pub fn username(&self) -> &str {
        match self {
            Self::Anonymous { username } | Self::Authenticated { username, .. } => username,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    pub fn access_token(&self) -> Option<&str> {
        match self {
            Self::Anonymous { .. } => None,
            Self::Authenticated { session, .. } => Some(&session.access_token),
        }
    }

    pub fn summary(&self) -> IdentitySummary {
        IdentitySummary {
            username: self.username().to_owned(),
            is_authenticated: self.is_authenticated(),
            phone: match self {
                Self::Anonymous { .. } => None,
                Self::Authenticated { session, .. } => session.phone.clone(),
            },
        }
    }
}

/// Identity data safe to hand to the frontend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentitySummary {
    pub username: String,
    pub is_authenticated: bool,
    pub phone: Option<String>,
}

/// One GIF offered by the picker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GifItem {
    pub id: String,
    /// Full-resolution media URL, sent as the message `gif_url`.
    pub url: String,
    /// Small preview URL shown in the picker grid.
    pub preview_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum GifMode {
    Trending,
    Search { query: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GifResults {
    pub mode: GifMode,
    pub items: Vec<GifItem>,
}

/// Command channel input accepted by the chat runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatCommand {
    /// Initialize the runtime with optional tuning overrides.
    Init { config: Option<ChatInitConfig> },
    /// Restore a persisted session, or fall back to the device username.
    RestoreIdentity,
    /// Load the cached country code, detecting it once per device.
    ResolveCountry,
    /// Fetch the newest page and subscribe to row changes.
    Connect,
    /// Manual retry after the initial load or the subscription failed.
    Reconnect,
    /// Fetch the page strictly older than `before`.
    LoadOlder { before: MessageId, limit: u16 },
    /// Compose and insert a message, uploading an attachment first.
    SendMessage {
        client_txn_id: String,
        draft: OutgoingDraft,
    },
    /// Rewrite the text of one of the viewer's messages.
    EditMessage {
        client_txn_id: String,
        message_id: MessageId,
        new_text: String,
    },
    /// Soft-delete one of the viewer's messages.
    DeleteMessage {
        client_txn_id: String,
        message_id: MessageId,
    },
    /// Add the viewer to an emoji's reactor set.
    AddReaction {
        client_txn_id: String,
        message_id: MessageId,
        emoji: String,
    },
    /// Fetch a single message, used to resolve reply previews.
    FetchMessage { message_id: MessageId },
    TrendingGifs,
    SearchGifs { query: String },
    /// Ask the auth provider to text a one-time password.
    RequestOtp { phone: String },
    VerifyOtp { phone: String, token: String },
    /// Change the device username (anonymous identity only).
    SetUsername { username: String },
    Logout,
}

/// Subscription connectivity updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub connected: bool,
}

/// Acknowledgement for `SendMessage`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    pub client_txn_id: String,
    /// Inserted row id on success.
    pub message_id: Option<MessageId>,
    /// Provider-supplied failure message.
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MutationKind {
    Edit,
    Delete,
    Reaction,
}

/// Acknowledgement for edit, delete and reaction commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationAck {
    pub client_txn_id: String,
    pub message_id: MessageId,
    pub kind: MutationKind,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Success,
    Error,
}

/// Transient user-visible notification (a toast).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub level: NotificationLevel,
    pub title: String,
    pub detail: Option<String>,
}

impl Notification {
    pub fn error(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Error,
            title: title.into(),
            detail: Some(detail.into()),
        }
    }

    pub fn success(title: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            level: NotificationLevel::Success,
            title: title.into(),
            detail,
        }
    }
}

/// Event channel output emitted by the chat runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatEvent {
    StateChanged {
        state: ChatLifecycleState,
    },
    IdentityChanged {
        identity: IdentitySummary,
    },
    CountryResolved {
        country_code: String,
    },
    OtpRequested {
        phone: String,
        success: bool,
        error_message: Option<String>,
    },
    AuthResult {
        success: bool,
        error_message: Option<String>,
    },
    /// Newest page, ordered by id descending.
    InitialPage {
        messages: Vec<Message>,
        requested: u16,
    },
    /// Page strictly older than `before`, ordered by id descending.
    OlderPage {
        before: MessageId,
        messages: Vec<Message>,
        requested: u16,
    },
    /// A page fetch failed; `before` is `None` for the initial page.
    PageFailed {
        before: Option<MessageId>,
        error_message: String,
    },
    Change(ChangeEvent),
    SubscriptionStatus(SubscriptionStatus),
    SendAck(SendAck),
    MutationAck(MutationAck),
    /// Result of `FetchMessage`; `None` when the row does not exist.
    MessageFetched {
        message_id: MessageId,
        message: Option<Message>,
    },
    GifResults(GifResults),
    Notification(Notification),
}

pub(crate) fn normalize_country(country: Option<String>) -> Option<String> {
    country
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty() && value != "undefined" && value != "null")
}

fn non_blank(value: Option<&str>) -> bool {
    value.is_some_and(|text| !text.trim().is_empty())
}

fn non_blank_owned(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
