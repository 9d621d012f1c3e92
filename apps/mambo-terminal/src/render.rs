//! View models for single messages and the message list.
//!
//! Rendering is a pure function of the stored rows and the viewer; nothing
//! here touches the network or the terminal.

use chat_core::{Message, MessageId, MessageTimeline, ReplyRef, ReplySnapshot};
use chrono::{DateTime, FixedOffset, Local, Offset, Utc};

pub const DELETED_LABEL: &str = "Message deleted";
const REPLY_EXCERPT_CHARS: usize = 60;

/// The person looking at the list, and the timezone timestamps are shown in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerContext {
    pub username: String,
    pub offset: FixedOffset,
}

impl ViewerContext {
    /// Uses the host's current UTC offset when `offset` is `None`.
    pub fn new(username: impl Into<String>, offset: Option<FixedOffset>) -> Self {
        Self {
            username: username.into(),
            offset: offset.unwrap_or_else(local_offset),
        }
    }
}

pub fn local_offset() -> FixedOffset {
    Local::now().offset().fix()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    Gif { url: String },
    Image { url: String, caption: Option<String> },
    Deleted,
}

/// Read receipt shown under the viewer's own messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    Sent,
    /// Someone else has posted since.
    Seen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPreview {
    Resolved {
        id: MessageId,
        username: String,
        excerpt: String,
    },
    /// The target is outside the loaded window and is being fetched.
    Pending { id: MessageId },
    /// The target no longer exists.
    Unavailable { id: MessageId },
}

impl ReplyPreview {
    pub fn target_id(&self) -> MessageId {
        match self {
            Self::Resolved { id, .. } | Self::Pending { id } | Self::Unavailable { id } => *id,
        }
    }
}

/// Where the renderer can find the target of a reply.
#[derive(Debug, Clone, Copy)]
pub enum ReplyTarget<'a> {
    Loaded(&'a Message),
    Missing,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionView {
    pub emoji: String,
    pub count: usize,
    pub reacted_by_viewer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: MessageId,
    pub author: String,
    pub verified: bool,
    /// Lowercase ISO country code of the author.
    pub country: Option<String>,
    /// Local `h:mm AM/PM`.
    pub time: String,
    pub body: MessageBody,
    pub edited: bool,
    pub is_own: bool,
    pub receipt: Option<Receipt>,
    pub reply: Option<ReplyPreview>,
    pub can_edit: bool,
    pub can_delete: bool,
    pub reactions: Vec<ReactionView>,
}

/// Render one message for `viewer`.
///
/// `later_foreign` says whether anyone else posted after this message.
pub fn render_message(
    message: &Message,
    viewer: &ViewerContext,
    later_foreign: bool,
    reply_target: ReplyTarget<'_>,
) -> MessageView {
    let is_own = message.username == viewer.username;
    let deleted = message.is_deleted;

    let body = if deleted {
        MessageBody::Deleted
    } else if let Some(url) = &message.image_url {
        MessageBody::Image {
            url: url.clone(),
            caption: non_blank(message.text.as_deref()),
        }
    } else if let Some(url) = &message.gif_url {
        MessageBody::Gif { url: url.clone() }
    } else {
        MessageBody::Text(message.text.clone().unwrap_or_default())
    };

    let receipt = (is_own && !deleted).then_some(if later_foreign {
        Receipt::Seen
    } else {
        Receipt::Sent
    });

    let reactions = message
        .reactions
        .counts()
        .into_iter()
        .map(|(emoji, count)| ReactionView {
            emoji: emoji.to_owned(),
            count,
            reacted_by_viewer: message.reactions.has_reacted(emoji, &viewer.username),
        })
        .collect();

    MessageView {
        id: message.id,
        author: message.username.clone(),
        verified: message.is_authenticated,
        country: message
            .country
            .as_deref()
            .map(|code| code.trim().to_ascii_lowercase()),
        time: format_time(message.timestamp, viewer.offset),
        body,
        edited: message.is_updated && !deleted,
        is_own,
        receipt,
        reply: message
            .reply_to
            .as_ref()
            .map(|reply| reply_preview(reply, reply_target)),
        can_edit: is_own && !deleted && message.text.is_some(),
        can_delete: is_own && !deleted,
        reactions,
    }
}

/// Render the whole timeline oldest first.
pub fn render_list<'a>(
    timeline: &'a MessageTimeline,
    viewer: &ViewerContext,
    resolve_reply: impl Fn(MessageId) -> ReplyTarget<'a>,
) -> Vec<MessageView> {
    let mut foreign_after = false;
    let mut views: Vec<MessageView> = timeline
        .items()
        .iter()
        .map(|message| {
            let target = match &message.reply_to {
                Some(ReplyRef::Id(id)) => resolve_reply(*id),
                _ => ReplyTarget::Unknown,
            };
            let view = render_message(message, viewer, foreign_after, target);
            if message.username != viewer.username {
                foreign_after = true;
            }
            view
        })
        .collect();
    views.reverse();
    views
}

/// `h:mm AM/PM` in the given offset.
pub fn format_time(timestamp: DateTime<Utc>, offset: FixedOffset) -> String {
    timestamp.with_timezone(&offset).format("%-I:%M %p").to_string()
}

/// Regional-indicator flag for a two-letter country code.
pub fn country_flag(code: &str) -> Option<String> {
    let code = code.trim();
    if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    code.chars()
        .map(|c| char::from_u32(0x1F1E6 + u32::from(c.to_ascii_uppercase() as u8 - b'A')))
        .collect()
}

/// Preview of a message referenced only by id, such as the composer's reply target.
pub fn target_preview(id: MessageId, target: ReplyTarget<'_>) -> ReplyPreview {
    reply_preview(&ReplyRef::Id(id), target)
}

fn reply_preview(reply: &ReplyRef, target: ReplyTarget<'_>) -> ReplyPreview {
    match reply {
        ReplyRef::Snapshot(snapshot) => snapshot_preview(snapshot),
        ReplyRef::Id(id) => match target {
            ReplyTarget::Loaded(message) => ReplyPreview::Resolved {
                id: *id,
                username: message.username.clone(),
                excerpt: if message.is_deleted {
                    DELETED_LABEL.to_owned()
                } else {
                    excerpt(
                        message.text.as_deref(),
                        message.gif_url.is_some(),
                        message.image_url.is_some(),
                    )
                },
            },
            ReplyTarget::Missing => ReplyPreview::Unavailable { id: *id },
            ReplyTarget::Unknown => ReplyPreview::Pending { id: *id },
        },
    }
}

fn snapshot_preview(snapshot: &ReplySnapshot) -> ReplyPreview {
    ReplyPreview::Resolved {
        id: snapshot.id,
        username: snapshot.username.clone(),
        excerpt: excerpt(
            snapshot.text.as_deref(),
            snapshot.gif_url.is_some(),
            snapshot.image_url.is_some(),
        ),
    }
}

fn excerpt(text: Option<&str>, has_gif: bool, has_image: bool) -> String {
    if let Some(text) = non_blank(text) {
        let mut chars = text.chars();
        let head: String = chars.by_ref().take(REPLY_EXCERPT_CHARS).collect();
        return if chars.next().is_some() {
            format!("{head}…")
        } else {
            head
        };
    }
    if has_image {
        "Photo".to_owned()
    } else if has_gif {
        "GIF".to_owned()
    } else {
        String::new()
    }
}

fn non_blank(text: Option<&str>) -> Option<String> {
    text.map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_owned)
}
