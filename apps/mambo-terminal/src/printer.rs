//! Plain-text rendering of UI snapshots for a line-based terminal.

use std::fmt::Write as _;

use chat_core::NotificationLevel;

use crate::{
    bridge::UiUpdate,
    render::{DELETED_LABEL, MessageBody, MessageView, Receipt, ReplyPreview, country_flag},
    state::{ChatSnapshot, UiEffect},
};

const BELL: char = '\x07';

/// Turns UI updates into terminal output, skipping repeats.
#[derive(Debug, Default)]
pub struct TerminalPrinter {
    last: Option<ChatSnapshot>,
}

impl TerminalPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output for one update, or `None` when nothing visible changed.
    pub fn render(&mut self, update: &UiUpdate) -> Option<String> {
        let changed = self.last.as_ref() != Some(&update.snapshot);
        if !changed && update.effects.is_empty() {
            return None;
        }

        let mut out = String::new();
        for effect in &update.effects {
            match effect {
                UiEffect::Sound(_) => out.push(BELL),
                UiEffect::Toast(notification) => {
                    let marker = match notification.level {
                        NotificationLevel::Info => "i",
                        NotificationLevel::Success => "+",
                        NotificationLevel::Error => "!",
                    };
                    let _ = write!(out, "[{marker}] {}", notification.title);
                    if let Some(detail) = &notification.detail {
                        let _ = write!(out, ": {detail}");
                    }
                    out.push('\n');
                }
                UiEffect::FetchMessage(_) => {}
            }
        }

        if changed {
            write_snapshot(&mut out, &update.snapshot);
            self.last = Some(update.snapshot.clone());
        }
        Some(out)
    }
}

fn write_snapshot(out: &mut String, snapshot: &ChatSnapshot) {
    let _ = write!(out, "\x1b]0;{}\x07", snapshot.title);

    let who = snapshot
        .identity
        .as_ref()
        .map(|identity| {
            if identity.is_authenticated {
                format!("@{} ✓", identity.username)
            } else {
                format!("@{}", identity.username)
            }
        })
        .unwrap_or_else(|| "…".to_owned());
    let _ = write!(out, "── {} · {who}", snapshot.status_text);
    if let Some(flag) = snapshot.country_code.as_deref().and_then(country_flag) {
        let _ = write!(out, " {flag}");
    }
    if snapshot.unread_count > 0 {
        let _ = write!(out, " · {} new", snapshot.unread_count);
    }
    out.push('\n');

    if snapshot.visible.start == 0 {
        out.push_str(if snapshot.history_exhausted {
            "   (beginning of chat)\n"
        } else {
            "   (/up for older messages)\n"
        });
    }
    for view in &snapshot.messages[snapshot.visible.clone()] {
        write_message(out, view);
    }
    if snapshot.visible.end < snapshot.messages.len() {
        let _ = writeln!(
            out,
            "   ({} more below, /bottom to catch up)",
            snapshot.messages.len() - snapshot.visible.end
        );
    }

    if let Some(reply) = &snapshot.reply_target {
        let _ = writeln!(out, "replying to {} (/cancel)", reply_label(reply));
    }
    if !snapshot.gifs.is_empty() {
        let _ = writeln!(out, "GIFs (/pick N):");
        for (index, gif) in snapshot.gifs.iter().enumerate() {
            let _ = writeln!(out, "  {}. {}", index + 1, gif.preview_url);
        }
    }
    if let Some(phone) = &snapshot.awaiting_otp_for {
        let _ = writeln!(out, "code sent to {phone}, enter it with /otp CODE");
    }
    if let Some(error) = &snapshot.error_text {
        let _ = writeln!(out, "error: {error}");
    }
}

fn write_message(out: &mut String, view: &MessageView) {
    let _ = write!(out, "#{} {} @{}", view.id, view.time, view.author);
    if view.verified {
        out.push_str(" ✓");
    }
    if let Some(flag) = view.country.as_deref().and_then(country_flag) {
        let _ = write!(out, " {flag}");
    }
    out.push('\n');

    if let Some(reply) = &view.reply {
        let _ = writeln!(out, "   ↳ {}", reply_label(reply));
    }

    let body = match &view.body {
        MessageBody::Text(text) => text.clone(),
        MessageBody::Gif { url } => format!("[GIF] {url}"),
        MessageBody::Image { url, caption } => match caption {
            Some(caption) => format!("[Photo] {url}\n   {caption}"),
            None => format!("[Photo] {url}"),
        },
        MessageBody::Deleted => format!("({DELETED_LABEL})"),
    };
    let _ = write!(out, "   {body}");
    if view.edited {
        out.push_str(" (edited)");
    }
    out.push('\n');

    if !view.reactions.is_empty() {
        out.push_str("   ");
        for reaction in &view.reactions {
            let mine = if reaction.reacted_by_viewer { "*" } else { "" };
            let _ = write!(out, "{}{}{mine} ", reaction.emoji, reaction.count);
        }
        out.push('\n');
    }
    if let Some(receipt) = view.receipt {
        out.push_str(match receipt {
            Receipt::Sent => "   sent\n",
            Receipt::Seen => "   seen\n",
        });
    }
}

fn reply_label(reply: &ReplyPreview) -> String {
    match reply {
        ReplyPreview::Resolved {
            id,
            username,
            excerpt,
        } => format!("#{id} @{username}: {excerpt}"),
        ReplyPreview::Pending { id } => format!("#{id} (loading…)"),
        ReplyPreview::Unavailable { id } => format!("#{id} (unavailable)"),
    }
}
