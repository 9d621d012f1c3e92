use thiserror::Error;
use url::Url;

use crate::types::{DraftContent, NewMessage, OutgoingDraft};

/// Longest accepted message text, counted in characters.
pub const MAX_TEXT_CHARS: usize = 500;

/// Author fields stamped onto every outgoing row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorStamp {
    pub username: String,
    pub country: Option<String>,
    pub is_authenticated: bool,
}

/// Reasons a draft cannot be sent.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComposeError {
    #[error("message text is empty")]
    EmptyText,
    #[error("message is {len} characters, the limit is {max}")]
    TextTooLong { len: usize, max: usize },
    #[error("gif url must be an http(s) url: {0}")]
    InvalidGifUrl(String),
    #[error("attachment type {0} is not an image")]
    UnsupportedAttachment(String),
    #[error("attachment is empty")]
    EmptyAttachment,
    #[error("no username is set")]
    MissingUsername,
    #[error("image upload did not produce a url")]
    MissingUploadUrl,
}

/// Trim and length-check message text.
pub fn validate_text(text: &str) -> Result<String, ComposeError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ComposeError::EmptyText);
    }
    let len = trimmed.chars().count();
    if len > MAX_TEXT_CHARS {
        return Err(ComposeError::TextTooLong {
            len,
            max: MAX_TEXT_CHARS,
        });
    }
    Ok(trimmed.to_owned())
}

/// Edits follow the same text rules as sends.
pub fn validate_edit_text(text: &str) -> Result<String, ComposeError> {
    validate_text(text)
}

/// Check a draft before any network work is done.
pub fn validate_draft(draft: &OutgoingDraft) -> Result<(), ComposeError> {
    match &draft.content {
        DraftContent::Text(text) => validate_text(text).map(|_| ()),
        DraftContent::Gif { url } => validate_gif_url(url).map(|_| ()),
        DraftContent::Image {
            attachment,
            caption,
        } => {
            if !attachment.content_type.starts_with("image/") {
                return Err(ComposeError::UnsupportedAttachment(
                    attachment.content_type.clone(),
                ));
            }
            if attachment.data.is_empty() {
                return Err(ComposeError::EmptyAttachment);
            }
            validate_caption(caption.as_deref()).map(|_| ())
        }
    }
}

/// Build the insert payload. Image drafts need the public URL of the upload.
pub fn compose_message(
    draft: &OutgoingDraft,
    author: &AuthorStamp,
    uploaded_image_url: Option<&str>,
) -> Result<NewMessage, ComposeError> {
    validate_draft(draft)?;
    if author.username.trim().is_empty() {
        return Err(ComposeError::MissingUsername);
    }

    let (text, gif_url, image_url) = match &draft.content {
        DraftContent::Text(text) => (Some(validate_text(text)?), None, None),
        DraftContent::Gif { url } => (None, Some(validate_gif_url(url)?), None),
        DraftContent::Image { caption, .. } => {
            let url = uploaded_image_url
                .filter(|url| !url.trim().is_empty())
                .ok_or(ComposeError::MissingUploadUrl)?;
            (validate_caption(caption.as_deref())?, None, Some(url.to_owned()))
        }
    };

    Ok(NewMessage {
        text,
        gif_url,
        image_url,
        username: author.username.clone(),
        country: author.country.clone(),
        is_authenticated: author.is_authenticated,
        reply_to: draft.reply_to,
    })
}

/// Extension for the storage object name, derived from the file name or the
/// content type.
pub fn attachment_extension(file_name: &str, content_type: &str) -> String {
    let from_name = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.trim().to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    if let Some(ext) = from_name {
        return ext;
    }

    match content_type.strip_prefix("image/") {
        Some("jpeg") => "jpg".to_owned(),
        Some("svg+xml") => "svg".to_owned(),
        Some(subtype) if !subtype.is_empty() => subtype.to_owned(),
        _ => "bin".to_owned(),
    }
}

fn validate_caption(caption: Option<&str>) -> Result<Option<String>, ComposeError> {
    match caption.map(str::trim).filter(|text| !text.is_empty()) {
        Some(text) => validate_text(text).map(Some),
        None => Ok(None),
    }
}

fn validate_gif_url(raw: &str) -> Result<String, ComposeError> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed).map_err(|_| ComposeError::InvalidGifUrl(trimmed.to_owned()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ComposeError::InvalidGifUrl(trimmed.to_owned()));
    }
    Ok(trimmed.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageAttachment;

    fn author() -> AuthorStamp {
        AuthorStamp {
            username: "@user4821".into(),
            country: Some("ke".into()),
            is_authenticated: false,
        }
    }

    fn draft(content: DraftContent) -> OutgoingDraft {
        OutgoingDraft {
            content,
            reply_to: None,
        }
    }

    #[test]
    fn trims_text_and_stamps_author() {
        let mut outgoing = draft(DraftContent::Text("  hello there  ".into()));
        outgoing.reply_to = Some(12);
        let message = compose_message(&outgoing, &author(), None).expect("valid draft");

        assert_eq!(message.text.as_deref(), Some("hello there"));
        assert_eq!(message.username, "@user4821");
        assert_eq!(message.country.as_deref(), Some("ke"));
        assert_eq!(message.reply_to, Some(12));
    }

    #[test]
    fn rejects_blank_and_oversized_text() {
        assert_eq!(
            validate_draft(&draft(DraftContent::Text("   ".into()))),
            Err(ComposeError::EmptyText)
        );

        let long = "a".repeat(MAX_TEXT_CHARS + 1);
        assert_eq!(
            validate_draft(&draft(DraftContent::Text(long))),
            Err(ComposeError::TextTooLong {
                len: MAX_TEXT_CHARS + 1,
                max: MAX_TEXT_CHARS
            })
        );

        let exact = "é".repeat(MAX_TEXT_CHARS);
        assert!(validate_draft(&draft(DraftContent::Text(exact))).is_ok());
    }

    #[test]
    fn rejects_non_http_gif_urls() {
        let err = validate_draft(&draft(DraftContent::Gif {
            url: "javascript:alert(1)".into(),
        }))
        .expect_err("scheme must be rejected");
        assert!(matches!(err, ComposeError::InvalidGifUrl(_)));

        let message = compose_message(
            &draft(DraftContent::Gif {
                url: "https://media.tenor.com/x.gif".into(),
            }),
            &author(),
            None,
        )
        .expect("gif draft");
        assert_eq!(message.gif_url.as_deref(), Some("https://media.tenor.com/x.gif"));
        assert_eq!(message.text, None);
    }

    #[test]
    fn image_drafts_need_image_bytes_and_upload_url() {
        let attachment = ImageAttachment {
            file_name: "cat.PNG".into(),
            content_type: "image/png".into(),
            data: vec![1, 2, 3],
        };
        let outgoing = draft(DraftContent::Image {
            attachment: attachment.clone(),
            caption: Some(" look ".into()),
        });

        assert_eq!(
            compose_message(&outgoing, &author(), None),
            Err(ComposeError::MissingUploadUrl)
        );
        let message = compose_message(&outgoing, &author(), Some("https://cdn/x.png"))
            .expect("uploaded image");
        assert_eq!(message.image_url.as_deref(), Some("https://cdn/x.png"));
        assert_eq!(message.text.as_deref(), Some("look"));

        let pdf = draft(DraftContent::Image {
            attachment: ImageAttachment {
                content_type: "application/pdf".into(),
                ..attachment.clone()
            },
            caption: None,
        });
        assert!(matches!(
            validate_draft(&pdf),
            Err(ComposeError::UnsupportedAttachment(_))
        ));

        let empty = draft(DraftContent::Image {
            attachment: ImageAttachment {
                data: Vec::new(),
                ..attachment
            },
            caption: None,
        });
        assert_eq!(validate_draft(&empty), Err(ComposeError::EmptyAttachment));
    }

    #[test]
    fn rejects_missing_username() {
        let nobody = AuthorStamp {
            username: " ".into(),
            ..author()
        };
        assert_eq!(
            compose_message(&draft(DraftContent::Text("hi".into())), &nobody, None),
            Err(ComposeError::MissingUsername)
        );
    }

    #[test]
    fn derives_attachment_extension() {
        assert_eq!(attachment_extension("cat.PNG", "image/png"), "png");
        assert_eq!(attachment_extension("clipboard", "image/jpeg"), "jpg");
        assert_eq!(attachment_extension("noext.", "image/webp"), "webp");
        assert_eq!(attachment_extension("x", "application/octet-stream"), "bin");
    }
}
