use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{composer::ComposeError, types::ChatLifecycleState};

/// What went wrong, coarse enough to pick a toast or a session refresh.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatErrorCategory {
    /// Rejected draft, bad project settings, or a 4xx the client caused.
    Config,
    /// Expired or missing session; the runtime refreshes once and retries.
    Auth,
    /// REST, realtime socket, or third-party lookup unreachable.
    Network,
    RateLimited,
    /// Image bucket upload or device store write.
    Storage,
    /// A row or provider payload that did not decode.
    Serialization,
    Internal,
}

/// Failure reported by a chat command.
///
/// `message` is the provider text, shown to the user as-is in toasts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ChatError {
    pub category: ChatErrorCategory,
    /// Short code such as `http_413` or `invalid_draft`.
    pub code: String,
    pub message: String,
    /// From a `Retry-After` header, when the provider sent one.
    pub retry_after_ms: Option<u64>,
}

impl ChatError {
    pub fn new(
        category: ChatErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    pub fn invalid_state(current: ChatLifecycleState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ChatErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while chat is in state {current:?}"),
        )
    }

    pub fn is_auth(&self) -> bool {
        self.category == ChatErrorCategory::Auth
    }
}

impl From<ComposeError> for ChatError {
    fn from(err: ComposeError) -> Self {
        Self::new(ChatErrorCategory::Config, "invalid_draft", err.to_string())
    }
}

/// Category for a failed Supabase, Tenor or geolocation response.
pub fn classify_http_status(status: u16) -> ChatErrorCategory {
    match status {
        401 | 403 => ChatErrorCategory::Auth,
        408 | 429 => ChatErrorCategory::RateLimited,
        400..=499 => ChatErrorCategory::Config,
        500..=599 => ChatErrorCategory::Network,
        _ => ChatErrorCategory::Internal,
    }
}
