//! Shared HTTP plumbing for the project endpoints.

use chat_core::{ChatError, ChatErrorCategory, classify_http_status};
use reqwest::{RequestBuilder, Response, header::RETRY_AFTER};
use serde::{Deserialize, de::DeserializeOwned};
use url::Url;

/// Connection settings for one backend project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupabaseConfig {
    pub base_url: Url,
    /// Public anon key sent as `apikey` on every request.
    pub anon_key: String,
}

impl SupabaseConfig {
    pub fn new(base_url: &str, anon_key: impl Into<String>) -> Result<Self, ChatError> {
        let mut base_url = Url::parse(base_url.trim()).map_err(|err| {
            ChatError::new(
                ChatErrorCategory::Config,
                "invalid_base_url",
                format!("invalid project url '{base_url}': {err}"),
            )
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            base_url,
            anon_key: anon_key.into(),
        })
    }

    /// Join a relative path such as `rest/v1/messages` onto the base URL.
    pub fn endpoint(&self, path: &str) -> Result<Url, ChatError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| {
                ChatError::new(
                    ChatErrorCategory::Config,
                    "invalid_endpoint",
                    format!("cannot build endpoint '{path}': {err}"),
                )
            })
    }
}

/// Attach `apikey` and the bearer token. Anonymous callers use the anon key
/// as bearer.
pub(crate) fn authorize(
    request: RequestBuilder,
    config: &SupabaseConfig,
    access_token: Option<&str>,
) -> RequestBuilder {
    request
        .header("apikey", &config.anon_key)
        .bearer_auth(access_token.unwrap_or(&config.anon_key))
}

/// Error body shapes used by the table, auth and storage services.
#[derive(Debug, Default, Deserialize)]
struct ProviderErrorBody {
    message: Option<String>,
    msg: Option<String>,
    error_description: Option<String>,
    error: Option<serde_json::Value>,
    code: Option<serde_json::Value>,
    error_code: Option<String>,
}

impl ProviderErrorBody {
    fn message(&self) -> Option<String> {
        self.message
            .clone()
            .or_else(|| self.msg.clone())
            .or_else(|| self.error_description.clone())
            .or_else(|| match &self.error {
                Some(serde_json::Value::String(text)) => Some(text.clone()),
                _ => None,
            })
    }

    fn code(&self) -> Option<String> {
        self.error_code.clone().or_else(|| match &self.code {
            Some(serde_json::Value::String(code)) => Some(code.clone()),
            Some(serde_json::Value::Number(code)) => Some(code.to_string()),
            _ => None,
        })
    }
}

/// Build a `ChatError` from a provider status and raw body, keeping the
/// provider's message text.
pub(crate) fn error_from_body(status: u16, retry_after_secs: Option<u64>, body: &str) -> ChatError {
    let parsed = serde_json::from_str::<ProviderErrorBody>(body).unwrap_or_default();
    let message = parsed
        .message()
        .filter(|text| !text.trim().is_empty())
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                format!("request failed with status {status}")
            } else {
                trimmed.to_owned()
            }
        });
    let code = parsed.code().unwrap_or_else(|| format!("http_{status}"));

    let mut error = ChatError::new(classify_http_status(status), code, message);
    if let Some(secs) = retry_after_secs {
        error = error.with_retry_after(std::time::Duration::from_secs(secs));
    }
    error
}

/// Pass successful responses through, turn the rest into `ChatError`.
pub(crate) async fn check_status(response: Response) -> Result<Response, ChatError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after_secs = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    Err(error_from_body(status.as_u16(), retry_after_secs, &body))
}

pub(crate) async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ChatError> {
    let response = check_status(response).await?;
    let body = response.text().await.map_err(map_reqwest_error)?;
    serde_json::from_str(&body).map_err(|err| {
        ChatError::new(
            ChatErrorCategory::Serialization,
            "decode_error",
            format!("unexpected response body: {err}"),
        )
    })
}

pub(crate) fn map_reqwest_error(err: reqwest::Error) -> ChatError {
    if let Some(status) = err.status() {
        return ChatError::new(
            classify_http_status(status.as_u16()),
            format!("http_{}", status.as_u16()),
            err.to_string(),
        );
    }
    let code = if err.is_timeout() {
        "timeout"
    } else if err.is_decode() {
        "decode_error"
    } else {
        "transport_error"
    };
    let category = if err.is_decode() {
        ChatErrorCategory::Serialization
    } else {
        ChatErrorCategory::Network
    };
    ChatError::new(category, code, err.to_string())
}
