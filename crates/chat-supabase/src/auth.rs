//! Phone one-time-password auth against the project's auth service.

use chat_core::{AuthSession, ChatError};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::http::{SupabaseConfig, authorize, check_status, map_reqwest_error, read_json};

/// Account as reported by the auth service.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub user_metadata: UserMetadata,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct UserMetadata {
    #[serde(default)]
    pub user_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    user: AuthUser,
}

impl TokenResponse {
    fn into_session(self) -> AuthSession {
        session_from_parts(self.access_token, self.refresh_token, self.user)
    }
}

pub(crate) fn session_from_parts(
    access_token: String,
    refresh_token: String,
    user: AuthUser,
) -> AuthSession {
    AuthSession {
        user_id: user.id,
        phone: user.phone.filter(|phone| !phone.trim().is_empty()),
        user_name: user
            .user_metadata
            .user_name
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty()),
        access_token,
        refresh_token,
    }
}

#[derive(Serialize)]
struct OtpRequest<'a> {
    phone: &'a str,
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    phone: &'a str,
    token: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Clone)]
pub struct AuthApi {
    http: Client,
    config: SupabaseConfig,
}

impl AuthApi {
    pub fn new(http: Client, config: SupabaseConfig) -> Self {
        Self { http, config }
    }

    /// Ask the provider to text a code to `phone`.
    pub async fn request_otp(&self, phone: &str) -> Result<(), ChatError> {
        let url = self.config.endpoint("auth/v1/otp")?;
        let response = authorize(self.http.post(url), &self.config, None)
            .json(&OtpRequest { phone })
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(response).await?;
        info!("one-time password requested");
        Ok(())
    }

    pub async fn verify_otp(&self, phone: &str, token: &str) -> Result<AuthSession, ChatError> {
        let url = self.config.endpoint("auth/v1/verify")?;
        let response = authorize(self.http.post(url), &self.config, None)
            .json(&VerifyRequest {
                kind: "sms",
                phone,
                token,
            })
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let tokens: TokenResponse = read_json(response).await?;
        Ok(tokens.into_session())
    }

    pub async fn current_user(&self, access_token: &str) -> Result<AuthUser, ChatError> {
        let url = self.config.endpoint("auth/v1/user")?;
        let response = authorize(self.http.get(url), &self.config, Some(access_token))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        read_json(response).await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<AuthSession, ChatError> {
        let mut url = self.config.endpoint("auth/v1/token")?;
        url.query_pairs_mut()
            .append_pair("grant_type", "refresh_token");
        let response = authorize(self.http.post(url), &self.config, None)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let tokens: TokenResponse = read_json(response).await?;
        Ok(tokens.into_session())
    }

    pub async fn logout(&self, access_token: &str) -> Result<(), ChatError> {
        let url = self.config.endpoint("auth/v1/logout")?;
        let response = authorize(self.http.post(url), &self.config, Some(access_token))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(response).await?;
        Ok(())
    }
}
