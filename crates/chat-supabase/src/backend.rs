use std::{future::Future, time::Duration};

use chat_core::{
    AuthSession, ChatError, ChatErrorCategory, GifItem, GifMode, ImageAttachment, Message,
    MessageId, MessagePatch, NewMessage,
};
use reqwest::Client;
use tokio::sync::mpsc;
use url::Url;

use crate::{
    auth::{AuthApi, AuthUser},
    geo::{DEFAULT_GEO_URL, GeoClient},
    gif::TenorClient,
    http::SupabaseConfig,
    realtime::{RealtimeClient, RealtimeSignal, SubscriptionGuard},
    rest::{MessagesApi, PageQuery},
    storage::StorageApi,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("mambo/", env!("CARGO_PKG_VERSION"));

/// Everything the chat runtime needs from the outside world.
///
/// `access_token` is `None` for anonymous callers.
pub trait ChatBackend: Send + Sync + 'static {
    fn fetch_page(
        &self,
        query: PageQuery,
        access_token: Option<&str>,
    ) -> impl Future<Output = Result<Vec<Message>, ChatError>> + Send;

    fn fetch_message(
        &self,
        id: MessageId,
        access_token: Option<&str>,
    ) -> impl Future<Output = Result<Option<Message>, ChatError>> + Send;

    fn insert_message(
        &self,
        message: &NewMessage,
        access_token: Option<&str>,
    ) -> impl Future<Output = Result<Message, ChatError>> + Send;

    /// `author` limits the write to that user's rows.
    fn update_message(
        &self,
        id: MessageId,
        patch: &MessagePatch,
        author: Option<&str>,
        access_token: Option<&str>,
    ) -> impl Future<Output = Result<Message, ChatError>> + Send;

    /// Returns the public URL of the stored object.
    fn upload_image(
        &self,
        bucket: &str,
        attachment: &ImageAttachment,
        access_token: Option<&str>,
    ) -> impl Future<Output = Result<String, ChatError>> + Send;

    fn subscribe(
        &self,
        access_token: Option<&str>,
        signals: mpsc::Sender<RealtimeSignal>,
    ) -> impl Future<Output = Result<SubscriptionGuard, ChatError>> + Send;

    fn request_otp(&self, phone: &str) -> impl Future<Output = Result<(), ChatError>> + Send;

    fn verify_otp(
        &self,
        phone: &str,
        token: &str,
    ) -> impl Future<Output = Result<AuthSession, ChatError>> + Send;

    fn current_user(
        &self,
        access_token: &str,
    ) -> impl Future<Output = Result<AuthUser, ChatError>> + Send;

    fn refresh_session(
        &self,
        refresh_token: &str,
    ) -> impl Future<Output = Result<AuthSession, ChatError>> + Send;

    fn logout(&self, access_token: &str) -> impl Future<Output = Result<(), ChatError>> + Send;

    fn gifs(
        &self,
        mode: &GifMode,
        limit: u8,
    ) -> impl Future<Output = Result<Vec<GifItem>, ChatError>> + Send;

    fn detect_country(&self) -> impl Future<Output = Result<Option<String>, ChatError>> + Send;
}

/// Settings for the HTTP/websocket backend.
#[derive(Debug, Clone)]
pub struct SupabaseBackendConfig {
    pub project: SupabaseConfig,
    pub tenor_api_key: Option<String>,
    pub geo_url: Option<Url>,
}

#[derive(Debug, Clone)]
pub struct SupabaseBackend {
    messages: MessagesApi,
    auth: AuthApi,
    storage: StorageApi,
    realtime: RealtimeClient,
    gifs: Option<TenorClient>,
    geo: GeoClient,
}

impl SupabaseBackend {
    pub fn new(config: SupabaseBackendConfig) -> Result<Self, ChatError> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| {
                ChatError::new(ChatErrorCategory::Config, "http_client_build_error", err.to_string())
            })?;

        let geo_url = match config.geo_url {
            Some(url) => url,
            None => Url::parse(DEFAULT_GEO_URL).map_err(|err| {
                ChatError::new(ChatErrorCategory::Internal, "invalid_geo_url", err.to_string())
            })?,
        };
        let gifs = config
            .tenor_api_key
            .filter(|key| !key.trim().is_empty())
            .map(|key| TenorClient::new(http.clone(), key))
            .transpose()?;

        Ok(Self {
            messages: MessagesApi::new(http.clone(), config.project.clone()),
            auth: AuthApi::new(http.clone(), config.project.clone()),
            storage: StorageApi::new(http.clone(), config.project.clone()),
            realtime: RealtimeClient::new(config.project),
            gifs,
            geo: GeoClient::new(http, geo_url),
        })
    }
}

impl ChatBackend for SupabaseBackend {
    async fn fetch_page(
        &self,
        query: PageQuery,
        access_token: Option<&str>,
    ) -> Result<Vec<Message>, ChatError> {
        self.messages.fetch_page(query, access_token).await
    }

    async fn fetch_message(
        &self,
        id: MessageId,
        access_token: Option<&str>,
    ) -> Result<Option<Message>, ChatError> {
        self.messages.fetch_one(id, access_token).await
    }

    async fn insert_message(
        &self,
        message: &NewMessage,
        access_token: Option<&str>,
    ) -> Result<Message, ChatError> {
        self.messages.insert(message, access_token).await
    }

    async fn update_message(
        &self,
        id: MessageId,
        patch: &MessagePatch,
        author: Option<&str>,
        access_token: Option<&str>,
    ) -> Result<Message, ChatError> {
        self.messages.update(id, patch, author, access_token).await
    }

    async fn upload_image(
        &self,
        bucket: &str,
        attachment: &ImageAttachment,
        access_token: Option<&str>,
    ) -> Result<String, ChatError> {
        self.storage
            .upload_image(bucket, attachment, access_token)
            .await
    }

    async fn subscribe(
        &self,
        access_token: Option<&str>,
        signals: mpsc::Sender<RealtimeSignal>,
    ) -> Result<SubscriptionGuard, ChatError> {
        self.realtime.subscribe(access_token, signals).await
    }

    async fn request_otp(&self, phone: &str) -> Result<(), ChatError> {
        self.auth.request_otp(phone).await
    }

    async fn verify_otp(&self, phone: &str, token: &str) -> Result<AuthSession, ChatError> {
        self.auth.verify_otp(phone, token).await
    }

    async fn current_user(&self, access_token: &str) -> Result<AuthUser, ChatError> {
        self.auth.current_user(access_token).await
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<AuthSession, ChatError> {
        self.auth.refresh(refresh_token).await
    }

    async fn logout(&self, access_token: &str) -> Result<(), ChatError> {
        self.auth.logout(access_token).await
    }

    async fn gifs(&self, mode: &GifMode, limit: u8) -> Result<Vec<GifItem>, ChatError> {
        let Some(client) = &self.gifs else {
            return Err(ChatError::new(
                ChatErrorCategory::Config,
                "gif_provider_not_configured",
                "no GIF provider key is configured",
            ));
        };
        client.fetch(mode, limit).await
    }

    async fn detect_country(&self) -> Result<Option<String>, ChatError> {
        self.geo.country_code().await
    }
}
