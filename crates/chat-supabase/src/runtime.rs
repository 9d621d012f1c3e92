use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use chat_core::{
    AuthSession, AuthorStamp, ChatChannelError, ChatChannels, ChatCommand, ChatError,
    ChatErrorCategory, ChatEvent, ChatInitConfig, ChatLifecycleState, ChatStateMachine,
    DraftContent, EventStream, GifMode, GifResults, Identity, MessageId, MessagePatch,
    MessageTimeline, MutationKind, Notification, OutgoingDraft, SendOutcome, SubscriptionStatus,
    compose_message, error_notification, normalize_mutation_outcome, normalize_send_outcome,
    validate_draft, validate_edit_text,
};
use chat_platform::{DeviceProfile, StoreError};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    backend::ChatBackend,
    gif::DEFAULT_GIF_LIMIT,
    realtime::{RealtimeSignal, SubscriptionGuard},
    rest::PageQuery,
    storage::DEFAULT_IMAGE_BUCKET,
};

pub const DEFAULT_PAGE_SIZE: u16 = 50;
const SERVER_PAGE_LIMIT_CAP: u16 = 100;
const SIGNAL_BUFFER: usize = 256;

#[derive(Clone, Debug)]
pub struct ChatRuntimeHandle {
    channels: ChatChannels,
}

impl ChatRuntimeHandle {
    pub async fn send(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

/// Start the command loop on the current tokio runtime.
pub fn spawn_runtime<B: ChatBackend>(backend: Arc<B>, profile: DeviceProfile) -> ChatRuntimeHandle {
    let (channels, command_rx) = ChatChannels::new(128, 512);
    let runtime = ChatRuntime::new(channels.clone(), command_rx, backend, profile);
    tokio::spawn(async move {
        runtime.run().await;
    });

    ChatRuntimeHandle { channels }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RuntimeSettings {
    page_size: u16,
    gif_limit: u8,
    image_bucket: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            gif_limit: DEFAULT_GIF_LIMIT,
            image_bucket: DEFAULT_IMAGE_BUCKET.to_owned(),
        }
    }
}

impl RuntimeSettings {
    fn apply(&mut self, config: &ChatInitConfig) {
        if let Some(page_size) = config.page_size {
            self.page_size = MessageTimeline::bounded_page_size(page_size, SERVER_PAGE_LIMIT_CAP);
        }
        if let Some(gif_limit) = config.gif_limit {
            self.gif_limit = gif_limit.max(1);
        }
        if let Some(bucket) = config
            .image_bucket
            .as_deref()
            .map(str::trim)
            .filter(|bucket| !bucket.is_empty())
        {
            self.image_bucket = bucket.to_owned();
        }
    }
}

struct ChatRuntime<B: ChatBackend> {
    channels: ChatChannels,
    command_rx: mpsc::Receiver<ChatCommand>,
    state_machine: ChatStateMachine,
    backend: Arc<B>,
    profile: DeviceProfile,
    settings: RuntimeSettings,
    identity: Option<Identity>,
    country: Option<String>,
    subscription: Option<SubscriptionGuard>,
    signal_rx: Option<mpsc::Receiver<RealtimeSignal>>,
}

impl<B: ChatBackend> ChatRuntime<B> {
    fn new(
        channels: ChatChannels,
        command_rx: mpsc::Receiver<ChatCommand>,
        backend: Arc<B>,
        profile: DeviceProfile,
    ) -> Self {
        Self {
            channels,
            command_rx,
            state_machine: ChatStateMachine::default(),
            backend,
            profile,
            settings: RuntimeSettings::default(),
            identity: None,
            country: None,
            subscription: None,
            signal_rx: None,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else { break };
                    if let Err(err) = self.handle_command(command).await {
                        warn!(code = %err.code, message = %err.message, "command failed");
                        self.channels.emit(error_notification("Request failed", &err));
                    }
                }
                signal = next_signal(&mut self.signal_rx) => {
                    self.handle_signal(signal).await;
                }
            }
        }

        if let Some(subscription) = self.subscription.take() {
            subscription.stop().await;
        }
        debug!("chat runtime stopped");
    }

    async fn handle_command(&mut self, command: ChatCommand) -> Result<(), ChatError> {
        match command {
            ChatCommand::Init { config } => self.handle_init(config),
            ChatCommand::RestoreIdentity => self.handle_restore_identity().await,
            ChatCommand::ResolveCountry => self.handle_resolve_country().await,
            ChatCommand::Connect => self.handle_connect(ChatCommand::Connect).await,
            ChatCommand::Reconnect => self.handle_connect(ChatCommand::Reconnect).await,
            ChatCommand::LoadOlder { before, limit } => {
                self.handle_load_older(before, limit).await
            }
            ChatCommand::SendMessage {
                client_txn_id,
                draft,
            } => {
                self.handle_send_message(client_txn_id, draft).await;
                Ok(())
            }
            ChatCommand::EditMessage {
                client_txn_id,
                message_id,
                new_text,
            } => {
                self.handle_edit_message(client_txn_id, message_id, new_text)
                    .await;
                Ok(())
            }
            ChatCommand::DeleteMessage {
                client_txn_id,
                message_id,
            } => {
                self.handle_delete_message(client_txn_id, message_id).await;
                Ok(())
            }
            ChatCommand::AddReaction {
                client_txn_id,
                message_id,
                emoji,
            } => {
                self.handle_add_reaction(client_txn_id, message_id, emoji)
                    .await;
                Ok(())
            }
            ChatCommand::FetchMessage { message_id } => {
                self.handle_fetch_message(message_id).await
            }
            ChatCommand::TrendingGifs => self.handle_gifs(GifMode::Trending).await,
            ChatCommand::SearchGifs { query } => {
                let mode = if query.trim().is_empty() {
                    GifMode::Trending
                } else {
                    GifMode::Search {
                        query: query.trim().to_owned(),
                    }
                };
                self.handle_gifs(mode).await
            }
            ChatCommand::RequestOtp { phone } => self.handle_request_otp(phone).await,
            ChatCommand::VerifyOtp { phone, token } => self.handle_verify_otp(phone, token).await,
            ChatCommand::SetUsername { username } => self.handle_set_username(username),
            ChatCommand::Logout => self.handle_logout().await,
        }
    }

    fn handle_init(&mut self, config: Option<ChatInitConfig>) -> Result<(), ChatError> {
        let (candidate, transition_events) =
            self.validate_transition(&ChatCommand::Init { config: None })?;

        if let Some(config) = config.as_ref() {
            self.settings.apply(config);
        }
        info!(
            page_size = self.settings.page_size,
            gif_limit = self.settings.gif_limit,
            bucket = %self.settings.image_bucket,
            "chat runtime initialized"
        );

        self.commit_transition(candidate, transition_events);
        Ok(())
    }

    async fn handle_restore_identity(&mut self) -> Result<(), ChatError> {
        self.validate_transition(&ChatCommand::RestoreIdentity)?;

        let saved = self
            .profile
            .session::<AuthSession>()
            .map_err(|err| map_store_error("load_session", err))?;
        let identity = match saved {
            Some(session) => match self.revalidate_session(session).await {
                Some(session) => self.authenticated_identity(session)?,
                None => self.anonymous_identity()?,
            },
            None => self.anonymous_identity()?,
        };

        self.set_identity(identity);
        Ok(())
    }

    /// Check a saved session, refreshing it when the access token expired.
    /// Returns `None` when the session is no longer usable.
    async fn revalidate_session(&self, session: AuthSession) -> Option<AuthSession> {
        match self.backend.current_user(&session.access_token).await {
            Ok(user) => {
                let mut session = session;
                session.phone = user.phone.or(session.phone);
                if let Some(name) = user
                    .user_metadata
                    .user_name
                    .filter(|name| !name.trim().is_empty())
                {
                    session.user_name = Some(name);
                }
                Some(session)
            }
            Err(err) if err.is_auth() => {
                debug!("saved access token rejected; refreshing session");
                match self.backend.refresh_session(&session.refresh_token).await {
                    Ok(refreshed) => {
                        if let Err(err) = self.profile.save_session(&refreshed) {
                            warn!(error = %err, "failed to persist refreshed session");
                        }
                        Some(refreshed)
                    }
                    Err(err) => {
                        warn!(code = %err.code, "session refresh failed; continuing anonymously");
                        if let Err(err) = self.profile.clear_session() {
                            warn!(error = %err, "failed to clear stale session");
                        }
                        None
                    }
                }
            }
            Err(err) => {
                warn!(code = %err.code, "could not validate saved session; keeping it");
                Some(session)
            }
        }
    }

    async fn handle_resolve_country(&mut self) -> Result<(), ChatError> {
        self.validate_transition(&ChatCommand::ResolveCountry)?;

        let cached = self
            .profile
            .country_code()
            .map_err(|err| map_store_error("load_country", err))?;
        if let Some(code) = cached {
            self.country = Some(code.clone());
            self.channels.emit(ChatEvent::CountryResolved { country_code: code });
            return Ok(());
        }

        match self.backend.detect_country().await {
            Ok(Some(code)) => {
                if let Err(err) = self.profile.set_country_code(&code) {
                    warn!(error = %err, "failed to cache country code");
                }
                info!(country = %code, "country detected");
                self.country = Some(code.clone());
                self.channels.emit(ChatEvent::CountryResolved { country_code: code });
            }
            Ok(None) => debug!("geolocation returned no country"),
            Err(err) => warn!(message = %err.message, "error getting location"),
        }
        Ok(())
    }

    async fn handle_connect(&mut self, command: ChatCommand) -> Result<(), ChatError> {
        let (candidate, transition_events) = self.validate_transition(&command)?;
        self.commit_transition(candidate, transition_events);

        if let Some(previous) = self.subscription.take() {
            previous.stop().await;
        }
        self.signal_rx = None;

        let access_token = self.access_token();

        // Subscribe before the fetch so changes racing the page are queued.
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);
        let subscribed = match self
            .backend
            .subscribe(access_token.as_deref(), signal_tx)
            .await
        {
            Ok(guard) => {
                self.subscription = Some(guard);
                self.signal_rx = Some(signal_rx);
                true
            }
            Err(err) => {
                error!(code = %err.code, message = %err.message, "realtime subscription failed");
                self.channels
                    .emit(error_notification("Could not subscribe to new messages", &err));
                false
            }
        };

        let limit = self.settings.page_size;
        let page = self
            .backend
            .fetch_page(
                PageQuery {
                    before: None,
                    limit,
                },
                access_token.as_deref(),
            )
            .await;

        let loaded = match page {
            Ok(messages) => {
                info!(count = messages.len(), "initial page loaded");
                self.channels.emit(ChatEvent::InitialPage {
                    messages,
                    requested: limit,
                });
                true
            }
            Err(err) => {
                error!(code = %err.code, message = %err.message, "initial load failed");
                self.channels.emit(ChatEvent::PageFailed {
                    before: None,
                    error_message: err.message.clone(),
                });
                self.channels
                    .emit(error_notification("Failed to load messages", &err));
                false
            }
        };

        let live = loaded && subscribed;
        if !live && let Some(guard) = self.subscription.take() {
            guard.stop().await;
            self.signal_rx = None;
        }

        self.channels
            .emit(ChatEvent::SubscriptionStatus(SubscriptionStatus {
                connected: live,
            }));
        let event = self.state_machine.on_connect_result(live)?;
        self.channels.emit(event);
        Ok(())
    }

    async fn handle_load_older(&mut self, before: MessageId, limit: u16) -> Result<(), ChatError> {
        self.validate_transition(&ChatCommand::LoadOlder { before, limit })?;

        let bounded = MessageTimeline::bounded_page_size(limit, SERVER_PAGE_LIMIT_CAP);
        let access_token = self.access_token();
        match self
            .backend
            .fetch_page(
                PageQuery {
                    before: Some(before),
                    limit: bounded,
                },
                access_token.as_deref(),
            )
            .await
        {
            Ok(messages) => {
                debug!(before, count = messages.len(), "older page loaded");
                self.channels.emit(ChatEvent::OlderPage {
                    before,
                    messages,
                    requested: bounded,
                });
            }
            Err(err) => {
                warn!(before, code = %err.code, "older page failed");
                self.channels.emit(ChatEvent::PageFailed {
                    before: Some(before),
                    error_message: err.message.clone(),
                });
                self.channels
                    .emit(error_notification("Failed to load older messages", &err));
            }
        }
        Ok(())
    }

    async fn handle_send_message(&mut self, client_txn_id: String, draft: OutgoingDraft) {
        let outcome = match self.send_draft(&draft).await {
            Ok(message_id) => SendOutcome::Success { message_id },
            Err((title, error)) => {
                warn!(txn = %client_txn_id, code = %error.code, "send failed");
                self.channels.emit(error_notification(title, &error));
                SendOutcome::Failure { error }
            }
        };
        self.channels
            .emit(normalize_send_outcome(client_txn_id, outcome));
    }

    async fn send_draft(
        &mut self,
        draft: &OutgoingDraft,
    ) -> Result<MessageId, (&'static str, ChatError)> {
        const SEND_FAILED: &str = "Error sending message";

        self.validate_transition(&ChatCommand::SendMessage {
            client_txn_id: String::new(),
            draft: OutgoingDraft {
                content: DraftContent::Text(String::new()),
                reply_to: None,
            },
        })
        .map_err(|err| (SEND_FAILED, err))?;
        validate_draft(draft).map_err(|err| (SEND_FAILED, err.into()))?;

        let author = self.author_stamp().map_err(|err| (SEND_FAILED, err))?;
        let access_token = self.access_token();

        let uploaded_url = match &draft.content {
            DraftContent::Image { attachment, .. } => Some(
                self.backend
                    .upload_image(
                        &self.settings.image_bucket,
                        attachment,
                        access_token.as_deref(),
                    )
                    .await
                    .map_err(|err| ("Image upload failed", err))?,
            ),
            DraftContent::Text(_) | DraftContent::Gif { .. } => None,
        };

        let new_message = compose_message(draft, &author, uploaded_url.as_deref())
            .map_err(|err| (SEND_FAILED, err.into()))?;
        let stored = self
            .backend
            .insert_message(&new_message, access_token.as_deref())
            .await
            .map_err(|err| (SEND_FAILED, err))?;

        info!(message_id = stored.id, "message sent");
        Ok(stored.id)
    }

    async fn handle_edit_message(
        &mut self,
        client_txn_id: String,
        message_id: MessageId,
        new_text: String,
    ) {
        let result = self.edit_message(message_id, &new_text).await;
        self.finish_mutation(
            client_txn_id,
            message_id,
            MutationKind::Edit,
            result,
            "Error editing message",
        );
    }

    async fn edit_message(&mut self, message_id: MessageId, new_text: &str) -> Result<(), ChatError> {
        self.validate_transition(&ChatCommand::EditMessage {
            client_txn_id: String::new(),
            message_id,
            new_text: String::new(),
        })?;
        let text = validate_edit_text(new_text)?;
        let author = self.author_stamp()?;
        let access_token = self.access_token();
        self.backend
            .update_message(
                message_id,
                &MessagePatch::edit(text, Utc::now()),
                Some(&author.username),
                access_token.as_deref(),
            )
            .await?;
        Ok(())
    }

    async fn handle_delete_message(&mut self, client_txn_id: String, message_id: MessageId) {
        let result = self.delete_message(message_id).await;
        self.finish_mutation(
            client_txn_id,
            message_id,
            MutationKind::Delete,
            result,
            "Error deleting message",
        );
    }

    async fn delete_message(&mut self, message_id: MessageId) -> Result<(), ChatError> {
        self.validate_transition(&ChatCommand::DeleteMessage {
            client_txn_id: String::new(),
            message_id,
        })?;
        let author = self.author_stamp()?;
        let access_token = self.access_token();
        self.backend
            .update_message(
                message_id,
                &MessagePatch::delete(Utc::now()),
                Some(&author.username),
                access_token.as_deref(),
            )
            .await?;
        Ok(())
    }

    async fn handle_add_reaction(
        &mut self,
        client_txn_id: String,
        message_id: MessageId,
        emoji: String,
    ) {
        let result = self.add_reaction(message_id, &emoji).await;
        self.finish_mutation(
            client_txn_id,
            message_id,
            MutationKind::Reaction,
            result,
            "Error adding reaction",
        );
    }

    /// Read the current map, add the viewer, write the whole map back.
    async fn add_reaction(&mut self, message_id: MessageId, emoji: &str) -> Result<(), ChatError> {
        self.validate_transition(&ChatCommand::AddReaction {
            client_txn_id: String::new(),
            message_id,
            emoji: String::new(),
        })?;
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Err(ChatError::new(
                ChatErrorCategory::Config,
                "invalid_reaction",
                "reaction emoji is empty",
            ));
        }
        let author = self.author_stamp()?;
        let access_token = self.access_token();

        let message = self
            .backend
            .fetch_message(message_id, access_token.as_deref())
            .await?
            .ok_or_else(|| {
                ChatError::new(
                    ChatErrorCategory::Config,
                    "message_not_found",
                    format!("message {message_id} does not exist"),
                )
            })?;
        let mut reactions = message.reactions;
        if !reactions.add(emoji, &author.username) {
            return Ok(());
        }
        self.backend
            .update_message(
                message_id,
                &MessagePatch::reactions(reactions),
                None,
                access_token.as_deref(),
            )
            .await?;
        Ok(())
    }

    async fn handle_fetch_message(&mut self, message_id: MessageId) -> Result<(), ChatError> {
        self.validate_transition(&ChatCommand::FetchMessage { message_id })?;
        // A failed lookup resolves as missing.
        let message = match self
            .backend
            .fetch_message(message_id, self.access_token().as_deref())
            .await
        {
            Ok(message) => message,
            Err(err) => {
                warn!(message_id, code = %err.code, message = %err.message, "reply target fetch failed");
                None
            }
        };
        self.channels.emit(ChatEvent::MessageFetched {
            message_id,
            message,
        });
        Ok(())
    }

    async fn handle_gifs(&mut self, mode: GifMode) -> Result<(), ChatError> {
        self.validate_transition(&ChatCommand::TrendingGifs)?;
        match self.backend.gifs(&mode, self.settings.gif_limit).await {
            Ok(items) => {
                self.channels
                    .emit(ChatEvent::GifResults(GifResults { mode, items }));
            }
            Err(err) => {
                warn!(?mode, code = %err.code, "error fetching gifs");
                self.channels
                    .emit(error_notification("Error fetching GIFs", &err));
            }
        }
        Ok(())
    }

    async fn handle_request_otp(&mut self, phone: String) -> Result<(), ChatError> {
        self.validate_transition(&ChatCommand::RequestOtp {
            phone: String::new(),
        })?;
        let phone = phone.trim().to_owned();
        match self.backend.request_otp(&phone).await {
            Ok(()) => {
                self.channels.emit(ChatEvent::OtpRequested {
                    phone,
                    success: true,
                    error_message: None,
                });
                self.channels.emit(ChatEvent::Notification(Notification::success(
                    "OTP sent",
                    Some("Check your phone.".to_owned()),
                )));
            }
            Err(err) => {
                self.channels.emit(ChatEvent::OtpRequested {
                    phone,
                    success: false,
                    error_message: Some(err.message.clone()),
                });
                self.channels
                    .emit(error_notification("Error sending OTP", &err));
            }
        }
        Ok(())
    }

    async fn handle_verify_otp(&mut self, phone: String, token: String) -> Result<(), ChatError> {
        self.validate_transition(&ChatCommand::VerifyOtp {
            phone: String::new(),
            token: String::new(),
        })?;

        let session = match self.backend.verify_otp(phone.trim(), token.trim()).await {
            Ok(session) => session,
            Err(err) => {
                self.channels.emit(ChatEvent::AuthResult {
                    success: false,
                    error_message: Some(err.message.clone()),
                });
                self.channels
                    .emit(error_notification("Verification failed", &err));
                return Ok(());
            }
        };

        self.profile
            .save_session(&session)
            .map_err(|err| map_store_error("save_session", err))?;
        let identity = self.authenticated_identity(session)?;
        info!(username = identity.username(), "logged in");
        self.set_identity(identity);

        self.channels.emit(ChatEvent::AuthResult {
            success: true,
            error_message: None,
        });
        self.channels.emit(ChatEvent::Notification(Notification::success(
            "Logged in successfully",
            None,
        )));
        Ok(())
    }

    fn handle_set_username(&mut self, username: String) -> Result<(), ChatError> {
        self.validate_transition(&ChatCommand::SetUsername {
            username: String::new(),
        })?;

        if self
            .identity
            .as_ref()
            .is_some_and(Identity::is_authenticated)
        {
            return Err(ChatError::new(
                ChatErrorCategory::Config,
                "username_locked",
                "log out to change the device username",
            ));
        }
        let username = username.trim();
        if username.is_empty() {
            return Err(ChatError::new(
                ChatErrorCategory::Config,
                "invalid_username",
                "username cannot be empty",
            ));
        }

        self.profile
            .set_username(username)
            .map_err(|err| map_store_error("save_username", err))?;
        self.set_identity(Identity::Anonymous {
            username: username.to_owned(),
        });
        Ok(())
    }

    async fn handle_logout(&mut self) -> Result<(), ChatError> {
        self.validate_transition(&ChatCommand::Logout)?;

        if let Some(token) = self.access_token() {
            match self.backend.logout(&token).await {
                Ok(()) => {}
                Err(err) if err.is_auth() => {
                    debug!("session already invalid at logout");
                }
                Err(err) => {
                    self.channels.emit(error_notification("Logout error", &err));
                    return Ok(());
                }
            }
        }

        self.profile
            .clear_session()
            .map_err(|err| map_store_error("clear_session", err))?;
        let username = self
            .profile
            .reset_username(now_millis())
            .map_err(|err| map_store_error("save_username", err))?;
        info!(username = %username, "logged out");
        self.set_identity(Identity::Anonymous { username });
        Ok(())
    }

    async fn handle_signal(&mut self, signal: Option<RealtimeSignal>) {
        match signal {
            Some(RealtimeSignal::Change(change)) => {
                self.channels.emit(ChatEvent::Change(change));
            }
            Some(RealtimeSignal::Closed { reason }) => self.on_subscription_closed(reason).await,
            None => {
                self.on_subscription_closed("subscription task ended".to_owned())
                    .await
            }
        }
    }

    async fn on_subscription_closed(&mut self, reason: String) {
        self.signal_rx = None;
        if let Some(guard) = self.subscription.take() {
            guard.stop().await;
        }
        warn!(reason = %reason, "realtime subscription lost");

        self.channels
            .emit(ChatEvent::SubscriptionStatus(SubscriptionStatus {
                connected: false,
            }));
        if self.state_machine.state() == ChatLifecycleState::Live {
            match self.state_machine.on_subscription_lost() {
                Ok(event) => self.channels.emit(event),
                Err(err) => warn!(code = %err.code, "unexpected state on subscription loss"),
            }
            self.channels.emit(ChatEvent::Notification(Notification::error(
                "Connection lost",
                reason,
            )));
        }
    }

    fn finish_mutation(
        &self,
        client_txn_id: String,
        message_id: MessageId,
        kind: MutationKind,
        result: Result<(), ChatError>,
        failure_title: &str,
    ) {
        if let Err(err) = &result {
            warn!(message_id, ?kind, code = %err.code, "mutation failed");
            self.channels.emit(error_notification(failure_title, err));
        }
        self.channels.emit(normalize_mutation_outcome(
            client_txn_id,
            message_id,
            kind,
            result,
        ));
    }

    fn validate_transition(
        &self,
        command: &ChatCommand,
    ) -> Result<(ChatStateMachine, Vec<ChatEvent>), ChatError> {
        let mut candidate = self.state_machine.clone();
        let events = candidate.apply(command)?;
        Ok((candidate, events))
    }

    fn commit_transition(&mut self, candidate: ChatStateMachine, events: Vec<ChatEvent>) {
        self.state_machine = candidate;
        for event in events {
            self.channels.emit(event);
        }
    }

    fn access_token(&self) -> Option<String> {
        self.identity
            .as_ref()
            .and_then(Identity::access_token)
            .map(str::to_owned)
    }

    fn author_stamp(&mut self) -> Result<AuthorStamp, ChatError> {
        let identity = match &self.identity {
            Some(identity) => identity.clone(),
            None => {
                let identity = self.anonymous_identity()?;
                self.set_identity(identity.clone());
                identity
            }
        };
        Ok(AuthorStamp {
            username: identity.username().to_owned(),
            country: self.country.clone(),
            is_authenticated: identity.is_authenticated(),
        })
    }

    fn anonymous_identity(&self) -> Result<Identity, ChatError> {
        let username = self
            .profile
            .ensure_username(now_millis())
            .map_err(|err| map_store_error("load_username", err))?;
        Ok(Identity::Anonymous { username })
    }

    /// The account's display name wins; the device name is the fallback.
    fn authenticated_identity(&self, session: AuthSession) -> Result<Identity, ChatError> {
        let username = match session.user_name.clone() {
            Some(name) => {
                self.profile
                    .set_username(&name)
                    .map_err(|err| map_store_error("save_username", err))?;
                name
            }
            None => self
                .profile
                .ensure_username(now_millis())
                .map_err(|err| map_store_error("load_username", err))?,
        };
        Ok(Identity::Authenticated { session, username })
    }

    fn set_identity(&mut self, identity: Identity) {
        self.channels.emit(ChatEvent::IdentityChanged {
            identity: identity.summary(),
        });
        self.identity = Some(identity);
    }
}

async fn next_signal(rx: &mut Option<mpsc::Receiver<RealtimeSignal>>) -> Option<RealtimeSignal> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

fn map_store_error(operation: &str, err: StoreError) -> ChatError {
    match err {
        StoreError::Unavailable(message) => ChatError::new(
            ChatErrorCategory::Storage,
            "device_store_unavailable",
            format!("device store unavailable during {operation}: {message}"),
        ),
        StoreError::Backend(message) => ChatError::new(
            ChatErrorCategory::Storage,
            "device_store_error",
            format!("device store error during {operation}: {message}"),
        ),
        StoreError::Malformed { key, reason } => ChatError::new(
            ChatErrorCategory::Serialization,
            "device_store_malformed",
            format!("stored value '{key}' is malformed during {operation}: {reason}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Mutex, time::Duration};

    use chat_core::{
        ChangeEvent, ChangeKind, GifItem, ImageAttachment, Message, NewMessage,
        NotificationLevel, ReactionMap,
    };
    use chat_platform::{InMemoryKeyValueStore, KeyValueStore};
    use chrono::TimeZone;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::auth::{AuthUser, UserMetadata};

    fn row(id: MessageId, username: &str, text: &str) -> Message {
        Message {
            id,
            text: Some(text.to_owned()),
            gif_url: None,
            image_url: None,
            username: username.to_owned(),
            country: None,
            is_authenticated: false,
            reply_to: None,
            is_deleted: false,
            is_updated: false,
            updated_at: None,
            timestamp: Utc
                .timestamp_opt(1_714_557_600 + id, 0)
                .single()
                .expect("valid timestamp"),
            reactions: ReactionMap::new(),
        }
    }

    fn session(access: &str) -> AuthSession {
        AuthSession {
            user_id: "u-1".into(),
            phone: Some("254700000000".into()),
            user_name: Some("@amani".into()),
            access_token: access.into(),
            refresh_token: "refresh-1".into(),
        }
    }

    #[derive(Default)]
    struct FakeState {
        rows: BTreeMap<MessageId, Message>,
        page_queries: Vec<PageQuery>,
        inserted: Vec<NewMessage>,
        updates: Vec<(MessageId, MessagePatch, Option<String>)>,
        uploads: Vec<String>,
        signals: Option<mpsc::Sender<RealtimeSignal>>,
        subscribe_calls: usize,
        fail_fetch: bool,
        fail_fetch_message: bool,
        fail_upload: bool,
        fail_subscribe: bool,
        valid_access_token: Option<String>,
        country: Option<String>,
        geo_calls: usize,
    }

    #[derive(Default)]
    struct FakeBackend {
        state: Mutex<FakeState>,
    }

    impl FakeBackend {
        fn with_rows(rows: impl IntoIterator<Item = Message>) -> Arc<Self> {
            let backend = Self::default();
            backend.lock().rows = rows.into_iter().map(|m| (m.id, m)).collect();
            Arc::new(backend)
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
            self.state.lock().expect("fake backend lock poisoned")
        }

        async fn push(&self, signal: RealtimeSignal) {
            let tx = self.lock().signals.clone().expect("subscribed");
            tx.send(signal).await.expect("runtime listening");
        }
    }

    fn provider_error(status: u16, message: &str) -> ChatError {
        ChatError::new(
            chat_core::classify_http_status(status),
            format!("http_{status}"),
            message,
        )
    }

    impl ChatBackend for FakeBackend {
        async fn fetch_page(
            &self,
            query: PageQuery,
            _access_token: Option<&str>,
        ) -> Result<Vec<Message>, ChatError> {
            let mut state = self.lock();
            state.page_queries.push(query);
            if state.fail_fetch {
                return Err(provider_error(503, "upstream unavailable"));
            }
            Ok(state
                .rows
                .values()
                .rev()
                .filter(|m| query.before.is_none_or(|before| m.id < before))
                .take(usize::from(query.limit))
                .cloned()
                .collect())
        }

        async fn fetch_message(
            &self,
            id: MessageId,
            _access_token: Option<&str>,
        ) -> Result<Option<Message>, ChatError> {
            let state = self.lock();
            if state.fail_fetch_message {
                return Err(provider_error(500, "lookup failed"));
            }
            Ok(state.rows.get(&id).cloned())
        }

        async fn insert_message(
            &self,
            message: &NewMessage,
            _access_token: Option<&str>,
        ) -> Result<Message, ChatError> {
            let mut state = self.lock();
            let id = state.rows.keys().next_back().copied().unwrap_or(0) + 1;
            let mut stored = row(id, &message.username, message.text.as_deref().unwrap_or(""));
            stored.text = message.text.clone();
            stored.gif_url = message.gif_url.clone();
            stored.image_url = message.image_url.clone();
            stored.country = message.country.clone();
            stored.is_authenticated = message.is_authenticated;
            state.rows.insert(id, stored.clone());
            state.inserted.push(message.clone());
            Ok(stored)
        }

        async fn update_message(
            &self,
            id: MessageId,
            patch: &MessagePatch,
            author: Option<&str>,
            _access_token: Option<&str>,
        ) -> Result<Message, ChatError> {
            let mut state = self.lock();
            state
                .updates
                .push((id, patch.clone(), author.map(str::to_owned)));
            let row = state
                .rows
                .get_mut(&id)
                .filter(|row| author.is_none_or(|author| row.username == author))
                .ok_or_else(|| {
                    ChatError::new(ChatErrorCategory::Auth, "message_not_writable", "not yours")
                })?;
            if let Some(reactions) = &patch.reactions {
                row.reactions = reactions.clone();
            }
            if let Some(text) = &patch.text {
                row.text = Some(text.clone());
            }
            Ok(row.clone())
        }

        async fn upload_image(
            &self,
            bucket: &str,
            attachment: &ImageAttachment,
            _access_token: Option<&str>,
        ) -> Result<String, ChatError> {
            let mut state = self.lock();
            if state.fail_upload {
                return Err(provider_error(413, "The object exceeded the maximum allowed size"));
            }
            let url = format!("https://cdn.test/{bucket}/{}", attachment.file_name);
            state.uploads.push(url.clone());
            Ok(url)
        }

        async fn subscribe(
            &self,
            _access_token: Option<&str>,
            signals: mpsc::Sender<RealtimeSignal>,
        ) -> Result<SubscriptionGuard, ChatError> {
            let mut state = self.lock();
            state.subscribe_calls += 1;
            if state.fail_subscribe {
                return Err(provider_error(503, "realtime unavailable"));
            }
            state.signals = Some(signals);
            Ok(SubscriptionGuard::detached(CancellationToken::new()))
        }

        async fn request_otp(&self, phone: &str) -> Result<(), ChatError> {
            if phone.starts_with('+') {
                Ok(())
            } else {
                Err(provider_error(422, "Invalid phone number format"))
            }
        }

        async fn verify_otp(&self, _phone: &str, token: &str) -> Result<AuthSession, ChatError> {
            if token == "123456" {
                Ok(session("access-1"))
            } else {
                Err(provider_error(403, "Token has expired or is invalid"))
            }
        }

        async fn current_user(&self, access_token: &str) -> Result<AuthUser, ChatError> {
            if self.lock().valid_access_token.as_deref() == Some(access_token) {
                Ok(AuthUser {
                    id: "u-1".into(),
                    phone: Some("254700000000".into()),
                    user_metadata: UserMetadata {
                        user_name: Some("@amani".into()),
                    },
                })
            } else {
                Err(provider_error(401, "invalid JWT"))
            }
        }

        async fn refresh_session(&self, refresh_token: &str) -> Result<AuthSession, ChatError> {
            if refresh_token == "refresh-1" {
                Ok(session("access-2"))
            } else {
                Err(provider_error(400, "Invalid Refresh Token"))
            }
        }

        async fn logout(&self, _access_token: &str) -> Result<(), ChatError> {
            Ok(())
        }

        async fn gifs(&self, mode: &GifMode, limit: u8) -> Result<Vec<GifItem>, ChatError> {
            let tag = match mode {
                GifMode::Trending => "trending".to_owned(),
                GifMode::Search { query } => query.clone(),
            };
            Ok((0..limit.min(2))
                .map(|i| GifItem {
                    id: format!("{tag}-{i}"),
                    url: format!("https://media.test/{tag}-{i}.gif"),
                    preview_url: format!("https://media.test/{tag}-{i}-tiny.gif"),
                })
                .collect())
        }

        async fn detect_country(&self) -> Result<Option<String>, ChatError> {
            let mut state = self.lock();
            state.geo_calls += 1;
            Ok(state.country.clone())
        }
    }

    struct Harness {
        backend: Arc<FakeBackend>,
        store: InMemoryKeyValueStore,
        handle: ChatRuntimeHandle,
        events: EventStream,
    }

    fn harness(backend: Arc<FakeBackend>) -> Harness {
        let store = InMemoryKeyValueStore::default();
        let profile = DeviceProfile::single_store(Arc::new(store.clone()));
        let handle = spawn_runtime(backend.clone(), profile);
        let events = handle.subscribe();
        Harness {
            backend,
            store,
            handle,
            events,
        }
    }

    impl Harness {
        async fn send(&self, command: ChatCommand) {
            self.handle
                .send(command)
                .await
                .expect("command should enqueue");
        }

        async fn next(&mut self) -> ChatEvent {
            timeout(Duration::from_secs(2), self.events.next())
                .await
                .expect("event timeout")
                .expect("event stream open")
        }

        async fn wait_for(&mut self, mut predicate: impl FnMut(&ChatEvent) -> bool) -> ChatEvent {
            loop {
                let event = self.next().await;
                if predicate(&event) {
                    return event;
                }
            }
        }

        async fn go_live(&mut self) {
            self.send(ChatCommand::Init { config: None }).await;
            self.send(ChatCommand::Connect).await;
            self.wait_for(|event| {
                matches!(
                    event,
                    ChatEvent::StateChanged {
                        state: ChatLifecycleState::Live
                    }
                )
            })
            .await;
        }
    }

    fn text_draft(text: &str) -> OutgoingDraft {
        OutgoingDraft {
            content: DraftContent::Text(text.to_owned()),
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn runtime_emits_error_notification_for_invalid_transition() {
        let mut h = harness(FakeBackend::with_rows([]));
        h.send(ChatCommand::Connect).await;

        match h.next().await {
            ChatEvent::Notification(notification) => {
                assert_eq!(notification.level, NotificationLevel::Error);
                assert!(notification.detail.expect("detail").contains("Cold"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_loads_newest_page_and_goes_live() {
        let rows = (1..=60).map(|id| row(id, "@peer", "hello"));
        let mut h = harness(FakeBackend::with_rows(rows));
        h.send(ChatCommand::Init { config: None }).await;
        h.send(ChatCommand::Connect).await;

        let page = h
            .wait_for(|event| matches!(event, ChatEvent::InitialPage { .. }))
            .await;
        match page {
            ChatEvent::InitialPage {
                messages,
                requested,
            } => {
                assert_eq!(requested, DEFAULT_PAGE_SIZE);
                assert_eq!(messages.len(), 50);
                assert_eq!(messages.first().map(|m| m.id), Some(60));
                assert_eq!(messages.last().map(|m| m.id), Some(11));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let status = h.next().await;
        assert_eq!(
            status,
            ChatEvent::SubscriptionStatus(SubscriptionStatus { connected: true })
        );
        assert_eq!(
            h.next().await,
            ChatEvent::StateChanged {
                state: ChatLifecycleState::Live
            }
        );
    }

    #[tokio::test]
    async fn forwards_live_changes() {
        let mut h = harness(FakeBackend::with_rows([row(1, "@peer", "a")]));
        h.go_live().await;

        let change = ChangeEvent {
            kind: ChangeKind::Insert,
            message: row(2, "@peer", "b"),
        };
        h.backend.push(RealtimeSignal::Change(change.clone())).await;
        assert_eq!(h.next().await, ChatEvent::Change(change));
    }

    #[tokio::test]
    async fn subscription_loss_disconnects_and_reconnect_recovers() {
        let mut h = harness(FakeBackend::with_rows([row(1, "@peer", "a")]));
        h.go_live().await;

        h.backend
            .push(RealtimeSignal::Closed {
                reason: "socket reset".into(),
            })
            .await;
        h.wait_for(|event| {
            matches!(
                event,
                ChatEvent::StateChanged {
                    state: ChatLifecycleState::Disconnected
                }
            )
        })
        .await;
        let notice = h
            .wait_for(|event| matches!(event, ChatEvent::Notification(_)))
            .await;
        assert!(matches!(
            notice,
            ChatEvent::Notification(Notification { ref title, .. }) if title == "Connection lost"
        ));

        h.send(ChatCommand::Reconnect).await;
        h.wait_for(|event| {
            matches!(
                event,
                ChatEvent::StateChanged {
                    state: ChatLifecycleState::Live
                }
            )
        })
        .await;
        assert_eq!(h.backend.lock().subscribe_calls, 2);
    }

    #[tokio::test]
    async fn initial_load_failure_leaves_chat_disconnected() {
        let backend = FakeBackend::with_rows([]);
        backend.lock().fail_fetch = true;
        let mut h = harness(backend);
        h.send(ChatCommand::Init { config: None }).await;
        h.send(ChatCommand::Connect).await;

        let failed = h
            .wait_for(|event| matches!(event, ChatEvent::PageFailed { .. }))
            .await;
        assert_eq!(
            failed,
            ChatEvent::PageFailed {
                before: None,
                error_message: "upstream unavailable".into()
            }
        );
        h.wait_for(|event| {
            matches!(
                event,
                ChatEvent::StateChanged {
                    state: ChatLifecycleState::Disconnected
                }
            )
        })
        .await;
    }

    #[tokio::test]
    async fn load_older_uses_keyset_and_bounds_limit() {
        let rows = (1..=10).map(|id| row(id, "@peer", "x"));
        let mut h = harness(FakeBackend::with_rows(rows));
        h.go_live().await;

        h.send(ChatCommand::LoadOlder {
            before: 5,
            limit: 500,
        })
        .await;
        let page = h
            .wait_for(|event| matches!(event, ChatEvent::OlderPage { .. }))
            .await;
        match page {
            ChatEvent::OlderPage {
                before,
                messages,
                requested,
            } => {
                assert_eq!(before, 5);
                assert_eq!(requested, 100);
                assert_eq!(
                    messages.iter().map(|m| m.id).collect::<Vec<_>>(),
                    vec![4, 3, 2, 1]
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_text_stamps_author_and_acks() {
        let mut h = harness(FakeBackend::with_rows([]));
        h.store.set("username", "@user0042").expect("seed username");
        h.store.set("countryCode", "ke").expect("seed country");
        h.go_live().await;
        h.send(ChatCommand::ResolveCountry).await;
        h.wait_for(|event| matches!(event, ChatEvent::CountryResolved { .. }))
            .await;

        h.send(ChatCommand::SendMessage {
            client_txn_id: "txn-1".into(),
            draft: text_draft("  hello  "),
        })
        .await;
        let ack = h
            .wait_for(|event| matches!(event, ChatEvent::SendAck(_)))
            .await;
        match ack {
            ChatEvent::SendAck(ack) => {
                assert_eq!(ack.client_txn_id, "txn-1");
                assert_eq!(ack.message_id, Some(1));
                assert_eq!(ack.error_message, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let inserted = h.backend.lock().inserted.clone();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].text.as_deref(), Some("hello"));
        assert_eq!(inserted[0].username, "@user0042");
        assert_eq!(inserted[0].country.as_deref(), Some("ke"));
        assert_eq!(h.backend.lock().geo_calls, 0);
    }

    #[tokio::test]
    async fn rejects_blank_text_without_inserting() {
        let mut h = harness(FakeBackend::with_rows([]));
        h.go_live().await;
        h.send(ChatCommand::SendMessage {
            client_txn_id: "txn-blank".into(),
            draft: text_draft("   "),
        })
        .await;

        let ack = h
            .wait_for(|event| matches!(event, ChatEvent::SendAck(_)))
            .await;
        assert!(matches!(ack, ChatEvent::SendAck(ack) if ack.message_id.is_none()));
        assert!(h.backend.lock().inserted.is_empty());
    }

    fn image_draft() -> OutgoingDraft {
        OutgoingDraft {
            content: DraftContent::Image {
                attachment: ImageAttachment {
                    file_name: "cat.png".into(),
                    content_type: "image/png".into(),
                    data: vec![1, 2, 3],
                },
                caption: Some("look".into()),
            },
            reply_to: Some(3),
        }
    }

    #[tokio::test]
    async fn image_send_uploads_before_insert() {
        let mut h = harness(FakeBackend::with_rows([row(3, "@peer", "x")]));
        h.go_live().await;
        h.send(ChatCommand::SendMessage {
            client_txn_id: "txn-img".into(),
            draft: image_draft(),
        })
        .await;
        h.wait_for(|event| matches!(event, ChatEvent::SendAck(ack) if ack.message_id.is_some()))
            .await;

        let state = h.backend.lock();
        assert_eq!(state.uploads, vec!["https://cdn.test/message-images/cat.png"]);
        assert_eq!(
            state.inserted[0].image_url.as_deref(),
            Some("https://cdn.test/message-images/cat.png")
        );
        assert_eq!(state.inserted[0].text.as_deref(), Some("look"));
        assert_eq!(state.inserted[0].reply_to, Some(3));
    }

    #[tokio::test]
    async fn upload_failure_aborts_send() {
        let backend = FakeBackend::with_rows([]);
        backend.lock().fail_upload = true;
        let mut h = harness(backend);
        h.go_live().await;
        h.send(ChatCommand::SendMessage {
            client_txn_id: "txn-img".into(),
            draft: image_draft(),
        })
        .await;

        let notice = h
            .wait_for(|event| matches!(event, ChatEvent::Notification(_)))
            .await;
        match notice {
            ChatEvent::Notification(notification) => {
                assert_eq!(notification.title, "Image upload failed");
                assert_eq!(
                    notification.detail.as_deref(),
                    Some("The object exceeded the maximum allowed size")
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let ack = h.next().await;
        assert!(matches!(ack, ChatEvent::SendAck(ack) if ack.message_id.is_none()));
        assert!(h.backend.lock().inserted.is_empty());
    }

    #[tokio::test]
    async fn edit_and_delete_are_limited_to_the_author() {
        let mut h = harness(FakeBackend::with_rows([
            row(1, "@user0042", "mine"),
            row(2, "@peer", "theirs"),
        ]));
        h.store.set("username", "@user0042").expect("seed username");
        h.go_live().await;

        h.send(ChatCommand::EditMessage {
            client_txn_id: "e1".into(),
            message_id: 1,
            new_text: " fixed ".into(),
        })
        .await;
        let ack = h
            .wait_for(|event| matches!(event, ChatEvent::MutationAck(_)))
            .await;
        assert!(matches!(ack, ChatEvent::MutationAck(ack) if ack.error_message.is_none()));

        h.send(ChatCommand::DeleteMessage {
            client_txn_id: "d1".into(),
            message_id: 2,
        })
        .await;
        let ack = h
            .wait_for(|event| matches!(event, ChatEvent::MutationAck(_)))
            .await;
        assert!(matches!(
            ack,
            ChatEvent::MutationAck(ack) if ack.error_message.as_deref() == Some("not yours")
        ));

        let state = h.backend.lock();
        assert_eq!(state.rows[&1].text.as_deref(), Some("fixed"));
        assert_eq!(state.updates[0].2.as_deref(), Some("@user0042"));
        assert_eq!(state.updates[1].1.is_deleted, Some(true));
    }

    #[tokio::test]
    async fn reaction_adds_viewer_to_existing_map() {
        let mut existing = row(1, "@peer", "hello");
        existing.reactions.add("👍", "@peer");
        let mut h = harness(FakeBackend::with_rows([existing]));
        h.store.set("username", "@user0042").expect("seed username");
        h.go_live().await;

        for txn in ["r1", "r2"] {
            h.send(ChatCommand::AddReaction {
                client_txn_id: txn.into(),
                message_id: 1,
                emoji: "👍".into(),
            })
            .await;
            h.wait_for(|event| matches!(event, ChatEvent::MutationAck(_)))
                .await;
        }

        let state = h.backend.lock();
        assert_eq!(state.rows[&1].reactions.users("👍"), ["@peer", "@user0042"]);
        assert_eq!(state.updates.len(), 1, "second add is a no-op");
    }

    #[tokio::test]
    async fn restore_refreshes_expired_session() {
        let mut h = harness(FakeBackend::with_rows([]));
        let profile = DeviceProfile::single_store(Arc::new(h.store.clone()));
        profile
            .save_session(&session("expired"))
            .expect("seed session");
        h.send(ChatCommand::Init { config: None }).await;
        h.send(ChatCommand::RestoreIdentity).await;

        let changed = h
            .wait_for(|event| matches!(event, ChatEvent::IdentityChanged { .. }))
            .await;
        match changed {
            ChatEvent::IdentityChanged { identity } => {
                assert!(identity.is_authenticated);
                assert_eq!(identity.username, "@amani");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let saved: AuthSession = profile.session().expect("load").expect("present");
        assert_eq!(saved.access_token, "access-2");
    }

    #[tokio::test]
    async fn restore_without_session_creates_device_username() {
        let mut h = harness(FakeBackend::with_rows([]));
        h.send(ChatCommand::Init { config: None }).await;
        h.send(ChatCommand::RestoreIdentity).await;

        let changed = h
            .wait_for(|event| matches!(event, ChatEvent::IdentityChanged { .. }))
            .await;
        match changed {
            ChatEvent::IdentityChanged { identity } => {
                assert!(!identity.is_authenticated);
                assert!(identity.username.starts_with("@user"));
                assert_eq!(identity.username.len(), "@user".len() + 4);
                assert_eq!(
                    h.store.get("username").expect("get"),
                    Some(identity.username)
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn otp_login_then_logout_resets_identity() {
        let mut h = harness(FakeBackend::with_rows([]));
        h.send(ChatCommand::Init { config: None }).await;

        h.send(ChatCommand::RequestOtp {
            phone: "0700".into(),
        })
        .await;
        let requested = h
            .wait_for(|event| matches!(event, ChatEvent::OtpRequested { .. }))
            .await;
        assert!(matches!(
            requested,
            ChatEvent::OtpRequested { success: false, error_message: Some(ref msg), .. }
                if msg == "Invalid phone number format"
        ));

        h.send(ChatCommand::VerifyOtp {
            phone: "+254700000000".into(),
            token: "123456".into(),
        })
        .await;
        h.wait_for(|event| matches!(event, ChatEvent::AuthResult { success: true, .. }))
            .await;
        assert!(h.store.get("session").expect("get").is_some());
        assert_eq!(
            h.store.get("username").expect("get").as_deref(),
            Some("@amani")
        );

        h.send(ChatCommand::Logout).await;
        let changed = h
            .wait_for(|event| matches!(event, ChatEvent::IdentityChanged { .. }))
            .await;
        match changed {
            ChatEvent::IdentityChanged { identity } => {
                assert!(!identity.is_authenticated);
                assert!(identity.username.starts_with("@user"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(h.store.get("session").expect("get"), None);
    }

    #[tokio::test]
    async fn set_username_is_rejected_while_authenticated() {
        let mut h = harness(FakeBackend::with_rows([]));
        h.send(ChatCommand::Init { config: None }).await;
        h.send(ChatCommand::SetUsername {
            username: " @kamau ".into(),
        })
        .await;
        let changed = h
            .wait_for(|event| matches!(event, ChatEvent::IdentityChanged { .. }))
            .await;
        assert!(matches!(
            changed,
            ChatEvent::IdentityChanged { ref identity } if identity.username == "@kamau"
        ));

        h.send(ChatCommand::VerifyOtp {
            phone: "+254700000000".into(),
            token: "123456".into(),
        })
        .await;
        h.wait_for(|event| matches!(event, ChatEvent::AuthResult { .. }))
            .await;
        h.send(ChatCommand::SetUsername {
            username: "@other".into(),
        })
        .await;
        let notice = h
            .wait_for(|event| {
                matches!(event, ChatEvent::Notification(n) if n.level == NotificationLevel::Error)
            })
            .await;
        assert!(matches!(
            notice,
            ChatEvent::Notification(ref n) if n.detail.as_deref() == Some("log out to change the device username")
        ));
    }

    #[tokio::test]
    async fn resolves_country_once_per_device() {
        let backend = FakeBackend::with_rows([]);
        backend.lock().country = Some("tz".into());
        let mut h = harness(backend);
        h.send(ChatCommand::Init { config: None }).await;

        for _ in 0..2 {
            h.send(ChatCommand::ResolveCountry).await;
            let resolved = h
                .wait_for(|event| matches!(event, ChatEvent::CountryResolved { .. }))
                .await;
            assert_eq!(
                resolved,
                ChatEvent::CountryResolved {
                    country_code: "tz".into()
                }
            );
        }
        assert_eq!(h.backend.lock().geo_calls, 1);
        assert_eq!(h.store.get("countryCode").expect("get").as_deref(), Some("tz"));
    }

    #[tokio::test]
    async fn blank_gif_search_falls_back_to_trending() {
        let mut h = harness(FakeBackend::with_rows([]));
        h.send(ChatCommand::Init {
            config: Some(ChatInitConfig {
                gif_limit: Some(1),
                ..ChatInitConfig::default()
            }),
        })
        .await;
        h.send(ChatCommand::SearchGifs {
            query: "   ".into(),
        })
        .await;

        let results = h
            .wait_for(|event| matches!(event, ChatEvent::GifResults(_)))
            .await;
        match results {
            ChatEvent::GifResults(results) => {
                assert_eq!(results.mode, GifMode::Trending);
                assert_eq!(results.items.len(), 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_message_reports_missing_rows() {
        let mut h = harness(FakeBackend::with_rows([row(4, "@peer", "x")]));
        h.send(ChatCommand::Init { config: None }).await;
        h.send(ChatCommand::FetchMessage { message_id: 9 }).await;

        let fetched = h
            .wait_for(|event| matches!(event, ChatEvent::MessageFetched { .. }))
            .await;
        assert_eq!(
            fetched,
            ChatEvent::MessageFetched {
                message_id: 9,
                message: None
            }
        );
    }

    #[tokio::test]
    async fn failed_fetch_message_still_resolves_target() {
        let backend = FakeBackend::with_rows([row(4, "@peer", "x")]);
        backend.lock().fail_fetch_message = true;
        let mut h = harness(backend);
        h.send(ChatCommand::Init { config: None }).await;
        h.send(ChatCommand::FetchMessage { message_id: 4 }).await;

        let fetched = h
            .wait_for(|event| {
                matches!(
                    event,
                    ChatEvent::MessageFetched { .. } | ChatEvent::Notification(_)
                )
            })
            .await;
        assert_eq!(
            fetched,
            ChatEvent::MessageFetched {
                message_id: 4,
                message: None
            }
        );
    }

    #[test]
    fn init_config_overrides_are_bounded() {
        let mut settings = RuntimeSettings::default();
        settings.apply(&ChatInitConfig {
            page_size: Some(0),
            gif_limit: Some(0),
            image_bucket: Some("  ".into()),
        });
        assert_eq!(settings.page_size, 1);
        assert_eq!(settings.gif_limit, 1);
        assert_eq!(settings.image_bucket, DEFAULT_IMAGE_BUCKET);
    }
}
