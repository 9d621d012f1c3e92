//! Runtime bridge that wires chat events into UI state snapshots.

use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use chat_core::{ChatCommand, ChatEvent, DraftContent, ImageAttachment, MessageId, OutgoingDraft};
use chat_supabase::ChatRuntimeHandle;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, trace, warn};

use crate::{
    commands::UserInput,
    config::MamboConfig,
    state::{ChatSnapshot, ChatState, PendingMutation, UiEffect},
};

/// What the UI receives after every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiUpdate {
    pub snapshot: ChatSnapshot,
    pub effects: Vec<UiEffect>,
}

/// Callback used to publish new UI snapshots.
pub type UiUpdateCallback = Arc<dyn Fn(UiUpdate) + Send + Sync + 'static>;

/// Bridges user input and runtime events.
pub struct TerminalBridge {
    command_tx: mpsc::UnboundedSender<ChatCommand>,
    state: Arc<Mutex<ChatState>>,
    ui_update: UiUpdateCallback,
    next_txn_id: AtomicU64,
    paginate_limit: u16,
    pagination_cooldown_ms: u64,
    command_task: JoinHandle<()>,
    event_task: JoinHandle<()>,
}

impl TerminalBridge {
    /// Start command/event workers and enqueue the startup sequence.
    pub fn spawn(
        config: &MamboConfig,
        runtime: ChatRuntimeHandle,
        ui_update: UiUpdateCallback,
    ) -> Arc<Self> {
        info!(
            paginate_limit = config.paginate_limit,
            viewport_rows = config.viewport_rows,
            "spawning terminal bridge"
        );

        let state = Arc::new(Mutex::new(ChatState::new(
            config.viewport_rows,
            config.utc_offset,
        )));
        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<ChatCommand>();

        // Subscribe before any command is queued so no event is missed.
        let mut events = runtime.subscribe();
        let command_task = tokio::spawn(async move {
            debug!("terminal command worker started");
            while let Some(command) = command_rx.recv().await {
                debug!(command = command_kind(&command), "forwarding chat command");
                if let Err(err) = runtime.send(command).await {
                    error!(error = %err, "failed to forward chat command");
                    break;
                }
            }
            debug!("terminal command worker exiting");
        });

        let state_for_events = Arc::clone(&state);
        let ui_update_for_events = Arc::clone(&ui_update);
        let command_tx_for_events = command_tx.clone();
        let event_task = tokio::spawn(async move {
            debug!("terminal event worker started");
            let mut reported_skips = 0;
            while let Some(event) = events.next().await {
                if events.skipped() > reported_skips {
                    warn!(
                        skipped = events.skipped() - reported_skips,
                        "chat event stream lagged"
                    );
                    reported_skips = events.skipped();
                }
                trace!(event = event_kind(&event), "received chat event");
                let update = {
                    let mut state = state_for_events
                        .lock()
                        .expect("chat state lock poisoned while handling chat event");
                    let effects = state.handle_event(event);
                    UiUpdate {
                        snapshot: state.snapshot(),
                        effects,
                    }
                };

                for effect in &update.effects {
                    if let UiEffect::FetchMessage(message_id) = effect {
                        debug!(message_id, "fetching reply target");
                        let command = ChatCommand::FetchMessage {
                            message_id: *message_id,
                        };
                        if command_tx_for_events.send(command).is_err() {
                            error!("failed to enqueue reply target fetch");
                        }
                    }
                }
                (ui_update_for_events)(update);
            }
            warn!("terminal event worker exiting: chat event stream closed");
        });

        let bridge = Arc::new(Self {
            command_tx,
            state,
            ui_update,
            next_txn_id: AtomicU64::new(1),
            paginate_limit: config.paginate_limit,
            pagination_cooldown_ms: config.pagination_cooldown_ms,
            command_task,
            event_task,
        });

        for command in startup_command_sequence(config) {
            bridge.enqueue_command(command);
        }
        bridge
    }

    /// Apply one line of user input.
    pub async fn handle_input(&self, input: UserInput) {
        match input {
            UserInput::Empty | UserInput::Help | UserInput::Quit => {}
            UserInput::Text(text) => {
                self.send_draft(DraftContent::Text(text));
            }
            UserInput::Gifs { query } => {
                let command = match query {
                    Some(query) => ChatCommand::SearchGifs { query },
                    None => ChatCommand::TrendingGifs,
                };
                self.enqueue_command(command);
            }
            UserInput::PickGif(position) => self.send_gif(position),
            UserInput::Image { path, caption } => self.send_image(&path, caption).await,
            UserInput::Reply(message_id) => {
                self.update_state(|state| match state.set_reply_target(message_id) {
                    Ok(()) => state.clear_error(),
                    Err(message) => state.set_error_text(message),
                });
            }
            UserInput::CancelReply => self.update_state(ChatState::clear_reply_target),
            UserInput::Edit { message_id, text } => self.edit_message(message_id, text),
            UserInput::Delete(message_id) => self.delete_message(message_id),
            UserInput::React { message_id, emoji } => self.add_reaction(message_id, emoji),
            UserInput::Top => self.scroll(ChatState::scroll_to_top),
            UserInput::Up => self.scroll(ChatState::scroll_up),
            UserInput::Down => self.scroll(ChatState::scroll_down),
            UserInput::Bottom => self.scroll(ChatState::scroll_to_bottom),
            UserInput::Jump(message_id) => {
                self.update_state(|state| {
                    if state.jump_to(message_id).is_none() {
                        state.set_error_text(format!("Message #{message_id} is not loaded."));
                    }
                });
                self.maybe_paginate();
            }
            UserInput::Login { phone } => self.enqueue_command(ChatCommand::RequestOtp { phone }),
            UserInput::Otp { code } => self.verify_otp(code),
            UserInput::Logout => self.enqueue_command(ChatCommand::Logout),
            UserInput::Name(username) => {
                self.enqueue_command(ChatCommand::SetUsername { username });
            }
            UserInput::Reconnect => {
                self.update_state(ChatState::clear_error);
                self.enqueue_command(ChatCommand::Reconnect);
            }
        }
    }

    /// Show a one-off error, for example an input parse failure.
    pub fn show_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.update_state(|state| state.set_error_text(message));
    }

    fn send_draft(&self, content: DraftContent) {
        if let DraftContent::Text(text) = &content
            && text.trim().is_empty()
        {
            debug!("ignoring empty send request");
            return;
        }

        let (client_txn_id, reply_to) = {
            let mut state = self
                .state
                .lock()
                .expect("chat state lock poisoned while sending message");
            let client_txn_id = self.next_txn_id("send");
            state.mark_send_requested(client_txn_id.clone());
            state.clear_error();
            let reply_to = state.take_reply_target();
            let snapshot = state.snapshot();
            (self.ui_update)(UiUpdate {
                snapshot,
                effects: Vec::new(),
            });
            (client_txn_id, reply_to)
        };

        info!(client_txn_id = %client_txn_id, reply_to = ?reply_to, "queueing send");
        self.enqueue_command(ChatCommand::SendMessage {
            client_txn_id,
            draft: OutgoingDraft { content, reply_to },
        });
    }

    fn send_gif(&self, position: usize) {
        let url = {
            let state = self
                .state
                .lock()
                .expect("chat state lock poisoned while picking gif");
            state.gif_at(position).map(|gif| gif.url.clone())
        };
        match url {
            Some(url) => {
                self.send_draft(DraftContent::Gif { url });
            }
            None => self.show_error(format!("No GIF number {position}. Use /gif first.")),
        }
    }

    async fn send_image(&self, path: &Path, caption: Option<String>) {
        let Some(content_type) = image_content_type(path) else {
            self.show_error(format!("{} is not a supported image type.", path.display()));
            return;
        };
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed reading image");
                self.show_error(format!("Could not read {}: {err}", path.display()));
                return;
            }
        };
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_owned());

        self.send_draft(DraftContent::Image {
            attachment: ImageAttachment {
                file_name,
                content_type: content_type.to_owned(),
                data,
            },
            caption,
        });
    }

    fn edit_message(&self, message_id: MessageId, text: String) {
        if !self.check_owned(message_id, "edit") {
            return;
        }
        let client_txn_id = self.next_txn_id("edit");
        self.update_state(|state| {
            state.mark_mutation_requested(
                client_txn_id.clone(),
                PendingMutation::Edit {
                    message_id,
                    text: text.trim().to_owned(),
                },
            );
        });
        self.enqueue_command(ChatCommand::EditMessage {
            client_txn_id,
            message_id,
            new_text: text,
        });
    }

    fn delete_message(&self, message_id: MessageId) {
        if !self.check_owned(message_id, "delete") {
            return;
        }
        let client_txn_id = self.next_txn_id("delete");
        self.update_state(|state| {
            state.mark_mutation_requested(
                client_txn_id.clone(),
                PendingMutation::Delete { message_id },
            );
        });
        self.enqueue_command(ChatCommand::DeleteMessage {
            client_txn_id,
            message_id,
        });
    }

    fn add_reaction(&self, message_id: MessageId, emoji: String) {
        let client_txn_id = self.next_txn_id("react");
        self.update_state(|state| {
            state.mark_mutation_requested(
                client_txn_id.clone(),
                PendingMutation::Reaction { message_id },
            );
        });
        self.enqueue_command(ChatCommand::AddReaction {
            client_txn_id,
            message_id,
            emoji,
        });
    }

    fn verify_otp(&self, code: String) {
        let phone = {
            let state = self
                .state
                .lock()
                .expect("chat state lock poisoned while verifying otp");
            state.otp_phone().map(str::to_owned)
        };
        match phone {
            Some(phone) => self.enqueue_command(ChatCommand::VerifyOtp { phone, token: code }),
            None => self.show_error("Request a code with /login PHONE first."),
        }
    }

    fn check_owned(&self, message_id: MessageId, action: &str) -> bool {
        let mut state = self
            .state
            .lock()
            .expect("chat state lock poisoned while checking ownership");
        if state.owns_live_message(message_id) {
            return true;
        }
        warn!(message_id, action, "rejected mutation of message not owned by viewer");
        state.set_error_text(format!("You can only {action} your own messages."));
        let snapshot = state.snapshot();
        (self.ui_update)(UiUpdate {
            snapshot,
            effects: Vec::new(),
        });
        false
    }

    fn scroll(&self, apply: fn(&mut ChatState)) {
        self.update_state(apply);
        self.maybe_paginate();
    }

    /// Request an older page when the list sits at the top.
    fn maybe_paginate(&self) {
        let maybe_request = {
            let mut state = self
                .state
                .lock()
                .expect("chat state lock poisoned while handling scroll");
            state.request_pagination_if_needed(
                now_millis(),
                self.pagination_cooldown_ms,
                self.paginate_limit,
            )
        };

        if let Some((before, limit)) = maybe_request {
            debug!(before, limit, "queueing pagination request");
            self.enqueue_command(ChatCommand::LoadOlder { before, limit });
        }
    }

    fn update_state(&self, apply: impl FnOnce(&mut ChatState)) {
        let mut state = self
            .state
            .lock()
            .expect("chat state lock poisoned while applying user action");
        apply(&mut state);
        let snapshot = state.snapshot();
        (self.ui_update)(UiUpdate {
            snapshot,
            effects: Vec::new(),
        });
    }

    fn next_txn_id(&self, kind: &str) -> String {
        format!(
            "term-{kind}-{}",
            self.next_txn_id.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn enqueue_command(&self, command: ChatCommand) {
        trace!(command = command_kind(&command), "enqueue_command");
        if self.command_tx.send(command).is_err() {
            error!("chat command channel closed");
            self.show_error("Chat runtime is not running.");
        }
    }
}

impl Drop for TerminalBridge {
    fn drop(&mut self) {
        info!("shutting down terminal bridge tasks");
        self.command_task.abort();
        self.event_task.abort();
    }
}

/// Init, identity and country first; history and live changes last.
fn startup_command_sequence(config: &MamboConfig) -> [ChatCommand; 4] {
    [
        ChatCommand::Init {
            config: config.init_config.clone(),
        },
        ChatCommand::RestoreIdentity,
        ChatCommand::ResolveCountry,
        ChatCommand::Connect,
    ]
}

fn image_content_type(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        "svg" => Some("image/svg+xml"),
        _ => None,
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

fn command_kind(command: &ChatCommand) -> &'static str {
    match command {
        ChatCommand::Init { .. } => "Init",
        ChatCommand::RestoreIdentity => "RestoreIdentity",
        ChatCommand::ResolveCountry => "ResolveCountry",
        ChatCommand::Connect => "Connect",
        ChatCommand::Reconnect => "Reconnect",
        ChatCommand::LoadOlder { .. } => "LoadOlder",
        ChatCommand::SendMessage { .. } => "SendMessage",
        ChatCommand::EditMessage { .. } => "EditMessage",
        ChatCommand::DeleteMessage { .. } => "DeleteMessage",
        ChatCommand::AddReaction { .. } => "AddReaction",
        ChatCommand::FetchMessage { .. } => "FetchMessage",
        ChatCommand::TrendingGifs => "TrendingGifs",
        ChatCommand::SearchGifs { .. } => "SearchGifs",
        ChatCommand::RequestOtp { .. } => "RequestOtp",
        ChatCommand::VerifyOtp { .. } => "VerifyOtp",
        ChatCommand::SetUsername { .. } => "SetUsername",
        ChatCommand::Logout => "Logout",
    }
}

fn event_kind(event: &ChatEvent) -> &'static str {
    match event {
        ChatEvent::StateChanged { .. } => "StateChanged",
        ChatEvent::IdentityChanged { .. } => "IdentityChanged",
        ChatEvent::CountryResolved { .. } => "CountryResolved",
        ChatEvent::OtpRequested { .. } => "OtpRequested",
        ChatEvent::AuthResult { .. } => "AuthResult",
        ChatEvent::InitialPage { .. } => "InitialPage",
        ChatEvent::OlderPage { .. } => "OlderPage",
        ChatEvent::PageFailed { .. } => "PageFailed",
        ChatEvent::Change(_) => "Change",
        ChatEvent::SubscriptionStatus(_) => "SubscriptionStatus",
        ChatEvent::SendAck(_) => "SendAck",
        ChatEvent::MutationAck(_) => "MutationAck",
        ChatEvent::MessageFetched { .. } => "MessageFetched",
        ChatEvent::GifResults(_) => "GifResults",
        ChatEvent::Notification(_) => "Notification",
    }
}
