//! Row change subscription over the realtime websocket (Phoenix protocol).

use std::time::Duration;

use chat_core::{ChangeEvent, ChatError, ChatErrorCategory, Message, RowChangeType};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::http::SupabaseConfig;

pub const CHANNEL_TOPIC: &str = "realtime:custom-all-channel";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const JOIN_REF: &str = "1";

/// Messages pushed from the subscription task to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeSignal {
    Change(ChangeEvent),
    /// The subscription ended; the task has stopped.
    Closed { reason: String },
}

/// Running subscription task. Dropping it stops the task.
#[derive(Debug)]
pub struct SubscriptionGuard {
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionGuard {
    pub fn new(stop: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            stop,
            task: Some(task),
        }
    }

    /// Guard with no task behind it, for backends that push signals directly.
    pub fn detached(stop: CancellationToken) -> Self {
        Self { stop, task: None }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    JoinReply { ok: bool, reason: Option<String> },
    HeartbeatReply,
    /// `None` when the row could not be used (physical delete or bad row).
    Change(Option<ChangeEvent>),
    ChannelError(String),
    ChannelClosed,
    Other,
}

#[derive(Debug, Deserialize)]
struct PhoenixFrame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(default, rename = "ref")]
    reference: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChangePayload {
    data: ChangeData,
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    record: Option<Value>,
}

pub fn websocket_url(config: &SupabaseConfig) -> Result<Url, ChatError> {
    let mut url = config.endpoint("realtime/v1/websocket")?;
    let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
    url.set_scheme(scheme).map_err(|_| {
        ChatError::new(
            ChatErrorCategory::Config,
            "invalid_realtime_url",
            format!("cannot use {url} as a websocket url"),
        )
    })?;
    url.query_pairs_mut()
        .append_pair("apikey", &config.anon_key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

pub fn join_frame(access_token: Option<&str>) -> String {
    let mut payload = json!({
        "config": {
            "broadcast": {"self": false},
            "presence": {"key": ""},
            "postgres_changes": [
                {"event": "*", "schema": "public", "table": "messages"}
            ]
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_owned());
    }
    json!({
        "topic": CHANNEL_TOPIC,
        "event": "phx_join",
        "payload": payload,
        "ref": JOIN_REF,
        "join_ref": JOIN_REF,
    })
    .to_string()
}

pub fn heartbeat_frame(reference: u64) -> String {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": reference.to_string(),
    })
    .to_string()
}

pub fn decode_frame(text: &str) -> Result<InboundFrame, ChatError> {
    let frame: PhoenixFrame = serde_json::from_str(text).map_err(|err| {
        ChatError::new(
            ChatErrorCategory::Serialization,
            "realtime_decode_error",
            format!("malformed realtime frame: {err}"),
        )
    })?;

    if frame.topic == "phoenix" {
        return Ok(match frame.event.as_str() {
            "phx_reply" => InboundFrame::HeartbeatReply,
            _ => InboundFrame::Other,
        });
    }
    if frame.topic != CHANNEL_TOPIC {
        return Ok(InboundFrame::Other);
    }

    match frame.event.as_str() {
        "phx_reply" if frame.reference.as_deref() == Some(JOIN_REF) => {
            let ok = frame.payload.get("status").and_then(Value::as_str) == Some("ok");
            let reason = frame
                .payload
                .pointer("/response/reason")
                .and_then(Value::as_str)
                .map(str::to_owned);
            Ok(InboundFrame::JoinReply { ok, reason })
        }
        "postgres_changes" => Ok(InboundFrame::Change(decode_change(frame.payload))),
        "phx_error" => Ok(InboundFrame::ChannelError(frame.payload.to_string())),
        "phx_close" => Ok(InboundFrame::ChannelClosed),
        "system" => {
            let failed = frame.payload.get("status").and_then(Value::as_str) == Some("error");
            if failed {
                let message = frame
                    .payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("subscription error")
                    .to_owned();
                Ok(InboundFrame::ChannelError(message))
            } else {
                Ok(InboundFrame::Other)
            }
        }
        _ => Ok(InboundFrame::Other),
    }
}

fn decode_change(payload: Value) -> Option<ChangeEvent> {
    let payload: ChangePayload = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "ignoring malformed change payload");
            return None;
        }
    };
    let kind = match payload.data.kind.as_str() {
        "INSERT" => RowChangeType::Insert,
        "UPDATE" => RowChangeType::Update,
        "DELETE" => RowChangeType::Delete,
        other => {
            debug!(kind = other, "ignoring unknown change type");
            return None;
        }
    };
    let record = payload.data.record.filter(|record| !record.is_null())?;
    match serde_json::from_value::<Message>(record) {
        Ok(message) => ChangeEvent::classify(kind, message),
        Err(err) => {
            warn!(error = %err, "ignoring change with unusable row");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeClient {
    config: SupabaseConfig,
}

impl RealtimeClient {
    pub fn new(config: SupabaseConfig) -> Self {
        Self { config }
    }

    /// Connect, join the messages channel and spawn the read loop.
    ///
    /// Returns once the join is acknowledged.
    pub async fn subscribe(
        &self,
        access_token: Option<&str>,
        signals: mpsc::Sender<RealtimeSignal>,
    ) -> Result<SubscriptionGuard, ChatError> {
        let url = websocket_url(&self.config)?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|err| {
                ChatError::new(
                    ChatErrorCategory::Network,
                    "realtime_connect_failed",
                    err.to_string(),
                )
            })?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        ws_tx
            .send(WsMessage::Text(join_frame(access_token)))
            .await
            .map_err(|err| {
                ChatError::new(ChatErrorCategory::Network, "realtime_join_failed", err.to_string())
            })?;

        let joined = tokio::time::timeout(JOIN_TIMEOUT, async {
            while let Some(frame) = ws_rx.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => return Err(err.to_string()),
                };
                match decode_frame(&text) {
                    Ok(InboundFrame::JoinReply { ok: true, .. }) => return Ok(()),
                    Ok(InboundFrame::JoinReply { ok: false, reason }) => {
                        return Err(reason.unwrap_or_else(|| "join rejected".to_owned()));
                    }
                    Ok(InboundFrame::ChannelError(message)) => return Err(message),
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "skipping realtime frame"),
                }
            }
            Err("connection closed before join reply".to_owned())
        })
        .await;

        match joined {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                return Err(ChatError::new(
                    ChatErrorCategory::Network,
                    "realtime_join_failed",
                    reason,
                ));
            }
            Err(_) => {
                return Err(ChatError::new(
                    ChatErrorCategory::Network,
                    "realtime_join_timeout",
                    "timed out waiting for the channel join reply",
                ));
            }
        }
        info!(topic = CHANNEL_TOPIC, "realtime channel joined");

        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let task = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;
            let mut heartbeat_ref: u64 = 1;

            let reason = loop {
                tokio::select! {
                    _ = stop_child.cancelled() => {
                        let _ = ws_tx.close().await;
                        return;
                    }
                    _ = heartbeat.tick() => {
                        heartbeat_ref = heartbeat_ref.wrapping_add(1);
                        if let Err(err) = ws_tx.send(WsMessage::Text(heartbeat_frame(heartbeat_ref))).await {
                            break format!("heartbeat failed: {err}");
                        }
                    }
                    frame = ws_rx.next() => {
                        match frame {
                            Some(Ok(WsMessage::Text(text))) => match decode_frame(&text) {
                                Ok(InboundFrame::Change(Some(change))) => {
                                    if signals.send(RealtimeSignal::Change(change)).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(InboundFrame::ChannelError(message)) => break message,
                                Ok(InboundFrame::ChannelClosed) => break "channel closed by server".to_owned(),
                                Ok(_) => {}
                                Err(err) => warn!(error = %err, "skipping realtime frame"),
                            },
                            Some(Ok(WsMessage::Close(frame))) => {
                                break frame
                                    .map(|frame| frame.reason.to_string())
                                    .filter(|reason| !reason.is_empty())
                                    .unwrap_or_else(|| "connection closed".to_owned());
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => break err.to_string(),
                            None => break "connection closed".to_owned(),
                        }
                    }
                }
            };

            warn!(reason = %reason, "realtime subscription ended");
            let _ = signals.send(RealtimeSignal::Closed { reason }).await;
        });

        Ok(SubscriptionGuard::new(stop, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_core::ChangeKind;

    fn config() -> SupabaseConfig {
        SupabaseConfig::new("https://abc.supabase.co", "anon-key").expect("config")
    }

    #[test]
    fn builds_websocket_url() {
        assert_eq!(
            websocket_url(&config()).expect("url").as_str(),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );
        let local = SupabaseConfig::new("http://127.0.0.1:54321", "k").expect("config");
        assert!(websocket_url(&local).expect("url").as_str().starts_with("ws://"));
    }

    #[test]
    fn join_frame_filters_messages_table() {
        let frame: Value = serde_json::from_str(&join_frame(Some("jwt"))).expect("json");
        assert_eq!(frame["topic"], CHANNEL_TOPIC);
        assert_eq!(frame["event"], "phx_join");
        assert_eq!(frame["payload"]["access_token"], "jwt");
        assert_eq!(
            frame["payload"]["config"]["postgres_changes"][0],
            json!({"event": "*", "schema": "public", "table": "messages"})
        );

        let anonymous: Value = serde_json::from_str(&join_frame(None)).expect("json");
        assert!(anonymous["payload"].get("access_token").is_none());
    }

    #[test]
    fn decodes_join_reply() {
        let ok = decode_frame(
            r#"{"topic":"realtime:custom-all-channel","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"1"}"#,
        )
        .expect("decode");
        assert_eq!(ok, InboundFrame::JoinReply { ok: true, reason: None });

        let rejected = decode_frame(
            r#"{"topic":"realtime:custom-all-channel","event":"phx_reply","payload":{"status":"error","response":{"reason":"unauthorized"}},"ref":"1"}"#,
        )
        .expect("decode");
        assert_eq!(
            rejected,
            InboundFrame::JoinReply {
                ok: false,
                reason: Some("unauthorized".into())
            }
        );

        let heartbeat = decode_frame(
            r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok"},"ref":"2"}"#,
        )
        .expect("decode");
        assert_eq!(heartbeat, InboundFrame::HeartbeatReply);
    }

    #[test]
    fn decodes_insert_and_deleting_update() {
        let insert = decode_frame(
            r#"{"topic":"realtime:custom-all-channel","event":"postgres_changes","payload":{"data":{"type":"INSERT","schema":"public","table":"messages","record":{"id":5,"text":"hi","username":"@a","timestamp":"2024-05-01T10:00:00Z"}},"ids":[1]},"ref":null}"#,
        )
        .expect("decode");
        match insert {
            InboundFrame::Change(Some(change)) => {
                assert_eq!(change.kind, ChangeKind::Insert);
                assert_eq!(change.message.id, 5);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let delete = decode_frame(
            r#"{"topic":"realtime:custom-all-channel","event":"postgres_changes","payload":{"data":{"type":"UPDATE","record":{"id":5,"text":"hi","username":"@a","timestamp":"2024-05-01T10:00:00Z","is_deleted":true}}},"ref":null}"#,
        )
        .expect("decode");
        match delete {
            InboundFrame::Change(Some(change)) => assert_eq!(change.kind, ChangeKind::Delete),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn skips_unusable_changes() {
        let physical_delete = decode_frame(
            r#"{"topic":"realtime:custom-all-channel","event":"postgres_changes","payload":{"data":{"type":"DELETE","record":null,"old_record":{"id":5}}},"ref":null}"#,
        )
        .expect("decode");
        assert_eq!(physical_delete, InboundFrame::Change(None));

        let empty_row = decode_frame(
            r#"{"topic":"realtime:custom-all-channel","event":"postgres_changes","payload":{"data":{"type":"INSERT","record":{"id":6,"username":"@a","timestamp":"2024-05-01T10:00:00Z"}}},"ref":null}"#,
        )
        .expect("decode");
        assert_eq!(empty_row, InboundFrame::Change(None));

        assert!(decode_frame("not json").is_err());
    }

    #[test]
    fn decodes_channel_failures() {
        assert_eq!(
            decode_frame(r#"{"topic":"realtime:custom-all-channel","event":"phx_close","payload":{},"ref":null}"#)
                .expect("decode"),
            InboundFrame::ChannelClosed
        );
        assert!(matches!(
            decode_frame(
                r#"{"topic":"realtime:custom-all-channel","event":"system","payload":{"status":"error","message":"quota exceeded"},"ref":null}"#
            )
            .expect("decode"),
            InboundFrame::ChannelError(message) if message == "quota exceeded"
        ));
    }

    #[tokio::test]
    async fn guard_stop_cancels_token() {
        let stop = CancellationToken::new();
        let watcher = stop.clone();
        let guard = SubscriptionGuard::detached(stop);
        assert!(!guard.is_stopped());
        guard.stop().await;
        assert!(watcher.is_cancelled());
    }
}
