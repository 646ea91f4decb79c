use crate::recovery::RecoveryManager;
use crate::{Message, ServiceError, StoreConfig};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, interval_at, sleep};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// The feed confirmed the subscription.
    Accepted,
    Insert(Message),
    Rejected(String),
}

/// A live subscription to inserted rows. Released explicitly with
/// [`Subscription::release`] or implicitly when dropped.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<FeedEvent>,
    release: Option<oneshot::Sender<()>>,
}

impl Subscription {
    pub fn new(events: mpsc::UnboundedReceiver<FeedEvent>, release: oneshot::Sender<()>) -> Self {
        Self {
            events,
            release: Some(release),
        }
    }

    pub async fn next(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }

    pub fn release(mut self) {
        self.signal_release();
    }

    fn signal_release(&mut self) {
        if let Some(release) = self.release.take() {
            let _ = release.send(());
        }
        self.events.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.signal_release();
    }
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self) -> Result<Subscription, ServiceError>;
}

/// Phoenix channel frame as spoken by Supabase Realtime.
#[derive(Debug, Serialize, Deserialize)]
pub struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Inbound {
    Event(FeedEvent),
    ChannelClosed(String),
    Ignore,
}

pub(crate) fn realtime_url(store_url: &str, api_key: &str) -> String {
    let base = store_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/realtime/v1/websocket?apikey={}&vsn=1.0.0", base, api_key)
}

pub(crate) fn decode_frame(frame: PhoenixFrame, topic: &str, join_ref: &str) -> Inbound {
    if frame.topic != topic {
        return Inbound::Ignore;
    }

    match frame.event.as_str() {
        "phx_reply" if frame.reference.as_deref() == Some(join_ref) => {
            if frame.payload["status"] == "ok" {
                Inbound::Event(FeedEvent::Accepted)
            } else {
                Inbound::Event(FeedEvent::Rejected(frame.payload["response"].to_string()))
            }
        }
        "postgres_changes" => {
            let data = &frame.payload["data"];
            if data["type"] != "INSERT" {
                return Inbound::Ignore;
            }
            match serde_json::from_value::<Message>(data["record"].clone()) {
                Ok(row) => Inbound::Event(FeedEvent::Insert(row)),
                Err(e) => {
                    warn!("Skipping undecodable inserted row: {}", e);
                    Inbound::Ignore
                }
            }
        }
        "phx_error" | "phx_close" => Inbound::ChannelClosed(frame.event),
        _ => Inbound::Ignore,
    }
}

enum SessionEnd {
    Released,
    Dropped {
        error: ServiceError,
        /// The channel join was accepted before the drop.
        accepted: bool,
    },
}

impl SessionEnd {
    fn dropped(error: impl Into<ServiceError>, accepted: bool) -> Self {
        SessionEnd::Dropped {
            error: error.into(),
            accepted,
        }
    }
}

/// Change feed backed by Supabase Realtime.
#[derive(Clone)]
pub struct RealtimeFeed {
    url: String,
    api_key: String,
    table: String,
    recovery: RecoveryManager,
}

impl RealtimeFeed {
    pub fn new(store_url: &str, api_key: &str, recovery: RecoveryManager) -> Self {
        Self {
            url: realtime_url(store_url, api_key),
            api_key: api_key.to_string(),
            table: StoreConfig::MESSAGES_TABLE.to_string(),
            recovery,
        }
    }

    fn topic(&self) -> String {
        format!("realtime:{}:{}", StoreConfig::SCHEMA, self.table)
    }

    fn join_frame(&self, join_ref: &str) -> PhoenixFrame {
        PhoenixFrame {
            topic: self.topic(),
            event: "phx_join".to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "ack": false, "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [
                        { "event": "INSERT", "schema": StoreConfig::SCHEMA, "table": self.table }
                    ],
                    "private": false
                },
                "access_token": self.api_key,
            }),
            reference: Some(join_ref.to_string()),
            join_ref: Some(join_ref.to_string()),
        }
    }

    /// Runs one connection until release or disconnect.
    async fn run_session(
        &self,
        events: &mpsc::UnboundedSender<FeedEvent>,
        release: &mut oneshot::Receiver<()>,
        session: u64,
    ) -> SessionEnd {
        let ws_stream = tokio::select! {
            _ = &mut *release => return SessionEnd::Released,
            connected = connect_async(self.url.as_str()) => match connected {
                Ok((ws_stream, _)) => ws_stream,
                Err(e) => return SessionEnd::dropped(e, false),
            },
        };
        let (mut write, mut read) = ws_stream.split();

        let topic = self.topic();
        let join_ref = session.to_string();
        let mut next_ref = 0u64;
        let mut accepted = false;

        let join = match serde_json::to_string(&self.join_frame(&join_ref)) {
            Ok(join) => join,
            Err(e) => return SessionEnd::dropped(e, false),
        };
        if let Err(e) = write.send(WsMessage::Text(join.into())).await {
            return SessionEnd::dropped(e, false);
        }

        let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                _ = &mut *release => {
                    next_ref += 1;
                    let leave = json!({
                        "topic": topic,
                        "event": "phx_leave",
                        "payload": {},
                        "ref": format!("leave-{}", next_ref),
                    });
                    let _ = write.send(WsMessage::Text(leave.to_string().into())).await;
                    let _ = write.close().await;
                    info!("Released realtime subscription on {}", topic);
                    return SessionEnd::Released;
                }
                _ = heartbeat.tick() => {
                    next_ref += 1;
                    let beat = json!({
                        "topic": "phoenix",
                        "event": "heartbeat",
                        "payload": {},
                        "ref": format!("hb-{}", next_ref),
                    });
                    if let Err(e) = write.send(WsMessage::Text(beat.to_string().into())).await {
                        return SessionEnd::dropped(e, accepted);
                    }
                }
                message = read.next() => {
                    let text = match message {
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(WsMessage::Close(_))) | None => {
                            return SessionEnd::dropped(
                                ServiceError::WebSocket("Realtime connection closed".to_string()),
                                accepted,
                            );
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return SessionEnd::dropped(e, accepted),
                    };

                    let frame = match serde_json::from_str::<PhoenixFrame>(text.as_str()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("Skipping undecodable realtime frame: {}", e);
                            continue;
                        }
                    };

                    match decode_frame(frame, &topic, &join_ref) {
                        Inbound::Event(event) => {
                            if event == FeedEvent::Accepted {
                                accepted = true;
                            }
                            if events.send(event).is_err() {
                                debug!("Subscription receiver gone, leaving channel");
                                let _ = write.close().await;
                                return SessionEnd::Released;
                            }
                        }
                        Inbound::ChannelClosed(reason) => {
                            return SessionEnd::dropped(
                                ServiceError::WebSocket(format!("Realtime channel closed: {}", reason)),
                                accepted,
                            );
                        }
                        Inbound::Ignore => {}
                    }
                }
            }
        }
    }

    async fn run(
        self,
        events: mpsc::UnboundedSender<FeedEvent>,
        mut release: oneshot::Receiver<()>,
    ) {
        let mut joins = 0u64;
        let mut failures = 0u32;

        loop {
            joins += 1;
            match self.run_session(&events, &mut release, joins).await {
                SessionEnd::Released => return,
                SessionEnd::Dropped { error, accepted } => {
                    // A healthy session starts the backoff over.
                    if accepted {
                        failures = 0;
                    }
                    failures += 1;
                    let delay = self.recovery.delay_for(failures);
                    error!(
                        "Realtime subscription dropped: {}. Rejoining in {:?}",
                        error, delay
                    );
                    tokio::select! {
                        _ = &mut release => return,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn subscribe(&self) -> Result<Subscription, ServiceError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = oneshot::channel();

        info!("Subscribing to inserts on {}", self.topic());
        tokio::spawn(self.clone().run(event_tx, release_rx));

        Ok(Subscription::new(event_rx, release_tx))
    }
}
