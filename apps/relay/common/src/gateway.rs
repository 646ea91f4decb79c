use crate::discord::{self, GATEWAY_URL, Hello, Opcode, Ready};
use crate::recovery::RecoveryManager;
use crate::{ChatEvent, ServiceError};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, sleep};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, error, info, warn};

struct Session {
    session_id: String,
    resume_url: String,
}

enum SessionEnd {
    Reconnect,
    InvalidSession { resumable: bool },
}

/// Long-lived chat gateway connection. Forwards every message-create event
/// to the channel handed to [`GatewayClient::run`], reconnecting (and
/// resuming where possible) whenever the connection drops.
pub struct GatewayClient {
    token: String,
    gateway_url: String,
    recovery: RecoveryManager,
    session: Option<Session>,
    sequence: Option<u64>,
    failures: u32,
}

impl GatewayClient {
    pub fn new(token: String, recovery: RecoveryManager) -> Self {
        Self {
            token,
            gateway_url: GATEWAY_URL.to_string(),
            recovery,
            session: None,
            sequence: None,
            failures: 0,
        }
    }

    pub async fn run(mut self, events: mpsc::UnboundedSender<ChatEvent>) -> Result<(), ServiceError> {
        loop {
            let ended = self.run_session(&events).await;
            let wait = self.next_attempt(ended)?;

            if events.is_closed() {
                info!("Event receiver dropped, stopping gateway client");
                return Ok(());
            }
            sleep(wait).await;
        }
    }

    /// Settles session state after a session ends and returns how long to
    /// wait before connecting again. Fatal close codes end the client.
    fn next_attempt(&mut self, ended: Result<SessionEnd, ServiceError>) -> Result<Duration, ServiceError> {
        match ended {
            Ok(SessionEnd::Reconnect) => {
                info!("Gateway asked for a reconnect");
                Ok(Duration::ZERO)
            }
            Ok(SessionEnd::InvalidSession { resumable }) => {
                if !resumable {
                    self.forget_session();
                }
                let wait = Duration::from_millis(rand::random_range(1000..5000));
                warn!("Gateway invalidated the session, identifying again in {:?}", wait);
                Ok(wait)
            }
            Err(ServiceError::GatewayClosed { code, reason }) if discord::is_fatal_close(code) => {
                error!("Gateway refused the connection ({}): {}", code, reason);
                Err(ServiceError::GatewayClosed { code, reason })
            }
            Err(e) => {
                if let ServiceError::GatewayClosed { code: 4007 | 4009, .. } = e {
                    self.forget_session();
                }
                self.failures += 1;
                let delay = self.recovery.delay_for(self.failures);
                warn!(
                    "Gateway connection lost (attempt {}): {}. Reconnecting in {:?}",
                    self.failures, e, delay
                );
                Ok(delay)
            }
        }
    }

    fn forget_session(&mut self) {
        self.session = None;
        self.sequence = None;
    }

    async fn run_session(
        &mut self,
        events: &mpsc::UnboundedSender<ChatEvent>,
    ) -> Result<SessionEnd, ServiceError> {
        let url = match &self.session {
            Some(session) => format!(
                "{}/?v=10&encoding=json",
                session.resume_url.trim_end_matches('/')
            ),
            None => self.gateway_url.clone(),
        };

        info!("Connecting to gateway: {}", url);

        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let hello = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let payload = discord::parse_payload(text.as_str())?;
                    if payload.op == Opcode::HELLO {
                        break serde_json::from_value::<Hello>(payload.d)?;
                    }
                }
                Some(Ok(Message::Close(frame))) => return Err(close_error(frame)),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(ServiceError::WebSocket(
                        "Gateway closed before hello".to_string(),
                    ));
                }
            }
        };

        let handshake = match (&self.session, self.sequence) {
            (Some(session), Some(sequence)) => {
                info!("Resuming gateway session at sequence {}", sequence);
                discord::resume(&self.token, &session.session_id, sequence)
            }
            _ => discord::identify(&self.token),
        };
        write.send(Message::Text(handshake.into())).await?;

        let period = Duration::from_millis(hello.heartbeat_interval);
        let jitter = period.mul_f64(rand::random::<f64>());
        let mut heartbeat = interval_at(Instant::now() + jitter, period);
        let mut awaiting_ack = false;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if awaiting_ack {
                        warn!("Heartbeat was not acknowledged, reconnecting");
                        let _ = write.close().await;
                        return Ok(SessionEnd::Reconnect);
                    }
                    write.send(Message::Text(discord::heartbeat(self.sequence).into())).await?;
                    awaiting_ack = true;
                }
                message = read.next() => {
                    let text = match message {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(frame))) => return Err(close_error(frame)),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            return Err(ServiceError::WebSocket("Gateway connection closed".to_string()));
                        }
                    };

                    let payload = match discord::parse_payload(text.as_str()) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!("Skipping undecodable gateway frame: {}", e);
                            continue;
                        }
                    };

                    if let Some(sequence) = payload.s {
                        self.sequence = Some(sequence);
                    }

                    match payload.op {
                        Opcode::DISPATCH => self.dispatch(payload, events),
                        Opcode::HEARTBEAT => {
                            write.send(Message::Text(discord::heartbeat(self.sequence).into())).await?;
                        }
                        Opcode::HEARTBEAT_ACK => awaiting_ack = false,
                        Opcode::RECONNECT => {
                            let _ = write.close().await;
                            return Ok(SessionEnd::Reconnect);
                        }
                        Opcode::INVALID_SESSION => {
                            let resumable = payload.d.as_bool().unwrap_or(false);
                            let _ = write.close().await;
                            return Ok(SessionEnd::InvalidSession { resumable });
                        }
                        other => debug!("Ignoring gateway opcode {}", other),
                    }
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        payload: discord::GatewayPayload,
        events: &mpsc::UnboundedSender<ChatEvent>,
    ) {
        match payload.t.as_deref() {
            Some("READY") => match serde_json::from_value::<Ready>(payload.d) {
                Ok(ready) => {
                    info!("Bot is online as {}", ready.user.tag());
                    self.session = Some(Session {
                        session_id: ready.session_id,
                        resume_url: ready.resume_gateway_url,
                    });
                    self.failures = 0;
                }
                Err(e) => warn!("Failed to decode READY: {}", e),
            },
            Some("RESUMED") => {
                info!("Gateway session resumed");
                self.failures = 0;
            }
            Some("MESSAGE_CREATE") => match discord::parse_message_create(payload.d) {
                Ok(event) => {
                    if events.send(event).is_err() {
                        warn!("Event receiver dropped, message discarded");
                    }
                }
                Err(e) => warn!("Failed to decode MESSAGE_CREATE: {}", e),
            },
            _ => {}
        }
    }
}

fn close_error(frame: Option<CloseFrame>) -> ServiceError {
    match frame {
        Some(frame) => ServiceError::GatewayClosed {
            code: u16::from(frame.code),
            reason: frame.reason.as_str().to_string(),
        },
        None => ServiceError::WebSocket("Gateway closed without a close frame".to_string()),
    }
}
