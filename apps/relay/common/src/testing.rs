use crate::realtime::{ChangeFeed, FeedEvent, Subscription};
use crate::store::{MessageStore, NewMessage};
use crate::{Message, ServiceError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration as StdDuration;
use tokio::sync::{Notify, mpsc, oneshot};

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

pub fn row(id: i64, external_id: &str, content: &str, created_at: DateTime<Utc>) -> Message {
    Message {
        id,
        discord_message_id: external_id.to_string(),
        content: content.to_string(),
        author_username: "alice".to_string(),
        author_avatar_url: None,
        channel_id: "target".to_string(),
        created_at,
    }
}

/// In-memory store with the same keyed-upsert semantics as the real table.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<Message>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    hold_reads: Option<Notify>,
}

impl MemoryStore {
    pub fn with_rows(rows: Vec<Message>) -> Self {
        Self {
            rows: Mutex::new(rows),
            ..Default::default()
        }
    }

    /// Reads block until [`MemoryStore::release_reads`] is called.
    pub fn holding_reads(rows: Vec<Message>) -> Self {
        Self {
            rows: Mutex::new(rows),
            hold_reads: Some(Notify::new()),
            ..Default::default()
        }
    }

    pub fn release_reads(&self) {
        if let Some(hold) = &self.hold_reads {
            hold.notify_one();
        }
    }

    pub fn set_failing_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_failing_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<Message> {
        self.rows.lock().unwrap().clone()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn upsert(&self, message: &NewMessage) -> Result<(), ServiceError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ServiceError::Api {
                status: 503,
                body: "store unavailable".to_string(),
            });
        }

        let mut rows = self.rows.lock().unwrap();
        match rows
            .iter_mut()
            .find(|row| row.discord_message_id == message.discord_message_id)
        {
            Some(existing) => {
                existing.content = message.content.clone();
                existing.author_username = message.author_username.clone();
                existing.author_avatar_url = message.author_avatar_url.clone();
                existing.channel_id = message.channel_id.clone();
            }
            None => {
                let id = rows.iter().map(|row| row.id).max().unwrap_or(0) + 1;
                rows.push(Message {
                    id,
                    discord_message_id: message.discord_message_id.clone(),
                    content: message.content.clone(),
                    author_username: message.author_username.clone(),
                    author_avatar_url: message.author_avatar_url.clone(),
                    channel_id: message.channel_id.clone(),
                    created_at: base_time() + Duration::seconds(id),
                });
            }
        }

        Ok(())
    }

    async fn recent(&self, limit: u64) -> Result<Vec<Message>, ServiceError> {
        if let Some(hold) = &self.hold_reads {
            hold.notified().await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ServiceError::Api {
                status: 500,
                body: "read failed".to_string(),
            });
        }

        let mut rows = self.rows();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        rows.truncate(limit as usize);
        Ok(rows)
    }
}

/// Change feed driven by the test through [`FakeFeed::push`].
#[derive(Default)]
pub struct FakeFeed {
    events: Mutex<Option<mpsc::UnboundedSender<FeedEvent>>>,
    released: std::sync::Arc<AtomicBool>,
    fail: bool,
}

impl FakeFeed {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Delivers an event; returns false once the subscriber is gone.
    pub fn push(&self, event: FeedEvent) -> bool {
        match self.events.lock().unwrap().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.events.lock().unwrap().is_some()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeFeed for FakeFeed {
    async fn subscribe(&self) -> Result<Subscription, ServiceError> {
        if self.fail {
            return Err(ServiceError::WebSocket("connection refused".to_string()));
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        *self.events.lock().unwrap() = Some(event_tx);

        let released = self.released.clone();
        tokio::spawn(async move {
            let _ = release_rx.await;
            released.store(true, Ordering::SeqCst);
        });

        Ok(Subscription::new(event_rx, release_tx))
    }
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    check().await
}
