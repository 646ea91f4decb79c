use crate::store::{MessageStore, NewMessage};
use crate::{ChatEvent, ServiceError};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    OtherChannel,
    BotAuthor,
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterReason::OtherChannel => write!(f, "not the target channel"),
            FilterReason::BotAuthor => write!(f, "authored by a bot"),
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    Filtered(FilterReason),
    Stored,
    Failed(ServiceError),
}

impl From<&ChatEvent> for NewMessage {
    fn from(event: &ChatEvent) -> Self {
        NewMessage {
            discord_message_id: event.id.clone(),
            content: event.content.clone(),
            author_username: event.author.name.clone(),
            author_avatar_url: event.author.avatar_url.clone(),
            channel_id: event.channel_id.clone(),
        }
    }
}

/// Persists qualifying chat events from one channel into the message store.
pub struct IngestAgent {
    store: Arc<dyn MessageStore>,
    target_channel_id: String,
}

impl IngestAgent {
    pub fn new(store: Arc<dyn MessageStore>, target_channel_id: String) -> Self {
        Self {
            store,
            target_channel_id,
        }
    }

    pub fn target_channel_id(&self) -> &str {
        &self.target_channel_id
    }

    pub fn admit(&self, event: &ChatEvent) -> Result<(), FilterReason> {
        if event.channel_id != self.target_channel_id {
            return Err(FilterReason::OtherChannel);
        }
        // Our own writes must never loop back in.
        if event.author.is_bot {
            return Err(FilterReason::BotAuthor);
        }
        Ok(())
    }

    /// Filter, transform, upsert and report a single event. Store failures
    /// are logged and the event is dropped; nothing is retried.
    pub async fn handle(&self, event: ChatEvent) -> Outcome {
        if let Err(reason) = self.admit(&event) {
            debug!("Dropping message {}: {}", event.id, reason);
            return Outcome::Filtered(reason);
        }

        info!(
            "New message from {}: {}",
            event.author.name, event.content
        );

        let record = NewMessage::from(&event);
        match self.store.upsert(&record).await {
            Ok(()) => {
                info!("Message {} saved to store", record.discord_message_id);
                Outcome::Stored
            }
            Err(e) => {
                error!(
                    "Failed to save message {}: {}",
                    record.discord_message_id, e
                );
                Outcome::Failed(e)
            }
        }
    }

    /// Handles every event from the gateway on its own task, so a slow or
    /// failing write never holds up the next event.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ChatEvent>) {
        while let Some(event) = events.recv().await {
            let agent = self.clone();
            tokio::spawn(async move {
                agent.handle(event).await;
            });
        }
        info!("Gateway event stream ended");
    }
}
