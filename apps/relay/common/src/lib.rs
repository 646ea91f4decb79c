pub mod discord;
pub mod gateway;
pub mod ingest;
pub mod realtime;
pub mod recovery;
pub mod render;
pub mod store;
pub mod view;

#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use entity::Message;

/// A message-create event as delivered by the chat gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub id: String,
    pub channel_id: String,
    pub author: ChatAuthor,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatAuthor {
    pub name: String,
    pub is_bot: bool,
    pub avatar_url: Option<String>,
}

/// Custom error types
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Gateway closed the connection ({code}): {reason}")]
    GatewayClosed { code: u16, reason: String },

    #[error("Store API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Recovery failed after {attempts} attempts: {message}")]
    RecoveryFailed { attempts: u32, message: String },

    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for ServiceError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ServiceError::WebSocket(e.to_string())
    }
}

/// Store table and query constants shared by both sides of the relay.
pub struct StoreConfig;

impl StoreConfig {
    pub const MESSAGES_TABLE: &'static str = "messages";
    pub const CONFLICT_KEY: &'static str = "discord_message_id";
    pub const SCHEMA: &'static str = "public";
    pub const HISTORY_LIMIT: u64 = 50;
}

pub mod logger {
    use tracing_subscriber::EnvFilter;

    /// Installs the fmt subscriber, honouring `RUST_LOG` and defaulting to `info`.
    pub fn init() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }
}

pub mod config {
    use config::{Config, ConfigError, Environment};
    use dotenv::dotenv;
    use serde::Deserialize;
    use std::fmt;

    use crate::view::MergePolicy;

    #[derive(Deserialize)]
    pub struct IngestConfig {
        pub discord_bot_token: String,
        pub discord_channel_id: String,
        pub supabase_url: Option<String>,
        pub supabase_service_role_key: Option<String>,
        pub database_url: Option<String>,
        pub health_addr: String,
    }

    impl IngestConfig {
        pub fn new() -> Result<Self, ConfigError> {
            // Load environment variables from .env file
            dotenv().ok();

            let mut s = Config::new();
            s.set_default("health_addr", "0.0.0.0:8080")?;

            // Eg.. `APP_DISCORD_CHANNEL_ID=1234` would set the `discord_channel_id` key
            s.merge(Environment::with_prefix("APP"))?;

            s.try_into()
        }
    }

    impl fmt::Debug for IngestConfig {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("IngestConfig")
                .field("discord_bot_token", &"<redacted>")
                .field("discord_channel_id", &self.discord_channel_id)
                .field("supabase_url", &self.supabase_url)
                .field(
                    "supabase_service_role_key",
                    &self.supabase_service_role_key.as_ref().map(|_| "<redacted>"),
                )
                .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
                .field("health_addr", &self.health_addr)
                .finish()
        }
    }

    #[derive(Deserialize)]
    pub struct ViewerConfig {
        pub supabase_url: String,
        pub supabase_anon_key: String,
        pub http_addr: String,
        pub dedup_messages: bool,
    }

    impl ViewerConfig {
        pub fn new() -> Result<Self, ConfigError> {
            dotenv().ok();

            let mut s = Config::new();
            s.set_default("http_addr", "0.0.0.0:3000")?;
            s.set_default("dedup_messages", false)?;
            s.merge(Environment::with_prefix("APP"))?;

            s.try_into()
        }

        pub fn merge_policy(&self) -> MergePolicy {
            if self.dedup_messages {
                MergePolicy::DedupByExternalId
            } else {
                MergePolicy::PrependAll
            }
        }
    }

    impl fmt::Debug for ViewerConfig {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("ViewerConfig")
                .field("supabase_url", &self.supabase_url)
                .field("supabase_anon_key", &"<redacted>")
                .field("http_addr", &self.http_addr)
                .field("dedup_messages", &self.dedup_messages)
                .finish()
        }
    }
}
