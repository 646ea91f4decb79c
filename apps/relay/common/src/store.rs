use crate::{Message, ServiceError, StoreConfig};
use async_trait::async_trait;
use entity::message;
use migration::{Migrator, MigratorTrait};
use reqwest::{Client, Request, Response};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ConnectOptions, Database, DatabaseConnection, EntityTrait, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// The writable part of a message row. Everything except `discord_message_id`
/// is overwritten when a row with the same key already exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub discord_message_id: String,
    pub content: String,
    pub author_username: String,
    pub author_avatar_url: Option<String>,
    pub channel_id: String,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert-or-update keyed by `discord_message_id`.
    async fn upsert(&self, message: &NewMessage) -> Result<(), ServiceError>;

    /// The most recent `limit` rows, newest first.
    async fn recent(&self, limit: u64) -> Result<Vec<Message>, ServiceError>;
}

/// Supabase REST (PostgREST) access. The service-role key grants writes, the
/// anonymous key is enough for reads.
pub struct PostgrestStore {
    client: Client,
    table_url: String,
    api_key: String,
}

impl PostgrestStore {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, ServiceError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;

        Ok(Self {
            client,
            table_url: table_url(base_url, StoreConfig::MESSAGES_TABLE),
            api_key: api_key.to_string(),
        })
    }
}

pub(crate) fn table_url(base_url: &str, table: &str) -> String {
    format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table)
}

async fn check_status(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ServiceError::Api {
        status: status.as_u16(),
        body,
    })
}

impl PostgrestStore {
    fn upsert_request(&self, message: &NewMessage) -> Result<Request, ServiceError> {
        Ok(self
            .client
            .post(&self.table_url)
            .query(&[("on_conflict", StoreConfig::CONFLICT_KEY)])
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[message])
            .build()?)
    }

    fn recent_request(&self, limit: u64) -> Result<Request, ServiceError> {
        Ok(self
            .client
            .get(&self.table_url)
            .query(&[
                ("select", "*".to_string()),
                ("order", "created_at.desc,id.desc".to_string()),
                ("limit", limit.to_string()),
            ])
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .build()?)
    }
}

#[async_trait]
impl MessageStore for PostgrestStore {
    async fn upsert(&self, message: &NewMessage) -> Result<(), ServiceError> {
        let request = self.upsert_request(message)?;
        let response = self.client.execute(request).await?;

        check_status(response).await?;
        Ok(())
    }

    async fn recent(&self, limit: u64) -> Result<Vec<Message>, ServiceError> {
        let request = self.recent_request(limit)?;
        let response = self.client.execute(request).await?;

        Ok(check_status(response).await?.json::<Vec<Message>>().await?)
    }
}

/// Direct Postgres access through sea-orm.
#[derive(Clone)]
pub struct DatabaseStore {
    db: DatabaseConnection,
}

impl DatabaseStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Connects and brings the schema up to date.
    pub async fn connect(database_url: &str) -> Result<Self, ServiceError> {
        let db = Database::connect(
            ConnectOptions::new(database_url)
                .sqlx_logging(false)
                .to_owned(),
        )
        .await?;

        info!("Running database migrations...");
        Migrator::up(&db, None).await?;
        info!("Migrations completed successfully");

        Ok(Self::new(db))
    }
}

#[async_trait]
impl MessageStore for DatabaseStore {
    async fn upsert(&self, message: &NewMessage) -> Result<(), ServiceError> {
        let model = message::ActiveModel {
            discord_message_id: Set(message.discord_message_id.clone()),
            content: Set(message.content.clone()),
            author_username: Set(message.author_username.clone()),
            author_avatar_url: Set(message.author_avatar_url.clone()),
            channel_id: Set(message.channel_id.clone()),
            ..Default::default()
        };

        // `id` and `created_at` come from the database on first insert and
        // are left out of the update list so they keep those values.
        message::Entity::insert(model)
            .on_conflict(
                OnConflict::column(message::Column::DiscordMessageId)
                    .update_columns([
                        message::Column::Content,
                        message::Column::AuthorUsername,
                        message::Column::AuthorAvatarUrl,
                        message::Column::ChannelId,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        Ok(())
    }

    async fn recent(&self, limit: u64) -> Result<Vec<Message>, ServiceError> {
        let rows = message::Entity::find()
            .order_by_desc(message::Column::CreatedAt)
            .order_by_desc(message::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?;

        Ok(rows)
    }
}
