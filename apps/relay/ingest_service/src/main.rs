use actix_web::{App, HttpResponse, HttpServer, web};
use chrono::Utc;
use common::config::IngestConfig;
use common::gateway::GatewayClient;
use common::ingest::IngestAgent;
use common::recovery::RecoveryManager;
use common::store::{DatabaseStore, MessageStore, PostgrestStore};
use common::{ServiceError, logger};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

async fn build_store(
    config: &IngestConfig,
    recovery: &RecoveryManager,
) -> Result<Arc<dyn MessageStore>, ServiceError> {
    if let Some(database_url) = &config.database_url {
        info!("Writing messages straight to Postgres");
        let store = recovery
            .execute(|| DatabaseStore::connect(database_url))
            .await?;
        return Ok(Arc::new(store));
    }

    match (&config.supabase_url, &config.supabase_service_role_key) {
        (Some(url), Some(key)) => {
            info!("Writing messages through the REST API at {}", url);
            Ok(Arc::new(PostgrestStore::new(url, key)?))
        }
        _ => Err(ServiceError::Config(
            "set APP_DATABASE_URL, or APP_SUPABASE_URL and APP_SUPABASE_SERVICE_ROLE_KEY"
                .to_string(),
        )),
    }
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": Utc::now()
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logger::init();

    let config = IngestConfig::new()?;
    info!("Starting ingest service with settings: {:?}", config);

    let recovery = RecoveryManager::new(
        5,                       // max attempts
        Duration::from_secs(1),  // base delay
        Duration::from_secs(60), // max delay
    );

    let store = build_store(&config, &recovery).await?;
    let agent = Arc::new(IngestAgent::new(store, config.discord_channel_id.clone()));
    info!("Listening to channel: {}", agent.target_channel_id());

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let gateway = GatewayClient::new(config.discord_bot_token.clone(), recovery);

    let health_server =
        HttpServer::new(|| App::new().route("/health", web::get().to(health_check)))
            .bind(&config.health_addr)?
            .run();

    tokio::select! {
        result = health_server => {
            if let Err(e) = result {
                error!("Health server error: {:?}", e);
            }
        }
        result = gateway.run(event_tx) => {
            if let Err(e) = result {
                error!("Gateway error: {}", e);
                return Err(e.into());
            }
        }
        _ = agent.run(event_rx) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    Ok(())
}
