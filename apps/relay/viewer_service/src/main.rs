use actix_web::{App, HttpResponse, HttpServer, web};
use chrono::Utc;
use common::config::ViewerConfig;
use common::realtime::{ChangeFeed, RealtimeFeed};
use common::recovery::RecoveryManager;
use common::store::{MessageStore, PostgrestStore};
use common::view::LiveView;
use common::{logger, render};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

async fn index(view: web::Data<LiveView>) -> HttpResponse {
    let snapshot = view.snapshot().await;
    match render::page(&snapshot) {
        Ok(html) => HttpResponse::Ok()
            .content_type("text/html; charset=utf-8")
            .body(html),
        Err(e) => {
            error!("Failed to render page: {}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

async fn messages(view: web::Data<LiveView>) -> HttpResponse {
    HttpResponse::Ok().json(view.snapshot().await)
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

    let config = ViewerConfig::new()?;
    info!("Starting viewer service with settings: {:?}", config);

    let store: Arc<dyn MessageStore> = Arc::new(PostgrestStore::new(
        &config.supabase_url,
        &config.supabase_anon_key,
    )?);
    let feed: Arc<dyn ChangeFeed> = Arc::new(RealtimeFeed::new(
        &config.supabase_url,
        &config.supabase_anon_key,
        RecoveryManager::new(
            5,                       // max attempts
            Duration::from_secs(1),  // base delay
            Duration::from_secs(30), // max delay
        ),
    ));

    let view = LiveView::new(config.merge_policy());
    let mounted = view.mount(store, feed);

    let data = web::Data::new(view);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/", web::get().to(index))
            .route("/messages", web::get().to(messages))
            .route("/health", web::get().to(health_check))
    })
    .bind(&config.http_addr)?
    .run();

    info!("Serving live view on http://{}", config.http_addr);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("HTTP server error: {:?}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    mounted.unmount().await;
    Ok(())
}
