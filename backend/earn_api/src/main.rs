//! Earn API entry point.
//!
//! Serves listings, submissions, grant tranches and submission credits over
//! an Axum REST API backed by SQLite. Notifications are handed to an
//! external job broker.

mod api;
mod auth;
mod config;
mod credits;
mod db;
mod errors;
mod listings;
mod models;
mod notifications;
mod tranche;

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::DecodingKey;
use reqwest::Client;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use notifications::{HttpBroker, NotificationQueue};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG controls verbosity.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Optional .env file.
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    let pool = db::init_pool(&config.database_url, config.db_max_connections).await?;

    let client = Client::builder()
        .timeout(Duration::from_secs(config.broker_timeout_secs))
        .build()?;
    let broker = HttpBroker::new(client, config.broker_url.clone());
    info!(url = %config.broker_url, "Notification broker configured");

    let state = Arc::new(api::ApiState {
        pool,
        notifications: NotificationQueue::new(Arc::new(broker)),
        jwt_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        monthly_credit_allowance: config.monthly_credit_allowance,
    });
    let app = api::router(state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
