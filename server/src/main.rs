//! TV Relay - Webhook server entry point

mod config;
mod routes;

use anyhow::Context;
use config::Config;
use relay_engine::{Dispatcher, Engine};
use relay_networking::ExchangeClient;
use relay_state::RelayState;
use routes::{build_router, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "relay_server=debug,relay_engine=debug,relay_networking=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        eprintln!("FATAL: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting TV Relay against {}", config.base_url);

    let client = Arc::new(ExchangeClient::new(config.client_config()));
    let state = Arc::new(RelayState::new());
    let engine = Arc::new(Engine::new(client, state, config.engine.clone()));
    let dispatcher = Arc::new(Dispatcher::new(engine));

    let app = build_router(AppState {
        dispatcher,
        webhook_token: config.webhook_token.clone(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .await
        .context("Server error")?;
    Ok(())
}
