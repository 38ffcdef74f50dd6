//! Main entry point for the kiln engine server.
//!
//! Starts the HTTP + WebSocket facade with configuration from
//! environment variables.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiln::{config::Config, server, AppState, Engine, IdentityVerifier};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let addr = format!("0.0.0.0:{}", config.port);

    let verifier = IdentityVerifier::new(
        config.supabase_url.clone(),
        config.supabase_anon_key.clone(),
    );
    info!(endpoint = %verifier.verify_url(), "token verification endpoint");

    let state = AppState {
        engine: Arc::new(Engine::new(config)),
        verifier: Arc::new(verifier),
    };

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|err| anyhow::anyhow!("failed to bind {addr} (port in use?): {err}"))?;
    info!(%addr, "kiln engine listening");

    server::serve(listener, state).await
}
