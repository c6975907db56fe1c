use std::{net::SocketAddr, sync::Arc};

use chatvault::{
    build_app,
    irc::{IrcClient, IrcConfig},
    state::{AppConfig, AppState},
    store::memory::MemoryStore,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chatvault=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let irc_config = IrcConfig::from_env().map_err(std::io::Error::other)?;
    let store = Arc::new(MemoryStore::default());
    let state = AppState::with_config(store, AppConfig::from_env());

    let irc = IrcClient::spawn(irc_config, state.pipeline.clone(), state.metrics.clone());
    let state = state.with_irc(irc.clone());

    let app = build_app(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "chatvault listening");

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        })
        .await?;

    irc.shutdown();
    state.pipeline.stop().await;
    info!("shutdown complete");
    Ok(())
}
