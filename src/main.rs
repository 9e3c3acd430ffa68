mod api;
mod browser;
mod classify;
mod config;
mod dom;
mod engine;
mod reveal;
mod series;
mod settings;
mod state;
mod timer;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::settings::Settings;
use crate::state::{AppStateInner, LocalState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,chromiumoxide::conn=off,chromiumoxide::handler=off")
        }))
        .init();

    let config = Config::from_env().context("failed to load configuration")?;

    tracing::info!(
        "skipjack starting, player: {}, listen: {}",
        config.player_url,
        config.listen_addr,
    );

    let settings = Settings::load(&config.settings_file).context("failed to load settings")?;
    let local = LocalState::load(&config.state_file);

    let state: crate::state::AppState = Arc::new(Mutex::new(AppStateInner::new(
        config.clone(),
        settings,
        local,
    )));

    // Settings live-reload and the sleep-timer coordinator run for the life
    // of the process; the automation loop itself is started over the API.
    tokio::spawn(settings::run_settings_watch(state.clone()));
    tokio::spawn(timer::run_timer(state.clone()));

    let app = api::router(state).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .context(format!("failed to bind to {}", config.listen_addr))?;

    tracing::info!("listening on {}", config.listen_addr);

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
