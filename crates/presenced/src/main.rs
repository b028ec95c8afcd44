use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod http;
mod rate_limiter;
mod store;

use config::Config;
use dbus_interface::{AppState, PresenceService};
use http::MatcherBackend;
use store::EnrollmentStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::from_env();
    tracing::info!(
        db = %config.db_path.display(),
        required_gestures = config.required_gestures,
        challenge_timeout_ms = config.challenge_timeout_ms,
        "configuration loaded"
    );

    let store = EnrollmentStore::open(&config.db_path)
        .await
        .context("failed to open enrollment store")?;

    let matcher = MatcherBackend::from_config(&config);
    let engine = engine::spawn_engine(
        matcher,
        config.gesture_config(),
        config.sequencer_config(),
    );

    let session_bus = config.session_bus;
    let state = Arc::new(Mutex::new(AppState {
        config,
        engine,
        store,
    }));

    let service = PresenceService { state };

    let builder = if session_bus {
        tracing::warn!("running on the session bus (development mode)");
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };

    let _conn = builder
        .name("org.freedesktop.Presence1")?
        .serve_at("/org/freedesktop/Presence1", service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!("presenced ready on org.freedesktop.Presence1");

    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    Ok(())
}
