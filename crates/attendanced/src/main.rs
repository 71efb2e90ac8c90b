use anyhow::{Context, Result};
use attendance_core::{Clock, IdentityCache, PipelineState, SystemClock};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod frame;
mod sink;
mod store;

use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("attendanced starting");

    let config = config::Config::load()?;
    tracing::info!(
        db = %config.db_path.display(),
        threshold = config.match_threshold,
        encoding_dim = config.encoding_dim,
        "configuration loaded"
    );

    let store = store::SqliteStore::open(&config.db_path).context("opening identity database")?;
    let store = Arc::new(store);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let cache = Arc::new(
        IdentityCache::new(store.clone(), clock.clone(), config.cache_staleness())
            .with_reload_attempts(config.reload_attempts)
            .with_expected_dim(config.encoding_dim),
    );
    // Inconsistent encodings would poison every match; refuse to start on them.
    match cache.reload() {
        Ok(snapshot) => tracing::info!(identities = snapshot.len(), "identities loaded"),
        Err(err) if err.is_fatal() => {
            return Err(err).context("identity database failed validation");
        }
        Err(err) => tracing::warn!(error = %err, "initial identity load failed; will retry"),
    }

    let state = Arc::new(PipelineState::new(cache, config.cooldown_policy()));
    let (events_tx, events_rx) = broadcast::channel(64);
    let sink = Arc::new(sink::DaemonSink::new(store.clone(), events_tx));

    let engine = engine::spawn_engine(state.clone(), sink, clock, config.pipeline_settings())?;

    let service =
        AttendanceService::new(state.clone(), store, engine.handle(), config.encoding_dim);
    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on the session bus")?;
    let forwarder = tokio::spawn(dbus_interface::forward_events(conn.clone(), events_rx));

    if config.autostart_session {
        let state = state.clone();
        tokio::task::spawn_blocking(move || state.start_session()).await?;
    }

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "attendanced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("attendanced shutting down");

    tokio::task::spawn_blocking(move || engine.shutdown()).await??;
    forwarder.abort();

    Ok(())
}
