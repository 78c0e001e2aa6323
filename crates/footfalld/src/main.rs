use anyhow::Result;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{CounterService, BUS_NAME, OBJECT_PATH};
use engine::{EngineEvent, SharedStatus, VisitSummary};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "footfalld starting");

    let config = config::Config::load()?;
    tracing::info!(
        camera = %config.camera.device,
        replay = ?config.replay_dir,
        debug_dir = ?config.debug_dir,
        db = %config.db_path.display(),
        threshold = config.pipeline.similarity_threshold,
        cooldown_secs = config.pipeline.cooldown_secs,
        capture_secs = config.pipeline.capture.duration_secs,
        "configuration loaded"
    );

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let engine = tokio::task::block_in_place(|| engine::spawn_engine(config, events_tx))?;

    let connection = match serve(engine.status()).await {
        Ok(conn) => {
            tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "D-Bus interface registered");
            Some(conn)
        }
        Err(e) => {
            tracing::warn!(error = %e, "D-Bus unavailable; counting without IPC");
            None
        }
    };

    tracing::info!("footfalld ready");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("footfalld shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(EngineEvent::Visit(visit)) => {
                    if let Some(conn) = &connection {
                        if let Err(e) = announce(conn, &visit).await {
                            tracing::debug!(error = %e, "failed to emit VisitRecorded");
                        }
                    }
                }
                Some(EngineEvent::Stopped { error, .. }) => {
                    match error {
                        Some(e) => tracing::error!(error = %e, "engine stopped"),
                        None => tracing::info!("engine stopped"),
                    }
                    break;
                }
                None => break,
            }
        }
    }

    engine.stop();
    let status = engine.status();
    let stats = tokio::task::spawn_blocking(move || engine.join()).await?;
    let unique_visitors = engine::lock_status(&status).unique_visitors;
    tracing::info!(
        frames = stats.frames_read,
        sessions = stats.sessions_started,
        new = stats.new_visitors,
        returning = stats.returning_visitors,
        discarded = stats.discarded,
        suppressed = stats.suppressed,
        store_failures = stats.store_failures,
        unique_visitors,
        "footfalld stopped"
    );

    Ok(())
}

async fn serve(status: SharedStatus) -> zbus::Result<zbus::Connection> {
    zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, CounterService::new(status))?
        .build()
        .await
}

async fn announce(conn: &zbus::Connection, visit: &VisitSummary) -> zbus::Result<()> {
    let json = serde_json::to_string(visit).map_err(|e| zbus::Error::Failure(e.to_string()))?;
    let iface = conn.object_server().interface::<_, CounterService>(OBJECT_PATH).await?;
    CounterService::visit_recorded(iface.signal_emitter(), &json).await
}
