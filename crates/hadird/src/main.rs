use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod detector;
mod session;
mod status;
mod store;

use config::Config;
use dbus_interface::{AppState, AttendanceService, BUS_NAME, OBJECT_PATH};
use status::StatusSink;
use store::AttendanceDb;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("hadird starting");

    let config = Config::from_env();
    config.validate()?;
    tracing::info!(
        db = %config.db_path.display(),
        detector = %config.detector_source.display(),
        session_bus = config.session_bus,
        "configuration loaded"
    );

    let store = AttendanceDb::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;

    let sink = StatusSink::new();
    let cancel = CancellationToken::new();

    let kiosk = tokio::spawn(session::run_kiosk(
        config.clone(),
        store.clone(),
        sink.clone(),
        cancel.clone(),
    ));

    let service = AttendanceService {
        state: Arc::new(AppState {
            config: config.clone(),
            store,
            status: sink.subscribe(),
        }),
    };

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = BUS_NAME, "hadird ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("hadird shutting down");

    cancel.cancel();
    if let Err(e) = kiosk.await {
        tracing::error!(error = %e, "attendance loop task failed");
    }

    Ok(())
}
