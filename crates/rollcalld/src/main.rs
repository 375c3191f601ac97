use anyhow::{Context, Result};
use rollcall_core::{AttendanceService, BusKind, Config, OnnxExtractor};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod dbus_interface;
mod engine;

use dbus_interface::{AttendanceBus, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;
    let service = Arc::new(
        AttendanceService::open(&config)
            .with_context(|| format!("cannot open database {}", config.db_path.display()))?,
    );

    let engine = engine::spawn_engine(config.workers, config.queue_depth, || OnnxExtractor::load(&config))
        .context("cannot start extraction workers")?;

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceBus::new(service, engine))?
        .build()
        .await
        .with_context(|| format!("cannot own {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
