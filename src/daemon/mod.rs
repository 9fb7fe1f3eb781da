//! Long running side of worktally. [start_daemon] wires platform adapters, settings and storage
//! into an [monitor::ActivityMonitor] and keeps it running until the process is asked to stop.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use chrono::Utc;
use config::{MonitorConfig, SETTINGS_FILE};
use focus::{FOCUS_FILE, FOCUS_POLL};
use monitor::ActivityMonitor;
use timeline::storage::{JsonSnapshotStorage, TIMELINE_DIR};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{signal_api::platform_adapters, utils::clock::DefaultClock};

pub mod args;
pub mod collection;
pub mod config;
pub mod events;
pub mod fallback;
pub mod focus;
pub mod fusion;
pub mod monitor;
pub mod permissions;
pub mod shutdown;
pub mod timeline;

/// Represents the starting point for the daemon
pub async fn start_daemon(dir: PathBuf) -> Result<()> {
    let dir = std::path::absolute(&dir)
        .with_context(|| format!("Failed to resolve application directory {dir:?}"))?;
    std::env::set_current_dir("/")?;

    let config = MonitorConfig::load(&dir.join(SETTINGS_FILE))?;
    let storage = JsonSnapshotStorage::new(dir.join(TIMELINE_DIR))?;
    let monitor = ActivityMonitor::new(
        config,
        platform_adapters(),
        storage,
        Arc::new(DefaultClock),
    )?;

    let shutdown_token = CancellationToken::new();
    let events = monitor.subscribe();
    let started = Utc::now();
    monitor.start().await?;
    info!("Daemon started in {dir:?}");

    let focus_file = dir.join(FOCUS_FILE);
    tokio::join!(
        shutdown::detect_shutdown(shutdown_token.clone()),
        events::log_events(events, shutdown_token.clone()),
        focus::watch_focus(
            &monitor,
            &focus_file,
            started,
            FOCUS_POLL,
            shutdown_token.clone()
        ),
    );

    monitor.stop().await;
    Ok(())
}
