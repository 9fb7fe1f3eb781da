//! Focus input of fallback mode. The host application reports focus changes of its window with
//! `worktally focus`, which stores the latest change in a file the daemon polls.

use std::{io::ErrorKind, path::Path, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    fallback::FocusChange,
    monitor::ActivityMonitor,
    timeline::storage::{SnapshotStorage, read_locked, write_locked},
};

pub const FOCUS_FILE: &str = "focus.json";
pub const FOCUS_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocusSignal {
    pub change: FocusChange,
    pub at: DateTime<Utc>,
}

pub async fn write_focus(path: &Path, signal: &FocusSignal) -> Result<()> {
    let content = serde_json::to_vec(signal)?;
    write_locked(path, &content)
        .await
        .with_context(|| format!("Failed to write focus change to {path:?}"))
}

/// Latest focus change, or nothing when none was reported yet.
pub async fn read_focus(path: &Path) -> Result<Option<FocusSignal>> {
    let content = match read_locked(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read focus file {path:?}")),
    };
    match serde_json::from_str(&content) {
        Ok(signal) => Ok(Some(signal)),
        Err(e) => {
            warn!("Focus file {path:?} is corrupted {e}");
            Ok(None)
        }
    }
}

/// Forwards focus changes reported after `since` to `monitor` until shutdown. Changes left over
/// from before the daemon started say nothing about the current window and are skipped.
pub async fn watch_focus<S: SnapshotStorage>(
    monitor: &ActivityMonitor<S>,
    path: &Path,
    since: DateTime<Utc>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut last_applied = since;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(period) => (),
        }
        match read_focus(path).await {
            Ok(Some(signal)) if signal.at > last_applied => {
                debug!("Applying focus change {:?} from {}", signal.change, signal.at);
                last_applied = signal.at;
                monitor.notify_focus(signal.change).await;
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to read focus change {e:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Arc, time::Duration};

    use anyhow::Result;
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    use crate::{
        daemon::{
            config::MonitorConfig,
            fallback::FocusChange,
            fusion::ActivityState,
            monitor::ActivityMonitor,
            timeline::storage::memory::MemorySnapshotStorage,
        },
        utils::clock::TestClock,
    };

    use super::{FOCUS_FILE, FocusSignal, read_focus, watch_focus, write_focus};

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 7, 4, hour, minute, 0).unwrap()
    }

    /// Lets the watcher run for a few polls, accepting changes made after 09:01.
    async fn run_watcher(monitor: &ActivityMonitor<Arc<MemorySnapshotStorage>>, path: &Path) {
        let shutdown = CancellationToken::new();
        tokio::join!(
            watch_focus(monitor, path, at(9, 1), Duration::from_secs(1), shutdown.clone()),
            async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                shutdown.cancel();
            }
        );
    }

    #[tokio::test]
    async fn latest_change_replaces_previous_one() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(FOCUS_FILE);
        assert_eq!(read_focus(&path).await?, None);

        let blurred = FocusSignal {
            change: FocusChange::Blurred,
            at: at(9, 5),
        };
        write_focus(
            &path,
            &FocusSignal {
                change: FocusChange::Focused,
                at: at(9, 0),
            },
        )
        .await?;
        write_focus(&path, &blurred).await?;

        assert_eq!(read_focus(&path).await?, Some(blurred));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_focus_reaches_fallback_and_stale_one_does_not() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(FOCUS_FILE);
        let monitor = ActivityMonitor::new(
            MonitorConfig {
                status_interval_ms: 3_600_000,
                ..Default::default()
            },
            vec![],
            Arc::new(MemorySnapshotStorage::default()),
            Arc::new(TestClock::starting_at(at(9, 0))),
        )?;
        monitor.start().await?;
        assert!(monitor.is_fallback());
        tokio::time::sleep(Duration::from_secs(400)).await;
        assert_eq!(monitor.get_stats().state, ActivityState::Inactive);

        write_focus(
            &path,
            &FocusSignal {
                change: FocusChange::Focused,
                at: at(8, 0),
            },
        )
        .await?;
        run_watcher(&monitor, &path).await;
        assert_eq!(monitor.get_stats().state, ActivityState::Inactive);

        write_focus(
            &path,
            &FocusSignal {
                change: FocusChange::Focused,
                at: at(9, 7),
            },
        )
        .await?;
        run_watcher(&monitor, &path).await;
        assert_eq!(monitor.get_stats().state, ActivityState::Active);

        monitor.stop().await;
        Ok(())
    }
}
