//! Persistence of the timeline and daily stats. Storage is organized as one JSON snapshot per
//! local day inside a timeline directory. A snapshot is always rewritten as a whole.

use std::{
    future::Future,
    io::ErrorKind,
    ops::Deref,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use fs4::tokio::AsyncFileExt;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};
use tracing::{debug, warn};

use crate::{
    daemon::fusion::{ActivityState, DailyStats},
    utils::time::day_key,
};

pub const TIMELINE_DIR: &str = "timeline";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySnapshot {
    pub day_key: String,
    pub segments: Vec<Option<ActivityState>>,
    pub stats: DailyStats,
}

/// Interface for abstracting storage of day snapshots.
pub trait SnapshotStorage: Send + Sync + 'static {
    /// Replaces the snapshot stored for `snapshot.day_key`.
    fn save(&self, snapshot: &DaySnapshot) -> impl Future<Output = Result<()>> + Send;

    /// Snapshot for `day`, or nothing when the day was never written.
    fn load(&self, day: NaiveDate) -> impl Future<Output = Result<Option<DaySnapshot>>> + Send;
}

impl<T: Deref + Send + Sync + 'static> SnapshotStorage for T
where
    T::Target: SnapshotStorage,
{
    fn save(&self, snapshot: &DaySnapshot) -> impl Future<Output = Result<()>> + Send {
        self.deref().save(snapshot)
    }

    fn load(&self, day: NaiveDate) -> impl Future<Output = Result<Option<DaySnapshot>>> + Send {
        self.deref().load(day)
    }
}

/// Replaces the whole content of `path` while holding an exclusive lock on it.
pub(crate) async fn write_locked(path: &Path, content: &[u8]) -> Result<()> {
    let mut file = File::options()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await
        .with_context(|| format!("Failed to open {path:?}"))?;

    file.lock_exclusive()?;
    let result = replace_content(&mut file, content).await;
    file.unlock_async().await?;
    result
}

async fn replace_content(file: &mut File, content: &[u8]) -> Result<()> {
    file.set_len(0).await?;
    file.seek(std::io::SeekFrom::Start(0)).await?;
    file.write_all(content).await?;
    file.flush().await?;
    Ok(())
}

/// Reads `path` while holding a shared lock on it.
pub(crate) async fn read_locked(path: &Path) -> Result<String, std::io::Error> {
    let mut file = File::open(path).await?;
    file.lock_shared()?;
    let mut content = String::new();
    let result = file.read_to_string(&mut content).await;
    file.unlock_async().await?;
    result?;
    Ok(content)
}

/// Main realization of [SnapshotStorage]. Files are locked while written or read so the CLI
/// never observes a half-written snapshot.
///
/// File locks block the calling thread and each access opens its own descriptor, so accesses from
/// this process go through `access` one at a time.
pub struct JsonSnapshotStorage {
    dir: PathBuf,
    access: Mutex<()>,
}

impl JsonSnapshotStorage {
    pub fn new(dir: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            access: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, day_key: &str) -> PathBuf {
        self.dir.join(format!("{day_key}.json"))
    }
}

impl SnapshotStorage for JsonSnapshotStorage {
    async fn save(&self, snapshot: &DaySnapshot) -> Result<()> {
        let path = self.path_for(&snapshot.day_key);
        let content = serde_json::to_vec(snapshot)?;

        let _access = self.access.lock().await;
        write_locked(&path, &content)
            .await
            .with_context(|| format!("Failed to write snapshot {path:?}"))?;
        debug!("Saved snapshot {path:?}");
        Ok(())
    }

    async fn load(&self, day: NaiveDate) -> Result<Option<DaySnapshot>> {
        let key = day_key(day);
        let path = self.path_for(&key);

        let content = {
            let _access = self.access.lock().await;
            match read_locked(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to read snapshot {path:?}"));
                }
            }
        };

        match serde_json::from_str::<DaySnapshot>(&content) {
            Ok(snapshot) if snapshot.day_key == key => Ok(Some(snapshot)),
            Ok(snapshot) => {
                warn!(
                    "Snapshot {path:?} belongs to {} instead of {key}, ignoring it",
                    snapshot.day_key
                );
                Ok(None)
            }
            Err(e) => {
                // Can happen when the machine went down in the middle of a write.
                warn!("Snapshot {path:?} is corrupted {e}");
                Ok(None)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::Result;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    use crate::daemon::{
        fusion::{ActivityState, DailyStats},
        timeline::SEGMENTS_PER_DAY,
    };

    use super::{DaySnapshot, JsonSnapshotStorage, SnapshotStorage};

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2018, 7, 4).unwrap()
    }

    fn snapshot(active_ms: i64) -> DaySnapshot {
        let mut segments = vec![None; SEGMENTS_PER_DAY];
        segments[54] = Some(ActivityState::Active);
        segments[55] = Some(ActivityState::Idle);
        let mut stats = DailyStats::new("2018-07-04".into());
        stats.active_accumulated_ms = active_ms;
        stats.app_usage.insert("nvim".into(), 3);
        DaySnapshot {
            day_key: "2018-07-04".into(),
            segments,
            stats,
        }
    }

    #[tokio::test]
    async fn saved_snapshot_is_loaded_back() -> Result<()> {
        let dir = tempdir()?;
        let storage = JsonSnapshotStorage::new(dir.path().join("timeline"))?;

        storage.save(&snapshot(1_000)).await?;

        assert_eq!(storage.load(day()).await?, Some(snapshot(1_000)));
        assert!(storage.dir().join("2018-07-04.json").exists());
        Ok(())
    }

    #[tokio::test]
    async fn shorter_rewrite_replaces_whole_file() -> Result<()> {
        let dir = tempdir()?;
        let storage = JsonSnapshotStorage::new(dir.path().to_path_buf())?;

        let mut long = snapshot(1_000);
        long.stats
            .app_usage
            .insert("a-very-long-application-name".repeat(20), 1);
        storage.save(&long).await?;
        storage.save(&snapshot(2_000)).await?;

        assert_eq!(storage.load(day()).await?, Some(snapshot(2_000)));
        Ok(())
    }

    #[tokio::test]
    async fn overlapping_saves_both_complete() -> Result<()> {
        let dir = tempdir()?;
        let storage = JsonSnapshotStorage::new(dir.path().to_path_buf())?;

        let first_snapshot = snapshot(1_000);
        let second_snapshot = snapshot(2_000);
        let (first, second, loaded) = tokio::join!(
            storage.save(&first_snapshot),
            storage.save(&second_snapshot),
            storage.load(day()),
        );
        first?;
        second?;
        loaded?;

        assert_eq!(storage.load(day()).await?, Some(snapshot(2_000)));
        Ok(())
    }

    #[tokio::test]
    async fn missing_day_loads_nothing() -> Result<()> {
        let dir = tempdir()?;
        let storage = JsonSnapshotStorage::new(dir.path().to_path_buf())?;

        assert_eq!(storage.load(day()).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn corrupted_or_foreign_snapshot_is_ignored() -> Result<()> {
        let dir = tempdir()?;
        let storage = JsonSnapshotStorage::new(dir.path().to_path_buf())?;

        fs::write(dir.path().join("2018-07-04.json"), "{\"day_key\": \"2018-0")?;
        assert_eq!(storage.load(day()).await?, None);

        let mut foreign = snapshot(0);
        foreign.day_key = "2018-07-03".into();
        fs::write(
            dir.path().join("2018-07-04.json"),
            serde_json::to_vec(&foreign)?,
        )?;
        assert_eq!(storage.load(day()).await?, None);
        Ok(())
    }
}
