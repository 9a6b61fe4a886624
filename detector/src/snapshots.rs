use std::path::{Path, PathBuf};

use cam_motion_common::frame::{parse_snapshot_name, MotionEvent};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub file_name: String,
    /// Parsed from the file name; 0 for JPEGs not named by this store.
    pub timestamp_ms: i64,
}

/// Directory of motion snapshots, one `motion_<ms>.jpg` per event.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure_dir(&self) -> Result<(), SnapshotError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Write the frame that triggered `event`.
    pub async fn save(&self, event: &MotionEvent) -> Result<PathBuf, SnapshotError> {
        let path = self.dir.join(event.snapshot_name());
        tokio::fs::write(&path, event.frame.data()).await?;
        info!(
            path = %path.display(),
            score = event.score,
            bytes = event.frame.len(),
            "saved motion snapshot"
        );
        Ok(path)
    }

    /// All `*.jpg` files in the store, newest first.
    pub async fn list(&self) -> Result<Vec<SnapshotEntry>, SnapshotError> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            if !file_name.ends_with(".jpg") {
                continue;
            }
            let timestamp_ms = parse_snapshot_name(&file_name).unwrap_or(0);
            entries.push(SnapshotEntry {
                file_name,
                timestamp_ms,
            });
        }
        entries.sort_by(|a, b| {
            b.timestamp_ms
                .cmp(&a.timestamp_ms)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });
        debug!(count = entries.len(), dir = %self.dir.display(), "listed snapshots");
        Ok(entries)
    }
}
