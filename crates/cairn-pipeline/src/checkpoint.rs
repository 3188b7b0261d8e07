use crate::{PipelineError, StateSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const CHECKPOINT_FILE_NAME: &str = "checkpoint.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Epoch milliseconds at which the checkpoint was taken.
    pub timestamp: i64,
    pub last_completed_stage: String,
    pub payload: CheckpointPayload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointPayload {
    pub options: Value,
    pub repo_mark: String,
    pub state: StateSnapshot,
}

impl Checkpoint {
    pub fn new(last_completed_stage: impl Into<String>, payload: CheckpointPayload) -> Self {
        Self {
            timestamp: now_millis(),
            last_completed_stage: last_completed_stage.into(),
            payload,
        }
    }
}

/// Single-slot durable store for one checkpoint document.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(CHECKPOINT_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absent file is `Ok(None)`; anything present that cannot be read back
    /// as a checkpoint is `CorruptCheckpoint`.
    pub fn load(&self) -> Result<Option<Checkpoint>, PipelineError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(PipelineError::CorruptCheckpoint {
                    path: self.path.clone(),
                    reason: format!("failed reading file: {error}"),
                });
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|error| PipelineError::CorruptCheckpoint {
                path: self.path.clone(),
                reason: error.to_string(),
            })
    }

    /// Writes the document to a sibling temp file, syncs it, then renames it
    /// over the target. An interrupted save leaves the previous document.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
        let bytes = serde_json::to_vec_pretty(checkpoint).map_err(|error| {
            PipelineError::Runtime(format!("failed to serialize checkpoint: {error}"))
        })?;
        self.write_atomic(&bytes)?;
        debug!(
            path = %self.path.display(),
            stage = %checkpoint.last_completed_stage,
            "checkpoint saved"
        );
        Ok(())
    }

    fn write_atomic(&self, bytes: &[u8]) -> Result<(), PipelineError> {
        let io_error = |reason: String| PipelineError::CheckpointIo {
            path: self.path.clone(),
            reason,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|error| {
                io_error(format!(
                    "failed to create parent directory '{}': {error}",
                    parent.display()
                ))
            })?;
        }

        let temp_path = self.temp_path();
        let written = File::create(&temp_path).and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        });
        if let Err(error) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(io_error(format!("failed writing temp file: {error}")));
        }

        if let Err(error) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(io_error(format!("failed renaming temp file: {error}")));
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            // The rename is done; a failed directory sync is not fatal.
            if let Err(error) = sync_dir(parent) {
                debug!(dir = %parent.display(), %error, "failed syncing checkpoint directory");
            }
        }
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(CHECKPOINT_FILE_NAME);
        self.path
            .with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()))
    }
}

/// Flushes directory metadata so a completed rename survives a crash.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn is_expired(checkpoint: &Checkpoint, expiration: Duration) -> bool {
    is_expired_at(checkpoint, expiration, now_millis())
}

pub fn is_expired_at(checkpoint: &Checkpoint, expiration: Duration, now_millis: i64) -> bool {
    let limit = i64::try_from(expiration.as_millis()).unwrap_or(i64::MAX);
    now_millis.saturating_sub(checkpoint.timestamp) > limit
}
