//! Checkpoint storage for `.stepflow/state/steps_done.json`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info};

use super::write_atomic;
use crate::core::progress::StepProgress;

/// File-backed store for the single [`StepProgress`] record of a workspace.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint.
    ///
    /// Returns `Ok(None)` when no checkpoint exists. A file that exists but does not
    /// parse is an error: corrupt progress is never silently discarded.
    pub fn load(&self) -> Result<Option<StepProgress>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no checkpoint");
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read checkpoint {}", self.path.display()))?;
        let progress: StepProgress = serde_json::from_str(&contents)
            .with_context(|| format!("parse checkpoint {} (corrupt)", self.path.display()))?;
        debug!(
            completed = progress.completed_count(),
            total = progress.total_steps,
            "checkpoint loaded"
        );
        Ok(Some(progress))
    }

    /// Atomically replace the checkpoint (temp file + rename), stamping `last_updated`.
    pub fn save(&self, progress: &mut StepProgress) -> Result<()> {
        progress.last_updated = Utc::now();
        debug!(
            path = %self.path.display(),
            completed = progress.completed_count(),
            total = progress.total_steps,
            "writing checkpoint"
        );
        let mut buf = serde_json::to_string_pretty(progress)?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }

    /// Delete the checkpoint. Absence is not an error.
    pub fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "checkpoint deleted");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("delete checkpoint {}", self.path.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_checkpoint_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(temp.path().join("state/steps_done.json"));
        assert!(store.load().expect("load").is_none());
    }

    #[test]
    fn save_then_load_preserves_indices() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(temp.path().join("state/steps_done.json"));

        let mut progress = StepProgress::new(3);
        progress.mark_completed(2);
        progress.mark_completed(0);
        store.save(&mut progress).expect("save");

        let loaded = store.load().expect("load").expect("present");
        assert_eq!(loaded, progress);
        let raw = fs::read_to_string(store.path()).expect("read");
        assert!(raw.contains("\"completed_step_indices\": [\n    0,\n    2\n  ]"));
        assert!(!store.path().with_file_name("steps_done.json.tmp").exists());
    }

    /// A torn or hand-edited file must surface as an error, never as "no checkpoint".
    #[test]
    fn corrupt_checkpoint_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("steps_done.json");
        fs::write(&path, "{\"completed_step_indices\": [0,").expect("write");

        let err = CheckpointStore::new(&path).load().unwrap_err();
        assert!(format!("{err:#}").contains("corrupt"));
    }

    #[test]
    fn delete_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(temp.path().join("steps_done.json"));
        store.delete().expect("delete absent");

        store.save(&mut StepProgress::new(1)).expect("save");
        store.delete().expect("delete");
        assert!(store.load().expect("load").is_none());
    }
}
