//! Crash-safe JSON persistence.
//!
//! A write is staged into a temp file next to the target, flushed to stable
//! storage, then renamed over the target.  Readers only ever observe the old
//! or the new file, never a partial one.

use crate::error::LabError;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// A fully written and synced temp file that has not replaced its target yet.
pub struct StagedWrite {
    file: NamedTempFile,
}

impl StagedWrite {
    pub fn temp_path(&self) -> &Path {
        self.file.path()
    }

    /// Atomically move the staged content over `target`.
    pub fn commit(self, target: &Path) -> Result<(), LabError> {
        self.file.persist(target).map_err(|e| LabError::Io(e.error))?;
        sync_parent(target);
        Ok(())
    }
}

/// Serialise `value` into a synced temp file in the target's directory.
pub fn stage_json<T: Serialize + ?Sized>(target: &Path, value: &T) -> Result<StagedWrite, LabError> {
    let dir = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state".into());
    let mut file = tempfile::Builder::new()
        .prefix(&format!(".{}.", file_name))
        .suffix(".tmp")
        .tempfile_in(dir)?;

    serde_json::to_writer_pretty(file.as_file_mut(), value)?;
    file.as_file_mut().write_all(b"\n")?;
    file.as_file_mut().flush()?;
    file.as_file().sync_all()?;

    Ok(StagedWrite { file })
}

/// Stage and commit in one step.
pub fn write_json_atomic<T: Serialize + ?Sized>(target: &Path, value: &T) -> Result<(), LabError> {
    stage_json(target, value)?.commit(target)
}

#[cfg(unix)]
fn sync_parent(target: &Path) {
    if let Some(parent) = target.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_target: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state.json");

        write_json_atomic(&target, &json!({"a": 1})).unwrap();
        write_json_atomic(&target, &json!({"a": 2})).unwrap();

        let loaded: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&target).unwrap()).unwrap();
        assert_eq!(loaded["a"], 2);
    }

    #[test]
    fn test_staged_write_does_not_touch_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state.json");
        write_json_atomic(&target, &json!({"generation": 1})).unwrap();

        let staged = stage_json(&target, &json!({"generation": 2})).unwrap();
        assert!(staged.temp_path().exists());
        assert_eq!(staged.temp_path().parent(), target.parent());

        // process "dies" before the rename
        drop(staged);

        let loaded: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&target).unwrap()).unwrap();
        assert_eq!(loaded["generation"], 1);
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("deeper").join("state.json");
        write_json_atomic(&target, &json!([])).unwrap();
        assert!(target.exists());
    }
}
