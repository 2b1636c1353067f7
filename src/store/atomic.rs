//! Crash-safe JSON persistence shared by every component that owns a file
//! under `.devloop/` (§4.B, §5 ordering guarantees, §8 invariant 7).
//!
//! The protocol: serialise, re-parse as a validation pass, write to a
//! per-process-per-attempt temp file, then rename over the target. A reader
//! opening the target mid-write always observes either the pre-state or a
//! fully-formed post-state, never a truncated intermediate, because a
//! same-filesystem rename is atomic.

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::{CoreError, CoreResult};

const MAX_WRITE_ATTEMPTS: u32 = 3;
const WRITE_BACKOFF_BASE_MS: u64 = 100;
const MAX_RENAME_ATTEMPTS: u32 = 3;
const RENAME_BACKOFF_MS: u64 = 50;

fn temp_path(target: &Path) -> std::path::PathBuf {
    let pid = std::process::id();
    let wallclock = chrono::Utc::now().timestamp_millis();
    let rand_suffix: u32 = rand::rng().random();
    let file_name = target.file_name().and_then(|n| n.to_str()).unwrap_or("tmp");
    target.with_file_name(format!("{file_name}.{pid}.{wallclock}.{rand_suffix:08x}.tmp"))
}

/// Write `value` to `path` atomically, retrying the whole write up to
/// `MAX_WRITE_ATTEMPTS` times with exponential backoff, and the final
/// rename up to `MAX_RENAME_ATTEMPTS` times on ENOENT races.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    let mut last_err = None;
    for attempt in 0..MAX_WRITE_ATTEMPTS {
        match try_write_once(path, value) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(path = %path.display(), attempt, error = %e, "atomic write attempt failed");
                last_err = Some(e);
                if attempt + 1 < MAX_WRITE_ATTEMPTS {
                    std::thread::sleep(Duration::from_millis(WRITE_BACKOFF_BASE_MS * 2u64.pow(attempt)));
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| CoreError::Io("atomic write failed with no recorded error".into())))
}

fn try_write_once<T: Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    // Validation pass: the document we are about to write must itself parse.
    let _: serde_json::Value = serde_json::from_str(&json)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = temp_path(path);
    let write_result = std::fs::write(&tmp, json.as_bytes());
    if let Err(e) = write_result {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }

    let mut last_rename_err = None;
    for attempt in 0..MAX_RENAME_ATTEMPTS {
        match std::fs::rename(&tmp, path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                last_rename_err = Some(e);
                if attempt + 1 < MAX_RENAME_ATTEMPTS {
                    std::thread::sleep(Duration::from_millis(RENAME_BACKOFF_MS));
                }
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                return Err(e.into());
            }
        }
    }
    let _ = std::fs::remove_file(&tmp);
    Err(last_rename_err.map(CoreError::from).unwrap_or_else(|| CoreError::Io("rename failed".into())))
}

/// Read a JSON document, returning `None` when the file does not exist.
/// Parse failures are the caller's responsibility to classify (the Task
/// Store treats them as an empty list plus a warning; other owners may
/// choose to propagate).
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> CoreResult<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let value = serde_json::from_str(&contents)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn round_trips_a_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_json_atomic(&path, &json!({ "a": 1 })).unwrap();
        let read: serde_json::Value = read_json_opt(&path).unwrap().unwrap();
        assert_eq!(read, json!({ "a": 1 }));
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let read: Option<serde_json::Value> = read_json_opt(&path).unwrap();
        assert!(read.is_none());
    }

    #[test]
    fn no_temp_file_left_behind_on_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_json_atomic(&path, &json!({ "a": 1 })).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn overwrite_replaces_prior_content_atomically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_json_atomic(&path, &json!({ "v": 1 })).unwrap();
        write_json_atomic(&path, &json!({ "v": 2 })).unwrap();
        let read: serde_json::Value = read_json_opt(&path).unwrap().unwrap();
        assert_eq!(read, json!({ "v": 2 }));
    }
}
