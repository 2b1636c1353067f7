use std::path::{Path, PathBuf};

use crate::domain::RetryLedger;
use crate::error::CoreResult;

use super::atomic::{read_json_opt, write_json_atomic};

/// Disk-backed wrapper around [`RetryLedger`] (`retry-counts.json`).
pub struct PersistedRetryLedger {
    path: PathBuf,
    ledger: RetryLedger,
}

impl PersistedRetryLedger {
    pub fn load(path: impl Into<PathBuf>) -> CoreResult<Self> {
        let path = path.into();
        let ledger = read_json_opt(&path)?.unwrap_or_default();
        Ok(Self { path, ledger })
    }

    pub fn get(&self, base_id: &str) -> u32 {
        self.ledger.get(base_id)
    }

    pub fn has_exceeded(&self, base_id: &str, max_retries: u32) -> bool {
        self.ledger.has_exceeded(base_id, max_retries)
    }

    /// Increment and persist; returns the new count.
    pub fn increment(&mut self, base_id: &str) -> CoreResult<u32> {
        let n = self.ledger.increment(base_id);
        self.save()?;
        Ok(n)
    }

    pub fn reset(&mut self, base_id: &str) -> CoreResult<()> {
        self.ledger.reset(base_id);
        self.save()
    }

    fn save(&self) -> CoreResult<()> {
        write_json_atomic(&self.path, &self.ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn increments_persist_across_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("retry-counts.json");

        let mut ledger = PersistedRetryLedger::load(&path).unwrap();
        ledger.increment("T1").unwrap();
        ledger.increment("T1").unwrap();

        let reloaded = PersistedRetryLedger::load(&path).unwrap();
        assert_eq!(reloaded.get("T1"), 2);
    }

    #[test]
    fn reset_clears_persisted_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("retry-counts.json");

        let mut ledger = PersistedRetryLedger::load(&path).unwrap();
        ledger.increment("T1").unwrap();
        ledger.reset("T1").unwrap();

        let reloaded = PersistedRetryLedger::load(&path).unwrap();
        assert_eq!(reloaded.get("T1"), 0);
    }
}
