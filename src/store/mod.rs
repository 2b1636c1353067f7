//! Crash-safe persistence for tasks and retry state under `.devloop/`.

pub mod atomic;
mod retry_ledger;
mod task_store;

pub use retry_ledger::PersistedRetryLedger;
pub use task_store::{TaskStore, DEFAULT_MAX_RETRIES};
