//! `TestRunner`: the external black-box test-invocation boundary (§1, §4.E).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::TestResult;

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_tests(&self, working_dir: &Path, command: &str, timeout: Duration) -> TestResult;
}
