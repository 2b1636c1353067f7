//! Concrete [`TestRunner`] that shells out to the configured test command
//! (§1, §5 timeouts). Grounded on the teacher's bash tool: `tokio::process`
//! plus `tokio::time::timeout`, surfacing a timeout as a failing result
//! rather than an error so the step graph treats it like any other test
//! failure.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::TestResult;

use super::test_runner::TestRunner;

pub struct ProcessTestRunner;

#[async_trait]
impl TestRunner for ProcessTestRunner {
    async fn run_tests(&self, working_dir: &Path, command: &str, timeout: Duration) -> TestResult {
        let started = std::time::Instant::now();
        let output = tokio::time::timeout(
            timeout,
            tokio::process::Command::new("sh").arg("-c").arg(command).current_dir(working_dir).output(),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match output {
            Ok(Ok(output)) => TestResult {
                passed: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                duration_ms,
                artifacts: Vec::new(),
            },
            Ok(Err(e)) => TestResult {
                passed: false,
                stdout: String::new(),
                stderr: format!("failed to execute test command: {e}"),
                duration_ms,
                artifacts: Vec::new(),
            },
            Err(_) => TestResult {
                passed: false,
                stdout: String::new(),
                stderr: format!("test command timed out after {timeout:?}"),
                duration_ms,
                artifacts: Vec::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_command_reports_pass() {
        let runner = ProcessTestRunner;
        let result = runner.run_tests(Path::new("."), "exit 0", Duration::from_secs(5)).await;
        assert!(result.passed);
    }

    #[tokio::test]
    async fn failing_command_reports_failure_with_stderr() {
        let runner = ProcessTestRunner;
        let result = runner.run_tests(Path::new("."), "echo boom 1>&2; exit 1", Duration::from_secs(5)).await;
        assert!(!result.passed);
        assert!(result.stderr.contains("boom"));
    }

    #[tokio::test]
    async fn slow_command_times_out_as_a_failure_not_a_panic() {
        let runner = ProcessTestRunner;
        let result = runner.run_tests(Path::new("."), "sleep 5", Duration::from_millis(50)).await;
        assert!(!result.passed);
        assert!(result.stderr.contains("timed out"));
    }
}
