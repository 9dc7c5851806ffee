//! Running the tests of a bucket.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use dtq_utils::net_protocol::workers::{
    Bucket, TestEntry, TestEntryResult, TestException, TestingResult, WorkerConfiguration,
};
use tokio::process::Command;

pub const TEST_CLASS_ENV: &str = "DTQ_TEST_CLASS";
pub const TEST_METHOD_ENV: &str = "DTQ_TEST_METHOD";
pub const TEST_CASE_ID_ENV: &str = "DTQ_TEST_CASE_ID";
/// Prefix of the variables naming the tool locations of a bucket, e.g. `DTQ_TOOL_RUNNER`.
pub const TOOL_ENV_PREFIX: &str = "DTQ_TOOL_";

/// How much of a failing test's stderr is kept as the failure reason.
const MAX_FAILURE_OUTPUT: usize = 4096;

/// Runs the tests of a bucket and reports one result per test.
///
/// Results for tests that are missing from the returned [TestingResult] count as lost.
#[async_trait]
pub trait TestExecutor: Send + Sync {
    async fn execute(
        &self,
        bucket: &Bucket,
        worker_configuration: &WorkerConfiguration,
    ) -> TestingResult;
}

/// Runs every test of a bucket as its own process.
///
/// The test to run is passed through [TEST_CLASS_ENV], [TEST_METHOD_ENV] and, if set,
/// [TEST_CASE_ID_ENV]. The process also sees the worker's and the bucket's environment, the
/// latter taking precedence. Exit code 0 is a success; anything else, including running past
/// the bucket's test timeout, is a failure. A test whose process cannot be started is lost.
#[derive(Debug, Clone)]
pub struct ShellCommandExecutor {
    program: String,
    args: Vec<String>,
}

impl ShellCommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command_for(
        &self,
        test_entry: &TestEntry,
        bucket: &Bucket,
        worker_configuration: &WorkerConfiguration,
    ) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&worker_configuration.environment)
            .envs(&bucket.execution.environment)
            .envs(bucket.execution.tool_locations.iter().map(|(tool, location)| {
                (format!("{TOOL_ENV_PREFIX}{}", tool.to_uppercase()), location)
            }))
            .env(TEST_CLASS_ENV, &test_entry.class_name)
            .env(TEST_METHOD_ENV, &test_entry.method_name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(case_id) = test_entry.case_id {
            command.env(TEST_CASE_ID_ENV, case_id.to_string());
        }
        command
    }

    async fn run_one(
        &self,
        test_entry: &TestEntry,
        bucket: &Bucket,
        worker_configuration: &WorkerConfiguration,
    ) -> TestEntryResult {
        let timeout = bucket.execution.test_timeout;
        let start = Instant::now();

        let child = match self
            .command_for(test_entry, bucket, worker_configuration)
            .spawn()
        {
            Ok(child) => child,
            Err(error) => {
                tracing::warn!(%test_entry, %error, program = %self.program, "could not start test");
                return TestEntryResult::lost(test_entry.clone());
            }
        };

        let output = tokio::time::timeout(timeout, child.wait_with_output()).await;
        let duration = start.elapsed();

        match output {
            Ok(Ok(output)) if output.status.success() => {
                TestEntryResult::success(test_entry.clone(), duration)
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let reason = match output.status.code() {
                    Some(code) => format!("exited with code {code}: {}", tail(&stderr)),
                    None => format!("killed by a signal: {}", tail(&stderr)),
                };
                TestEntryResult::failure(
                    test_entry.clone(),
                    vec![TestException::new(reason)],
                    duration,
                )
            }
            Ok(Err(error)) => {
                tracing::warn!(%test_entry, %error, "lost track of test process");
                TestEntryResult::lost(test_entry.clone())
            }
            Err(_) => TestEntryResult::failure(
                test_entry.clone(),
                vec![TestException::new(format!("timed out after {timeout:?}"))],
                duration,
            ),
        }
    }
}

fn tail(output: &str) -> &str {
    let output = output.trim_end();
    if output.len() <= MAX_FAILURE_OUTPUT {
        return output;
    }
    let mut start = output.len() - MAX_FAILURE_OUTPUT;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    &output[start..]
}

#[async_trait]
impl TestExecutor for ShellCommandExecutor {
    async fn execute(
        &self,
        bucket: &Bucket,
        worker_configuration: &WorkerConfiguration,
    ) -> TestingResult {
        let mut results = Vec::with_capacity(bucket.test_entries.len());
        for test_entry in &bucket.test_entries {
            results.push(self.run_one(test_entry, bucket, worker_configuration).await);
        }
        TestingResult {
            bucket_id: bucket.bucket_id.clone(),
            results,
        }
    }
}
