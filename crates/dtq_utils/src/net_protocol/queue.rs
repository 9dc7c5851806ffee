//! Requests to the queue server, and its responses.

use std::{collections::BTreeMap, num::NonZeroUsize, time::Duration};

use derive_more::{Display, From};
use serde_derive::{Deserialize, Serialize};

use super::workers::{
    Bucket, BucketId, ExecutionConfiguration, RequestId, TestEntry, TestEntryResult, TestStatus,
    TestingResult, WorkerConfiguration, WorkerId,
};

/// Identity of a job, i.e. one submitter's set of tests.
#[derive(Serialize, Deserialize, Debug, Display, From, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(pub String);

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Priority of a job. Buckets of higher-priority jobs are dequeued first.
#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Priority(pub u16);

impl Priority {
    pub const LOWEST: Priority = Priority(0);
    pub const HIGHEST: Priority = Priority(999);
}

impl Default for Priority {
    fn default() -> Self {
        Priority(500)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PrioritizedJob {
    pub job_id: JobId,
    #[serde(default)]
    pub priority: Priority,
}

/// A test requested by a submitter, along with how to run it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestConfiguration {
    pub test_entry: TestEntry,
    #[serde(default)]
    pub execution: ExecutionConfiguration,
}

/// How requested tests are partitioned into buckets.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SplitStrategy {
    /// One test per bucket. Maximum parallelism and the finest-grained retries.
    Individual,
    /// One bucket per worker, for each group of tests sharing a configuration.
    #[default]
    EquallyDivided,
    /// Buckets of at most `size` tests.
    FixedBucketSize { size: NonZeroUsize },
    /// One bucket for each group of tests sharing a configuration.
    Unsplit,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScheduleTestsRequest {
    pub job: PrioritizedJob,
    pub request_id: RequestId,
    #[serde(default)]
    pub split_strategy: SplitStrategy,
    pub test_configurations: Vec<TestConfiguration>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Message {
    HealthCheck,
    /// Asks for the protocol version of the queue.
    QueueVersion,
    RegisterWorker {
        worker_id: WorkerId,
    },
    DequeueBucket {
        worker_id: WorkerId,
        request_id: RequestId,
    },
    PushResult {
        worker_id: WorkerId,
        request_id: RequestId,
        testing_result: TestingResult,
    },
    ReportAlive {
        worker_id: WorkerId,
        bucket_ids_being_processed: Vec<BucketId>,
    },
    ScheduleTests(ScheduleTestsRequest),
    JobState {
        job_id: JobId,
    },
    JobResults {
        job_id: JobId,
    },
    DeleteJob {
        job_id: JobId,
    },
    /// Excludes a worker from receiving any further work.
    BlockWorker {
        worker_id: WorkerId,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QueueVersion {
    pub version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RegisterWorkerResponse {
    Success {
        worker_configuration: WorkerConfiguration,
    },
    Blocked,
    UnknownWorker,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum DequeueBucketResponse {
    BucketDequeued {
        bucket: Bucket,
    },
    /// Nothing is left to dequeue, now or later.
    QueueIsEmpty,
    /// Work is in flight elsewhere and may come back; ask again after the given delay.
    CheckAgainLater {
        #[serde(with = "crate::serde_secs")]
        after: Duration,
    },
    /// The requesting worker is not eligible for work; it should register again.
    WorkerIsNotAlive,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum PushResultResponse {
    Accepted,
    Rejected { reason: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ReportAliveResponse {
    Accepted,
    WorkerBlocked,
    WorkerNotRegistered,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleTestsResponse {
    Scheduled { request_id: RequestId },
    Rejected { reason: String },
}

/// Snapshot of a running job's queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct RunningQueueState {
    pub enqueued_bucket_count: usize,
    pub enqueued_tests: Vec<TestEntry>,
    pub dequeued_bucket_count: usize,
    pub dequeued_tests: BTreeMap<WorkerId, Vec<TestEntry>>,
}

impl RunningQueueState {
    pub fn is_depleted(&self) -> bool {
        self.enqueued_bucket_count == 0 && self.dequeued_bucket_count == 0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum JobStateResponse {
    Running(RunningQueueState),
    Deleted,
    NotFound,
    /// The queue gave up on all jobs, e.g. because no worker ever registered.
    Failed { reason: String },
}

/// Final results of a job's tests, accumulated bucket by bucket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JobResults {
    pub job_id: JobId,
    pub testing_results: Vec<TestingResult>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResultsSummary {
    pub passed: usize,
    pub failed: usize,
    pub lost: usize,
}

impl ResultsSummary {
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.lost
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.lost == 0
    }
}

impl JobResults {
    /// One final result per scheduled test.
    pub fn final_results(&self) -> impl Iterator<Item = &TestEntryResult> {
        self.testing_results.iter().flat_map(|r| r.results.iter())
    }

    pub fn summary(&self) -> ResultsSummary {
        let mut summary = ResultsSummary::default();
        for result in self.final_results() {
            match result.status {
                TestStatus::Success => summary.passed += 1,
                TestStatus::Failure => summary.failed += 1,
                TestStatus::Lost => summary.lost += 1,
            }
        }
        summary
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum JobResultsResponse {
    Results(JobResults),
    NotFound,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum DeleteJobResponse {
    Acknowledged,
    NotFound,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum BlockWorkerResponse {
    Acknowledged,
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{JobId, JobResults, Priority, SplitStrategy};
    use crate::net_protocol::workers::{
        BucketId, ExecutionConfiguration, TestEntry, TestEntryResult, TestException,
        TestingResult,
    };

    #[test]
    fn summary_counts_final_results() {
        let entry = |m: &str| TestEntry::new("A", m);
        let bucket_id = BucketId::derive(b"", &[entry("a")], &ExecutionConfiguration::default());
        let results = JobResults {
            job_id: JobId::from("job"),
            testing_results: vec![
                TestingResult {
                    bucket_id: bucket_id.clone(),
                    results: vec![
                        TestEntryResult::success(entry("a"), Duration::from_secs(1)),
                        TestEntryResult::failure(
                            entry("b"),
                            vec![TestException::new("assertion failed")],
                            Duration::from_secs(1),
                        ),
                    ],
                },
                TestingResult {
                    bucket_id,
                    results: vec![TestEntryResult::lost(entry("c"))],
                },
            ],
        };

        let summary = results.summary();
        assert_eq!((summary.passed, summary.failed, summary.lost), (1, 1, 1));
        assert_eq!(summary.total(), 3);
        assert!(!summary.is_success());
    }

    #[test]
    fn priorities_order() {
        assert!(Priority::HIGHEST > Priority::default());
        assert!(Priority::default() > Priority::LOWEST);
    }

    #[test]
    fn split_strategy_wire_shape() {
        let strategy: SplitStrategy =
            serde_json::from_str(r#"{"kind": "fixed_bucket_size", "size": 3}"#).unwrap();
        assert!(matches!(strategy, SplitStrategy::FixedBucketSize { size } if size.get() == 3));

        let strategy: SplitStrategy = serde_json::from_str(r#"{"kind": "individual"}"#).unwrap();
        assert_eq!(strategy, SplitStrategy::Individual);
    }
}
