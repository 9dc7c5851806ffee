//! Units of work handed to workers, and the results workers report for them.

use std::{collections::BTreeMap, fmt, time::Duration};

use derive_more::{Display, From};
use serde_derive::{Deserialize, Serialize};

/// Identity of a worker process, as configured on the queue server.
#[derive(Serialize, Deserialize, Debug, Display, From, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Identifies one logical request of a client. A client retrying a request over the network
/// re-sends the same id, which lets the queue answer the retry without repeating side effects.
#[derive(Serialize, Deserialize, Debug, Display, From, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn unique() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Content-derived identity of a [Bucket].
#[derive(Serialize, Deserialize, Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct BucketId(String);

impl BucketId {
    /// Derives an id from the contents of a bucket. `salt` distinguishes buckets of identical
    /// contents, e.g. the same tests scheduled for two jobs, or a retry of a bucket.
    pub fn derive(
        salt: &[u8],
        test_entries: &[TestEntry],
        execution: &ExecutionConfiguration,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hash_bytes(&mut hasher, salt);
        hasher.update(&(test_entries.len() as u64).to_le_bytes());
        for entry in test_entries {
            entry.hash_into(&mut hasher);
        }
        execution.hash_into(&mut hasher);
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn hash_bytes(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn hash_map(hasher: &mut blake3::Hasher, map: &BTreeMap<String, String>) {
    hasher.update(&(map.len() as u64).to_le_bytes());
    for (key, value) in map {
        hash_bytes(hasher, key.as_bytes());
        hash_bytes(hasher, value.as_bytes());
    }
}

/// One test: a method of a test class, optionally narrowed to a numbered case.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestEntry {
    pub class_name: String,
    pub method_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<u64>,
}

impl TestEntry {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            case_id: None,
        }
    }

    pub fn with_case_id(mut self, case_id: u64) -> Self {
        self.case_id = Some(case_id);
        self
    }

    fn hash_into(&self, hasher: &mut blake3::Hasher) {
        hash_bytes(hasher, self.class_name.as_bytes());
        hash_bytes(hasher, self.method_name.as_bytes());
        match self.case_id {
            Some(id) => {
                hasher.update(&[1]);
                hasher.update(&id.to_le_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
    }
}

impl fmt::Display for TestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class_name, self.method_name)?;
        if let Some(case_id) = self.case_id {
            write!(f, "#{case_id}")?;
        }
        Ok(())
    }
}

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(180);

fn default_test_timeout() -> Duration {
    DEFAULT_TEST_TIMEOUT
}

/// How the tests of a bucket are to be run. Opaque to scheduling, except that buckets only
/// ever hold tests sharing one configuration, and that `number_of_retries` overrides the
/// queue's retry budget.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionConfiguration {
    #[serde(default)]
    pub tool_locations: BTreeMap<String, String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default = "default_test_timeout", with = "crate::serde_secs")]
    pub test_timeout: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_retries: Option<u32>,
}

impl Default for ExecutionConfiguration {
    fn default() -> Self {
        Self {
            tool_locations: Default::default(),
            environment: Default::default(),
            test_timeout: DEFAULT_TEST_TIMEOUT,
            number_of_retries: None,
        }
    }
}

impl ExecutionConfiguration {
    fn hash_into(&self, hasher: &mut blake3::Hasher) {
        hash_map(hasher, &self.tool_locations);
        hash_map(hasher, &self.environment);
        hasher.update(&self.test_timeout.as_nanos().to_le_bytes());
        match self.number_of_retries {
            Some(n) => {
                hasher.update(&[1]);
                hasher.update(&n.to_le_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
    }
}

/// The unit of work dispatched to a worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub bucket_id: BucketId,
    pub test_entries: Vec<TestEntry>,
    pub execution: ExecutionConfiguration,
}

impl Bucket {
    /// Builds a bucket whose id is derived from its contents and `salt`.
    pub fn new(salt: &[u8], test_entries: Vec<TestEntry>, execution: ExecutionConfiguration) -> Self {
        debug_assert!(!test_entries.is_empty(), "buckets may not be empty");
        let bucket_id = BucketId::derive(salt, &test_entries, &execution);
        Self {
            bucket_id,
            test_entries,
            execution,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Success,
    Failure,
    /// The worker ran the test but has no verifiable outcome for it.
    Lost,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestException {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl TestException {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            file_path: None,
            line: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestEntryResult {
    pub test_entry: TestEntry,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exceptions: Vec<TestException>,
    #[serde(with = "crate::serde_secs")]
    pub duration: Duration,
}

impl TestEntryResult {
    pub fn success(test_entry: TestEntry, duration: Duration) -> Self {
        Self {
            test_entry,
            status: TestStatus::Success,
            exceptions: vec![],
            duration,
        }
    }

    pub fn failure(test_entry: TestEntry, exceptions: Vec<TestException>, duration: Duration) -> Self {
        Self {
            test_entry,
            status: TestStatus::Failure,
            exceptions,
            duration,
        }
    }

    pub fn lost(test_entry: TestEntry) -> Self {
        Self {
            test_entry,
            status: TestStatus::Lost,
            exceptions: vec![],
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TestStatus::Success
    }
}

/// A worker's report for the tests of one bucket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestingResult {
    pub bucket_id: BucketId,
    pub results: Vec<TestEntryResult>,
}

impl TestingResult {
    pub fn count(&self, status: TestStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

pub const DEFAULT_REPORT_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

fn default_report_alive_interval() -> Duration {
    DEFAULT_REPORT_ALIVE_INTERVAL
}

/// Configuration a worker receives when it registers with the queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfiguration {
    /// How often the worker must report that it is alive.
    #[serde(default = "default_report_alive_interval", with = "crate::serde_secs")]
    pub report_alive_interval: Duration,
    /// Environment the worker adds to every test it runs.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl Default for WorkerConfiguration {
    fn default() -> Self {
        Self {
            report_alive_interval: DEFAULT_REPORT_ALIVE_INTERVAL,
            environment: Default::default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{BucketId, ExecutionConfiguration, TestEntry};

    fn entries() -> Vec<TestEntry> {
        vec![TestEntry::new("A", "testFoo"), TestEntry::new("A", "testBar")]
    }

    #[test]
    fn bucket_id_is_stable() {
        let execution = ExecutionConfiguration::default();
        assert_eq!(
            BucketId::derive(b"job", &entries(), &execution),
            BucketId::derive(b"job", &entries(), &execution)
        );
    }

    #[test]
    fn bucket_id_depends_on_salt() {
        let execution = ExecutionConfiguration::default();
        assert_ne!(
            BucketId::derive(b"job-1", &entries(), &execution),
            BucketId::derive(b"job-2", &entries(), &execution)
        );
    }

    #[test]
    fn bucket_id_depends_on_order_and_configuration() {
        let execution = ExecutionConfiguration::default();
        let mut reversed = entries();
        reversed.reverse();
        assert_ne!(
            BucketId::derive(b"job", &entries(), &execution),
            BucketId::derive(b"job", &reversed, &execution)
        );

        let mut other_execution = ExecutionConfiguration::default();
        other_execution
            .environment
            .insert("LANG".to_owned(), "en_US".to_owned());
        assert_ne!(
            BucketId::derive(b"job", &entries(), &execution),
            BucketId::derive(b"job", &entries(), &other_execution)
        );
    }

    #[test]
    fn bucket_id_does_not_confuse_field_boundaries() {
        let execution = ExecutionConfiguration::default();
        assert_ne!(
            BucketId::derive(b"", &[TestEntry::new("AB", "c")], &execution),
            BucketId::derive(b"", &[TestEntry::new("A", "Bc")], &execution)
        );
    }

    #[test]
    fn test_entry_display() {
        assert_eq!(TestEntry::new("A", "testFoo").to_string(), "A.testFoo");
        assert_eq!(
            TestEntry::new("A", "testFoo").with_case_id(7).to_string(),
            "A.testFoo#7"
        );
    }

    #[test]
    fn execution_configuration_defaults() {
        let execution: ExecutionConfiguration = serde_json::from_str("{}").unwrap();
        assert_eq!(execution, ExecutionConfiguration::default());
    }
}
