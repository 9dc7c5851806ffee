//! The queue of one job's buckets, and the retry state machine over them.
//!
//! A bucket is in exactly one of three places: `enqueued` (waiting for a worker), `dequeued`
//! (claimed by a worker, awaiting its result), or resolved (its results recorded, any retry
//! living on as a new bucket). Buckets are handed out first-in first-out; retries and reclaimed
//! buckets join at the tail. With [`DequeuePreference::AvoidWorkersThatFailed`], a worker skips
//! buckets holding tests it already failed.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    time::{Duration, Instant},
};

use dtq_utils::{
    net_protocol::{
        queue::{JobId, JobResults, RunningQueueState},
        workers::{Bucket, BucketId, RequestId, TestEntry, TestEntryResult, TestingResult, WorkerId},
    },
    time::SharedClock,
};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::aliveness::{StuckReason, WorkerAlivenessTracker};

/// Which waiting bucket a worker is handed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DequeuePreference {
    /// Always the oldest waiting bucket.
    #[default]
    Fifo,
    /// The oldest bucket with no test that already failed on the worker. Buckets failing on
    /// every alive worker go to anyone.
    AvoidWorkersThatFailed,
}

#[derive(Debug, Clone, Copy)]
pub struct BucketQueueConfig {
    /// How often a failed or lost test is re-attempted, unless its bucket says otherwise.
    pub number_of_retries: u32,
    /// Delay suggested to a worker when all remaining work is in flight.
    pub check_again_after: Duration,
    pub dequeue_preference: DequeuePreference,
}

#[derive(Debug, Clone)]
pub struct EnqueuedBucket {
    pub bucket: Bucket,
    pub enqueued_at: Instant,
    /// Unique among all buckets ever enqueued into this queue.
    pub sequence_id: u64,
    /// The bucket this one was originally split as. Retries and reclaims inherit it, and the
    /// retry budget of a test is kept against it.
    root_bucket_id: BucketId,
}

#[derive(Debug, Clone)]
pub struct DequeuedBucket {
    pub enqueued_bucket: EnqueuedBucket,
    pub worker_id: WorkerId,
    pub request_id: RequestId,
    pub dequeued_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DequeueOutcome {
    BucketDequeued(Bucket),
    QueueIsEmpty,
    CheckAgainLater(Duration),
    WorkerIsNotAlive,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AcceptError {
    #[error("bucket {0} is not awaiting a result")]
    BucketNotFound(BucketId),
    #[error("bucket {bucket_id} was dequeued by worker {claimed_by}, not {submitted_by}")]
    WorkerMismatch {
        bucket_id: BucketId,
        claimed_by: WorkerId,
        submitted_by: WorkerId,
    },
}

/// What became of the tests of an accepted result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AcceptOutcome {
    /// Tests whose result is now final.
    pub finalized: Vec<TestEntryResult>,
    /// The bucket re-attempting the tests that failed with retries left.
    pub retry_bucket: Option<Bucket>,
}

/// A bucket taken back from its worker. Each of its tests is enqueued again as a bucket of its
/// own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedBucket {
    pub previous_bucket_id: BucketId,
    pub new_bucket_ids: Vec<BucketId>,
    pub worker_id: WorkerId,
    pub reason: StuckReason,
}

type RetryKey = (BucketId, TestEntry);

#[derive(Debug)]
pub struct BucketQueue {
    job_id: JobId,
    config: BucketQueueConfig,
    clock: SharedClock,
    next_sequence_id: u64,
    enqueued: VecDeque<EnqueuedBucket>,
    dequeued: HashMap<BucketId, DequeuedBucket>,
    retries_left: HashMap<RetryKey, u32>,
    /// Workers each unresolved test failed on.
    failed_on: HashMap<RetryKey, HashSet<WorkerId>>,
    results: Vec<TestingResult>,
}

impl BucketQueue {
    pub fn new(job_id: JobId, config: BucketQueueConfig, clock: SharedClock) -> Self {
        Self {
            job_id,
            config,
            clock,
            next_sequence_id: 0,
            enqueued: Default::default(),
            dequeued: Default::default(),
            retries_left: Default::default(),
            failed_on: Default::default(),
            results: Default::default(),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Appends freshly split buckets, giving each of their tests the full retry budget.
    pub fn enqueue(&mut self, buckets: Vec<Bucket>) {
        for bucket in buckets {
            let retries = bucket
                .execution
                .number_of_retries
                .unwrap_or(self.config.number_of_retries);
            for entry in &bucket.test_entries {
                self.retries_left
                    .insert((bucket.bucket_id.clone(), entry.clone()), retries);
            }

            let root_bucket_id = bucket.bucket_id.clone();
            self.push_back(bucket, root_bucket_id);
        }
    }

    fn push_back(&mut self, bucket: Bucket, root_bucket_id: BucketId) {
        let sequence_id = self.next_sequence_id;
        self.next_sequence_id += 1;
        self.enqueued.push_back(EnqueuedBucket {
            bucket,
            enqueued_at: self.clock.now(),
            sequence_id,
            root_bucket_id,
        });
    }

    /// Hands the next bucket to `worker_id`, if the worker is alive, and marks it as being
    /// processed by the worker.
    pub fn dequeue_bucket(
        &mut self,
        worker_id: &WorkerId,
        request_id: &RequestId,
        aliveness: &WorkerAlivenessTracker,
    ) -> DequeueOutcome {
        if !aliveness.is_alive(worker_id) {
            return DequeueOutcome::WorkerIsNotAlive;
        }

        if let Some(bucket) = self.previously_dequeued(worker_id, request_id) {
            return DequeueOutcome::BucketDequeued(bucket.clone());
        }

        match self.pop_for(worker_id, request_id, aliveness) {
            Some(bucket) => {
                aliveness.did_dequeue_bucket(worker_id, bucket.bucket_id.clone());
                DequeueOutcome::BucketDequeued(bucket)
            }
            None if self.is_depleted() => DequeueOutcome::QueueIsEmpty,
            None => DequeueOutcome::CheckAgainLater(self.config.check_again_after),
        }
    }

    /// The bucket already handed out for this exact request, if the request is being retried.
    pub fn previously_dequeued(
        &self,
        worker_id: &WorkerId,
        request_id: &RequestId,
    ) -> Option<&Bucket> {
        self.dequeued
            .values()
            .find(|d| &d.worker_id == worker_id && &d.request_id == request_id)
            .map(|d| &d.enqueued_bucket.bucket)
    }

    /// Moves the bucket `worker_id` should get in flight, claimed by the worker.
    fn pop_for(
        &mut self,
        worker_id: &WorkerId,
        request_id: &RequestId,
        aliveness: &WorkerAlivenessTracker,
    ) -> Option<Bucket> {
        let index = self.index_to_dequeue(worker_id, aliveness)?;
        let enqueued_bucket = self.enqueued.remove(index)?;
        let bucket = enqueued_bucket.bucket.clone();

        tracing::debug!(job_id=%self.job_id, bucket_id=%bucket.bucket_id, %worker_id, "bucket dequeued");

        let previous = self.dequeued.insert(
            bucket.bucket_id.clone(),
            DequeuedBucket {
                enqueued_bucket,
                worker_id: worker_id.clone(),
                request_id: request_id.clone(),
                dequeued_at: self.clock.now(),
            },
        );
        dtq_utils::log_assert!(
            previous.is_none(),
            job_id=%self.job_id, bucket_id=%bucket.bucket_id,
            "bucket was in flight twice"
        );

        Some(bucket)
    }

    fn index_to_dequeue(
        &self,
        worker_id: &WorkerId,
        aliveness: &WorkerAlivenessTracker,
    ) -> Option<usize> {
        if self.enqueued.is_empty() {
            return None;
        }
        match self.config.dequeue_preference {
            DequeuePreference::Fifo => Some(0),
            DequeuePreference::AvoidWorkersThatFailed => {
                let failed_by = |enqueued: &EnqueuedBucket, workers: &[WorkerId]| {
                    enqueued.bucket.test_entries.iter().any(|entry| {
                        let key = (enqueued.root_bucket_id.clone(), entry.clone());
                        self.failed_on
                            .get(&key)
                            .map_or(false, |failed| workers.iter().all(|w| failed.contains(w)))
                    })
                };

                let requesting = std::slice::from_ref(worker_id);
                if let Some(index) = self.enqueued.iter().position(|e| !failed_by(e, requesting)) {
                    return Some(index);
                }

                let alive = aliveness.alive_workers();
                self.enqueued.iter().position(|e| failed_by(e, alive.as_slice()))
            }
        }
    }

    pub fn has_enqueued(&self) -> bool {
        !self.enqueued.is_empty()
    }

    pub fn has_in_flight(&self, bucket_id: &BucketId) -> bool {
        self.dequeued.contains_key(bucket_id)
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &DequeuedBucket> {
        self.dequeued.values()
    }

    /// A queue is depleted once nothing is waiting and nothing is in flight.
    pub fn is_depleted(&self) -> bool {
        self.enqueued.is_empty() && self.dequeued.is_empty()
    }

    /// Resolves an in-flight bucket with the result its worker submitted.
    ///
    /// Tests of the bucket missing from the result count as lost. Failed and lost tests with
    /// retries left are re-enqueued together as one new bucket; all others become final.
    pub fn accept(
        &mut self,
        worker_id: &WorkerId,
        request_id: &RequestId,
        testing_result: TestingResult,
    ) -> Result<AcceptOutcome, AcceptError> {
        let TestingResult {
            bucket_id,
            results,
        } = testing_result;

        match self.dequeued.get(&bucket_id) {
            None => return Err(AcceptError::BucketNotFound(bucket_id)),
            Some(dequeued) if &dequeued.worker_id != worker_id => {
                return Err(AcceptError::WorkerMismatch {
                    bucket_id,
                    claimed_by: dequeued.worker_id.clone(),
                    submitted_by: worker_id.clone(),
                })
            }
            Some(_) => {}
        }
        let dequeued = match self.dequeued.remove(&bucket_id) {
            Some(dequeued) => dequeued,
            None => return Err(AcceptError::BucketNotFound(bucket_id)),
        };

        let EnqueuedBucket {
            bucket,
            root_bucket_id,
            ..
        } = dequeued.enqueued_bucket;

        let mut reported: HashMap<TestEntry, TestEntryResult> = HashMap::new();
        for result in results {
            if !bucket.test_entries.contains(&result.test_entry) {
                tracing::warn!(job_id=%self.job_id, %bucket_id, test=%result.test_entry, "ignoring result for a test not in the bucket");
                continue;
            }
            if reported.contains_key(&result.test_entry) {
                tracing::warn!(job_id=%self.job_id, %bucket_id, test=%result.test_entry, "ignoring repeated result");
                continue;
            }
            reported.insert(result.test_entry.clone(), result);
        }

        let mut outcome = AcceptOutcome::default();
        let mut retry_entries = Vec::new();
        for entry in &bucket.test_entries {
            let result = reported
                .remove(entry)
                .unwrap_or_else(|| TestEntryResult::lost(entry.clone()));

            let key = (root_bucket_id.clone(), entry.clone());
            if result.is_success() {
                self.retries_left.remove(&key);
                self.failed_on.remove(&key);
                outcome.finalized.push(result);
                continue;
            }

            match self.retries_left.get_mut(&key) {
                Some(retries) if *retries > 0 => {
                    *retries -= 1;
                    self.failed_on
                        .entry(key)
                        .or_default()
                        .insert(worker_id.clone());
                    retry_entries.push(entry.clone());
                }
                _ => {
                    self.retries_left.remove(&key);
                    self.failed_on.remove(&key);
                    outcome.finalized.push(result);
                }
            }
        }

        tracing::debug!(
            job_id=%self.job_id, %bucket_id, %worker_id, %request_id,
            finalized = outcome.finalized.len(), retried = retry_entries.len(),
            "accepted bucket result"
        );

        if !retry_entries.is_empty() {
            let retry = Bucket::new(
                &derived_salt(&bucket_id, b"retry"),
                retry_entries,
                bucket.execution.clone(),
            );
            tracing::debug!(job_id=%self.job_id, parent=%bucket_id, bucket_id=%retry.bucket_id, "re-enqueued failed tests");
            self.push_back(retry.clone(), root_bucket_id);
            outcome.retry_bucket = Some(retry);
        }

        if !outcome.finalized.is_empty() {
            self.results.push(TestingResult {
                bucket_id,
                results: outcome.finalized.clone(),
            });
        }

        Ok(outcome)
    }

    /// Takes back the in-flight buckets `stuck_reason` gives a reason for. Every test of a
    /// reclaimed bucket is enqueued again at the tail, alone in a fresh bucket, so one test that
    /// keeps hanging holds back no others. Reclaiming does not consume any retries.
    pub fn reclaim(
        &mut self,
        stuck_reason: impl Fn(&DequeuedBucket) -> Option<StuckReason>,
    ) -> Vec<ReclaimedBucket> {
        let mut stuck: Vec<(BucketId, StuckReason)> = self
            .dequeued
            .iter()
            .filter_map(|(id, d)| stuck_reason(d).map(|reason| (id.clone(), reason)))
            .collect();
        // Keep the order buckets were first enqueued in.
        stuck.sort_by_key(|(id, _)| self.dequeued[id].enqueued_bucket.sequence_id);

        let mut reclaimed = Vec::with_capacity(stuck.len());
        for (previous_bucket_id, reason) in stuck {
            let Some(dequeued) = self.dequeued.remove(&previous_bucket_id) else {
                continue;
            };
            let EnqueuedBucket {
                bucket,
                root_bucket_id,
                ..
            } = dequeued.enqueued_bucket;

            let salt = derived_salt(&previous_bucket_id, b"reclaim");
            let fresh: Vec<Bucket> = bucket
                .test_entries
                .into_iter()
                .map(|entry| Bucket::new(&salt, vec![entry], bucket.execution.clone()))
                .collect();
            let new_bucket_ids: Vec<BucketId> =
                fresh.iter().map(|b| b.bucket_id.clone()).collect();

            tracing::info!(
                job_id=%self.job_id, worker_id=%dequeued.worker_id, ?reason,
                previous=%previous_bucket_id, new_buckets=new_bucket_ids.len(),
                "reclaimed stuck bucket"
            );

            for bucket in fresh {
                self.push_back(bucket, root_bucket_id.clone());
            }
            reclaimed.push(ReclaimedBucket {
                previous_bucket_id,
                new_bucket_ids,
                worker_id: dequeued.worker_id,
                reason,
            });
        }
        reclaimed
    }

    pub fn running_state(&self) -> RunningQueueState {
        let mut dequeued_tests: BTreeMap<WorkerId, Vec<TestEntry>> = BTreeMap::new();
        for dequeued in self.dequeued.values() {
            dequeued_tests
                .entry(dequeued.worker_id.clone())
                .or_default()
                .extend(dequeued.enqueued_bucket.bucket.test_entries.iter().cloned());
        }
        for tests in dequeued_tests.values_mut() {
            tests.sort();
        }

        RunningQueueState {
            enqueued_bucket_count: self.enqueued.len(),
            enqueued_tests: self
                .enqueued
                .iter()
                .flat_map(|e| e.bucket.test_entries.iter().cloned())
                .collect(),
            dequeued_bucket_count: self.dequeued.len(),
            dequeued_tests,
        }
    }

    pub fn results(&self) -> JobResults {
        JobResults {
            job_id: self.job_id.clone(),
            testing_results: self.results.clone(),
        }
    }
}

fn derived_salt(parent: &BucketId, purpose: &[u8]) -> Vec<u8> {
    let mut salt = parent.as_str().as_bytes().to_vec();
    salt.push(b'/');
    salt.extend_from_slice(purpose);
    salt
}
