//! Multiplexes dequeue requests over the bucket queues of all jobs.
//!
//! A worker is served from the highest-priority job that has a bucket waiting and that the
//! worker may pull from. Among jobs of equal priority, the job served least recently goes
//! first, so equal-priority jobs take turns.
//!
//! All jobs live behind one lock. While holding it, the queue may take the aliveness tracker's
//! lock; the tracker never calls back into the queue.

use std::{
    cmp::Reverse,
    collections::HashSet,
    sync::Arc,
    time::Duration,
};

use dtq_utils::{
    net_protocol::{
        queue::{JobId, JobResults, PrioritizedJob, RunningQueueState},
        workers::{Bucket, BucketId, RequestId, TestingResult, WorkerId},
    },
    time::SharedClock,
};
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    aliveness::WorkerAlivenessTracker,
    bucket_queue::{
        AcceptError, AcceptOutcome, BucketQueue, BucketQueueConfig, DequeueOutcome,
        ReclaimedBucket,
    },
};

/// Decides whether a worker may currently pull work of a job.
pub trait WorkerPermissionProvider: Send + Sync {
    fn may_dequeue(&self, worker_id: &WorkerId, job: &PrioritizedJob) -> bool;
}

/// Lets every worker pull from every job.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllWorkers;

impl WorkerPermissionProvider for AllowAllWorkers {
    fn may_dequeue(&self, _worker_id: &WorkerId, _job: &PrioritizedJob) -> bool {
        true
    }
}

/// What to tell a worker when no job has any work left, waiting or in flight.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NothingToDequeueBehavior {
    /// Tell the worker the queue is empty, so it exits.
    #[default]
    ReportQueueIsEmpty,
    /// Keep the worker polling, for queues that outlive their jobs.
    CheckAgainLater,
}

#[derive(Debug, Clone, Copy)]
pub struct BalancingQueueConfig {
    pub bucket_queue: BucketQueueConfig,
    pub nothing_to_dequeue: NothingToDequeueBehavior,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Running(RunningQueueState),
    Deleted,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("job {0} was deleted")]
    JobDeleted(JobId),
    #[error("queue stopped accepting jobs: {0}")]
    QueueFailed(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("job {0} not found")]
pub struct JobNotFound(pub JobId);

struct Job {
    job: PrioritizedJob,
    queue: BucketQueue,
    /// When the job was last served, counted in dequeues across all jobs. Zero if never.
    last_served: u64,
}

#[derive(Default)]
struct Jobs {
    /// In order of creation.
    jobs: Vec<Job>,
    deleted: HashSet<JobId>,
    dequeue_count: u64,
    any_ever_scheduled: bool,
    failure: Option<String>,
}

impl Jobs {
    fn find(&self, job_id: &JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| &j.job.job_id == job_id)
    }

    fn find_mut(&mut self, job_id: &JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| &j.job.job_id == job_id)
    }
}

pub struct BalancingBucketQueue {
    config: BalancingQueueConfig,
    clock: SharedClock,
    aliveness: Arc<WorkerAlivenessTracker>,
    permission: Arc<dyn WorkerPermissionProvider>,
    jobs: Mutex<Jobs>,
}

static_assertions::assert_impl_all!(BalancingBucketQueue: Send, Sync);

impl BalancingBucketQueue {
    pub fn new(
        config: BalancingQueueConfig,
        clock: SharedClock,
        aliveness: Arc<WorkerAlivenessTracker>,
        permission: Arc<dyn WorkerPermissionProvider>,
    ) -> Self {
        Self {
            config,
            clock,
            aliveness,
            permission,
            jobs: Default::default(),
        }
    }

    pub fn aliveness(&self) -> &Arc<WorkerAlivenessTracker> {
        &self.aliveness
    }

    /// Adds buckets to a job, creating the job if it does not exist yet.
    /// The priority of an existing job is kept.
    pub fn enqueue(&self, job: PrioritizedJob, buckets: Vec<Bucket>) -> Result<(), EnqueueError> {
        let mut jobs = self.jobs.lock();

        if let Some(failure) = &jobs.failure {
            return Err(EnqueueError::QueueFailed(failure.clone()));
        }
        if jobs.deleted.contains(&job.job_id) {
            return Err(EnqueueError::JobDeleted(job.job_id));
        }

        jobs.any_ever_scheduled = true;
        let bucket_count = buckets.len();
        match jobs.find_mut(&job.job_id) {
            Some(existing) => existing.queue.enqueue(buckets),
            None => {
                let mut queue = BucketQueue::new(
                    job.job_id.clone(),
                    self.config.bucket_queue,
                    self.clock.clone(),
                );
                queue.enqueue(buckets);
                tracing::info!(job_id=%job.job_id, priority=%job.priority, "job created");
                jobs.jobs.push(Job {
                    job: job.clone(),
                    queue,
                    last_served: 0,
                });
            }
        }
        tracing::debug!(job_id=%job.job_id, bucket_count, "enqueued buckets");
        Ok(())
    }

    pub fn dequeue_bucket(&self, worker_id: &WorkerId, request_id: &RequestId) -> DequeueOutcome {
        let mut jobs = self.jobs.lock();

        if jobs.failure.is_some() {
            return DequeueOutcome::QueueIsEmpty;
        }

        if !self.aliveness.is_alive(worker_id) {
            return DequeueOutcome::WorkerIsNotAlive;
        }

        // A repeated request is answered by whichever job served it first.
        for job in &jobs.jobs {
            if let Some(bucket) = job.queue.previously_dequeued(worker_id, request_id) {
                return DequeueOutcome::BucketDequeued(bucket.clone());
            }
        }

        let mut candidates: Vec<usize> = jobs
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.queue.has_enqueued())
            .filter(|(_, j)| self.permission.may_dequeue(worker_id, &j.job))
            .map(|(index, _)| index)
            .collect();
        candidates.sort_by_key(|&index| {
            let j = &jobs.jobs[index];
            (Reverse(j.job.priority), j.last_served, index)
        });

        // A job with waiting buckets may still have none for this worker.
        for index in candidates {
            let outcome = jobs.jobs[index]
                .queue
                .dequeue_bucket(worker_id, request_id, &self.aliveness);
            let DequeueOutcome::BucketDequeued(bucket) = outcome else {
                continue;
            };

            jobs.dequeue_count += 1;
            let served = jobs.dequeue_count;
            jobs.jobs[index].last_served = served;

            let claimed_elsewhere = jobs
                .jobs
                .iter()
                .enumerate()
                .any(|(i, j)| i != index && j.queue.has_in_flight(&bucket.bucket_id));
            dtq_utils::log_assert!(
                !claimed_elsewhere,
                bucket_id=%bucket.bucket_id,
                "bucket is in flight in two jobs"
            );
            return DequeueOutcome::BucketDequeued(bucket);
        }

        let work_remains = jobs.jobs.iter().any(|j| !j.queue.is_depleted());
        if work_remains {
            DequeueOutcome::CheckAgainLater(self.config.bucket_queue.check_again_after)
        } else {
            match self.config.nothing_to_dequeue {
                NothingToDequeueBehavior::ReportQueueIsEmpty => DequeueOutcome::QueueIsEmpty,
                NothingToDequeueBehavior::CheckAgainLater => {
                    DequeueOutcome::CheckAgainLater(self.config.bucket_queue.check_again_after)
                }
            }
        }
    }

    /// Records the result of an in-flight bucket, whichever job it belongs to.
    pub fn accept(
        &self,
        worker_id: &WorkerId,
        request_id: &RequestId,
        testing_result: TestingResult,
    ) -> Result<AcceptOutcome, AcceptError> {
        let mut jobs = self.jobs.lock();

        let bucket_id = testing_result.bucket_id.clone();
        let job = jobs
            .jobs
            .iter_mut()
            .find(|j| j.queue.has_in_flight(&bucket_id))
            .ok_or_else(|| AcceptError::BucketNotFound(bucket_id.clone()))?;

        let outcome = job.queue.accept(worker_id, request_id, testing_result)?;
        self.aliveness.did_finish_bucket(worker_id, &bucket_id);
        Ok(outcome)
    }

    pub fn state(&self, job_id: &JobId) -> Option<JobState> {
        let jobs = self.jobs.lock();
        if jobs.deleted.contains(job_id) {
            return Some(JobState::Deleted);
        }
        jobs.find(job_id)
            .map(|j| JobState::Running(j.queue.running_state()))
    }

    pub fn results(&self, job_id: &JobId) -> Option<JobResults> {
        let jobs = self.jobs.lock();
        jobs.find(job_id).map(|j| j.queue.results())
    }

    /// Deletes a job and everything about it. Results for its in-flight buckets will be
    /// rejected.
    pub fn delete(&self, job_id: &JobId) -> Result<(), JobNotFound> {
        let mut jobs = self.jobs.lock();

        let index = jobs
            .jobs
            .iter()
            .position(|j| &j.job.job_id == job_id)
            .ok_or_else(|| JobNotFound(job_id.clone()))?;
        let job = jobs.jobs.remove(index);
        jobs.deleted.insert(job_id.clone());

        for in_flight in job.queue.in_flight() {
            self.aliveness.did_finish_bucket(
                &in_flight.worker_id,
                &in_flight.enqueued_bucket.bucket.bucket_id,
            );
        }

        tracing::info!(%job_id, "job deleted");
        Ok(())
    }

    /// Takes in-flight buckets back from workers that went silent, were blocked, or no longer
    /// report processing them.
    pub fn reenqueue_stuck_buckets(&self) -> Vec<ReclaimedBucket> {
        let mut jobs = self.jobs.lock();

        let mut reclaimed = Vec::new();
        for job in jobs.jobs.iter_mut() {
            reclaimed.extend(job.queue.reclaim(|dequeued| {
                self.aliveness.stuck_reason(
                    &dequeued.worker_id,
                    &dequeued.enqueued_bucket.bucket.bucket_id,
                    dequeued.dequeued_at,
                )
            }));
        }

        for ReclaimedBucket {
            previous_bucket_id,
            worker_id,
            ..
        } in &reclaimed
        {
            self.aliveness.did_finish_bucket(worker_id, previous_bucket_id);
        }
        reclaimed
    }

    /// Gives up on all jobs: existing jobs are dropped and no new ones are accepted.
    pub fn fail_all(&self, reason: String) {
        let mut jobs = self.jobs.lock();
        tracing::error!(%reason, job_count = jobs.jobs.len(), "failing all jobs");
        jobs.jobs.clear();
        jobs.failure = Some(reason);
    }

    pub fn failure(&self) -> Option<String> {
        self.jobs.lock().failure.clone()
    }

    /// Whether no job has anything waiting or in flight.
    pub fn is_depleted(&self) -> bool {
        self.jobs.lock().jobs.iter().all(|j| j.queue.is_depleted())
    }

    pub fn has_any_job_ever_been_scheduled(&self) -> bool {
        self.jobs.lock().any_ever_scheduled
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs
            .lock()
            .jobs
            .iter()
            .map(|j| j.job.job_id.clone())
            .collect()
    }

    pub fn check_again_after(&self) -> Duration {
        self.config.bucket_queue.check_again_after
    }

    #[cfg(test)]
    fn in_flight_bucket_ids(&self) -> Vec<BucketId> {
        self.jobs
            .lock()
            .jobs
            .iter()
            .flat_map(|j| j.queue.in_flight().map(|d| d.enqueued_bucket.bucket.bucket_id.clone()))
            .collect()
    }
}
