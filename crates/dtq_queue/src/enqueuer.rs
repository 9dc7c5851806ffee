//! Turns scheduling requests into enqueued buckets, exactly once per request.

use std::{collections::HashSet, sync::Arc};

use dtq_utils::net_protocol::{
    queue::{JobId, ScheduleTestsRequest},
    workers::RequestId,
};
use parking_lot::Mutex;

use crate::{
    balancing_queue::{BalancingBucketQueue, EnqueueError},
    splitter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { bucket_count: usize },
    /// The same request was enqueued before; nothing changed.
    AlreadyEnqueued,
}

pub struct TestsEnqueuer {
    balancing: Arc<BalancingBucketQueue>,
    /// Requests enqueued so far. Locked across split and enqueue, so that concurrent duplicates
    /// of one request cannot both get through.
    seen: Mutex<HashSet<(JobId, RequestId)>>,
}

impl TestsEnqueuer {
    pub fn new(balancing: Arc<BalancingBucketQueue>) -> Self {
        Self {
            balancing,
            seen: Default::default(),
        }
    }

    /// Splits the requested tests into buckets for `worker_count` workers and enqueues them to
    /// the request's job.
    #[tracing::instrument(level = "trace", skip(self, request), fields(job_id = %request.job.job_id, request_id = %request.request_id))]
    pub fn enqueue(
        &self,
        request: ScheduleTestsRequest,
        worker_count: usize,
    ) -> Result<EnqueueOutcome, EnqueueError> {
        let ScheduleTestsRequest {
            job,
            request_id,
            split_strategy,
            test_configurations,
        } = request;

        let mut seen = self.seen.lock();
        let key = (job.job_id.clone(), request_id.clone());
        if seen.contains(&key) {
            tracing::debug!("request was already enqueued");
            return Ok(EnqueueOutcome::AlreadyEnqueued);
        }

        let salt = Self::salt(&job.job_id, &request_id);
        let buckets = splitter::split(test_configurations, worker_count, split_strategy, &salt);
        let bucket_count = buckets.len();

        self.balancing.enqueue(job, buckets)?;
        seen.insert(key);

        tracing::info!(bucket_count, worker_count, "scheduled tests");
        Ok(EnqueueOutcome::Enqueued { bucket_count })
    }

    fn salt(job_id: &JobId, request_id: &RequestId) -> Vec<u8> {
        let mut salt = job_id.0.as_bytes().to_vec();
        salt.push(0);
        salt.extend_from_slice(request_id.0.as_bytes());
        salt
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use dtq_utils::{
        net_protocol::{
            queue::{
                JobId, PrioritizedJob, ScheduleTestsRequest, SplitStrategy, TestConfiguration,
            },
            workers::{ExecutionConfiguration, RequestId, TestEntry, WorkerId},
        },
        time::ManualClock,
    };

    use super::{EnqueueOutcome, TestsEnqueuer};
    use crate::{
        aliveness::WorkerAlivenessTracker,
        balancing_queue::{
            AllowAllWorkers, BalancingBucketQueue, BalancingQueueConfig, EnqueueError,
            JobState,
        },
        bucket_queue::{BucketQueueConfig, DequeueOutcome},
    };

    fn balancing() -> Arc<BalancingBucketQueue> {
        let clock = ManualClock::new();
        let aliveness = Arc::new(WorkerAlivenessTracker::new(
            Duration::from_secs(30),
            clock.shared(),
        ));
        Arc::new(BalancingBucketQueue::new(
            BalancingQueueConfig {
                bucket_queue: BucketQueueConfig {
                    number_of_retries: 0,
                    check_again_after: Duration::from_secs(1),
                    dequeue_preference: Default::default(),
                },
                nothing_to_dequeue: Default::default(),
            },
            clock.shared(),
            aliveness,
            Arc::new(AllowAllWorkers),
        ))
    }

    fn request(job: &str, request_id: &str, tests: &[&str]) -> ScheduleTestsRequest {
        ScheduleTestsRequest {
            job: PrioritizedJob {
                job_id: JobId::from(job),
                priority: Default::default(),
            },
            request_id: RequestId::from(request_id),
            split_strategy: SplitStrategy::Individual,
            test_configurations: tests
                .iter()
                .map(|t| TestConfiguration {
                    test_entry: TestEntry::new("A", *t),
                    execution: ExecutionConfiguration::default(),
                })
                .collect(),
        }
    }

    fn enqueued_buckets(balancing: &BalancingBucketQueue, job: &str) -> usize {
        match balancing.state(&JobId::from(job)) {
            Some(JobState::Running(state)) => state.enqueued_bucket_count,
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn same_request_is_enqueued_once() {
        let balancing = balancing();
        let enqueuer = TestsEnqueuer::new(balancing.clone());

        let first = enqueuer.enqueue(request("J", "r1", &["a", "b"]), 1).unwrap();
        let second = enqueuer.enqueue(request("J", "r1", &["a", "b"]), 1).unwrap();

        assert_eq!(first, EnqueueOutcome::Enqueued { bucket_count: 2 });
        assert_eq!(second, EnqueueOutcome::AlreadyEnqueued);
        assert_eq!(enqueued_buckets(&balancing, "J"), 2);
    }

    #[test]
    fn distinct_requests_add_to_the_same_job() {
        let balancing = balancing();
        let enqueuer = TestsEnqueuer::new(balancing.clone());

        enqueuer.enqueue(request("J", "r1", &["a"]), 1).unwrap();
        enqueuer.enqueue(request("J", "r2", &["a"]), 1).unwrap();

        assert_eq!(enqueued_buckets(&balancing, "J"), 2);
    }

    #[test]
    fn same_request_id_for_different_jobs_is_not_a_duplicate() {
        let balancing = balancing();
        let enqueuer = TestsEnqueuer::new(balancing.clone());

        enqueuer.enqueue(request("J1", "r1", &["a"]), 1).unwrap();
        let outcome = enqueuer.enqueue(request("J2", "r1", &["a"]), 1).unwrap();

        assert_eq!(outcome, EnqueueOutcome::Enqueued { bucket_count: 1 });
    }

    #[test]
    fn same_tests_in_distinct_requests_get_distinct_bucket_ids() {
        let balancing = balancing();
        let enqueuer = TestsEnqueuer::new(balancing.clone());
        let worker = WorkerId::from("W1");
        balancing.aliveness().register_worker(&worker).unwrap();

        enqueuer.enqueue(request("J", "r1", &["a"]), 1).unwrap();
        enqueuer.enqueue(request("J", "r2", &["a"]), 1).unwrap();

        let mut ids = Vec::new();
        for _ in 0..2 {
            match balancing.dequeue_bucket(&worker, &RequestId::unique()) {
                DequeueOutcome::BucketDequeued(bucket) => ids.push(bucket.bucket_id),
                other => panic!("expected a bucket, got {other:?}"),
            }
        }
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn rejected_request_can_be_retried() {
        let balancing = balancing();
        let enqueuer = TestsEnqueuer::new(balancing.clone());

        let job = PrioritizedJob {
            job_id: JobId::from("J"),
            priority: Default::default(),
        };
        balancing.enqueue(job, vec![]).unwrap();
        balancing.delete(&JobId::from("J")).unwrap();

        let rejected = enqueuer.enqueue(request("J", "r1", &["a"]), 1);
        assert_eq!(rejected, Err(EnqueueError::JobDeleted(JobId::from("J"))));

        // Not remembered as seen, so it is rejected again rather than reported as enqueued.
        let again = enqueuer.enqueue(request("J", "r1", &["a"]), 1);
        assert!(again.is_err());
    }

    #[test]
    fn concurrent_duplicates_enqueue_once() {
        let balancing = balancing();
        let enqueuer = Arc::new(TestsEnqueuer::new(balancing.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let enqueuer = enqueuer.clone();
                std::thread::spawn(move || enqueuer.enqueue(request("J", "r1", &["a", "b", "c"]), 1))
            })
            .collect();
        let outcomes: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        let enqueued = outcomes
            .iter()
            .filter(|o| matches!(o, EnqueueOutcome::Enqueued { .. }))
            .count();
        assert_eq!(enqueued, 1);
        assert_eq!(enqueued_buckets(&balancing, "J"), 3);
    }
}
