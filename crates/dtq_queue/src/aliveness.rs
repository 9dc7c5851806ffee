//! Liveness of workers, derived from their heartbeats.
//!
//! Staleness is evaluated lazily: a worker is `silent` whenever its last heartbeat is older
//! than the allowed silence duration at the moment someone asks. No timers are kept per worker.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::{Duration, Instant},
};

use dtq_utils::{
    net_protocol::workers::{BucketId, WorkerId},
    time::SharedClock,
};
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlivenessStatus {
    /// Known to the queue, but never heard from.
    NotRegistered,
    Alive,
    /// Registered, but has not reported in for longer than allowed.
    Silent,
    /// Excluded from work for good.
    Blocked,
}

/// Why a claimed bucket will not see a result from the worker that claimed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckReason {
    WorkerIsSilent,
    WorkerIsBlocked,
    /// The worker is alive, but no longer reports processing the bucket.
    BucketLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAliveness {
    pub status: AlivenessStatus,
    pub bucket_ids_being_processed: BTreeSet<BucketId>,
}

impl WorkerAliveness {
    pub fn is_alive(&self) -> bool {
        self.status == AlivenessStatus::Alive
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AlivenessError {
    #[error("worker {0} is blocked")]
    WorkerBlocked(WorkerId),
    #[error("worker {0} has not registered")]
    WorkerNotRegistered(WorkerId),
}

#[derive(Debug)]
struct TrackedWorker {
    registered: bool,
    blocked: bool,
    last_heartbeat: Instant,
    bucket_ids_being_processed: BTreeSet<BucketId>,
    /// Buckets claimed at or before this instant and missing from
    /// `bucket_ids_being_processed` are not being worked on anymore.
    /// A heartbeat only settles buckets claimed before the previous contact, since its
    /// snapshot may predate the worker receiving a bucket claimed just before it.
    buckets_settled_at: Instant,
}

impl TrackedWorker {
    fn new(now: Instant) -> Self {
        Self {
            registered: false,
            blocked: false,
            last_heartbeat: now,
            bucket_ids_being_processed: Default::default(),
            buckets_settled_at: now,
        }
    }
}

#[derive(Debug, Default)]
struct Workers {
    workers: HashMap<WorkerId, TrackedWorker>,
    any_ever_registered: bool,
}

#[derive(Debug)]
pub struct WorkerAlivenessTracker {
    clock: SharedClock,
    allowed_silence: Duration,
    workers: Mutex<Workers>,
}

impl WorkerAlivenessTracker {
    pub fn new(allowed_silence: Duration, clock: SharedClock) -> Self {
        Self {
            clock,
            allowed_silence,
            workers: Default::default(),
        }
    }

    pub fn allowed_silence_duration(&self) -> Duration {
        self.allowed_silence
    }

    /// Marks a worker alive as of now, forgetting any buckets it previously reported.
    /// Registering again after going silent is allowed; registering a blocked worker is not.
    pub fn register_worker(&self, worker_id: &WorkerId) -> Result<(), AlivenessError> {
        let now = self.clock.now();
        let mut workers = self.workers.lock();

        let worker = workers
            .workers
            .entry(worker_id.clone())
            .or_insert_with(|| TrackedWorker::new(now));

        if worker.blocked {
            return Err(AlivenessError::WorkerBlocked(worker_id.clone()));
        }

        worker.registered = true;
        worker.last_heartbeat = now;
        worker.bucket_ids_being_processed.clear();
        worker.buckets_settled_at = now;
        workers.any_ever_registered = true;

        tracing::info!(%worker_id, "worker registered");
        Ok(())
    }

    /// Refreshes a worker's heartbeat and replaces the set of buckets it is processing.
    pub fn report_alive(
        &self,
        worker_id: &WorkerId,
        bucket_ids_being_processed: impl IntoIterator<Item = BucketId>,
    ) -> Result<(), AlivenessError> {
        let now = self.clock.now();
        let mut workers = self.workers.lock();

        let worker = match workers.workers.get_mut(worker_id) {
            Some(worker) if worker.blocked => {
                return Err(AlivenessError::WorkerBlocked(worker_id.clone()))
            }
            Some(worker) if worker.registered => worker,
            _ => return Err(AlivenessError::WorkerNotRegistered(worker_id.clone())),
        };

        if self.is_silent(worker, now) {
            tracing::info!(%worker_id, "silent worker reported alive again");
        }

        worker.buckets_settled_at = worker.last_heartbeat;
        worker.last_heartbeat = now;
        worker.bucket_ids_being_processed = bucket_ids_being_processed.into_iter().collect();
        Ok(())
    }

    /// Excludes a worker from any further work. Never undone.
    pub fn block_worker(&self, worker_id: &WorkerId) {
        let now = self.clock.now();
        let mut workers = self.workers.lock();

        let worker = workers
            .workers
            .entry(worker_id.clone())
            .or_insert_with(|| TrackedWorker::new(now));
        if !worker.blocked {
            tracing::warn!(%worker_id, "worker blocked");
        }
        worker.blocked = true;
    }

    pub fn did_dequeue_bucket(&self, worker_id: &WorkerId, bucket_id: BucketId) {
        let mut workers = self.workers.lock();
        if let Some(worker) = workers.workers.get_mut(worker_id) {
            worker.bucket_ids_being_processed.insert(bucket_id);
        }
    }

    pub fn did_finish_bucket(&self, worker_id: &WorkerId, bucket_id: &BucketId) {
        let mut workers = self.workers.lock();
        if let Some(worker) = workers.workers.get_mut(worker_id) {
            worker.bucket_ids_being_processed.remove(bucket_id);
        }
    }

    pub fn aliveness(&self, worker_id: &WorkerId) -> WorkerAliveness {
        let now = self.clock.now();
        let workers = self.workers.lock();
        match workers.workers.get(worker_id) {
            Some(worker) => self.aliveness_of(worker, now),
            None => WorkerAliveness {
                status: AlivenessStatus::NotRegistered,
                bucket_ids_being_processed: Default::default(),
            },
        }
    }

    pub fn is_alive(&self, worker_id: &WorkerId) -> bool {
        self.status(worker_id) == AlivenessStatus::Alive
    }

    /// Why the bucket `worker_id` claimed at `dequeued_at` is stuck, if it is.
    pub fn stuck_reason(
        &self,
        worker_id: &WorkerId,
        bucket_id: &BucketId,
        dequeued_at: Instant,
    ) -> Option<StuckReason> {
        let now = self.clock.now();
        let workers = self.workers.lock();
        let worker = workers.workers.get(worker_id)?;

        match self.status_of(worker, now) {
            AlivenessStatus::Silent => Some(StuckReason::WorkerIsSilent),
            AlivenessStatus::Blocked => Some(StuckReason::WorkerIsBlocked),
            AlivenessStatus::NotRegistered => None,
            AlivenessStatus::Alive => {
                let lost = dequeued_at <= worker.buckets_settled_at
                    && !worker.bucket_ids_being_processed.contains(bucket_id);
                lost.then_some(StuckReason::BucketLost)
            }
        }
    }

    pub fn alive_workers(&self) -> Vec<WorkerId> {
        let now = self.clock.now();
        let workers = self.workers.lock();
        workers
            .workers
            .iter()
            .filter(|(_, worker)| self.status_of(worker, now) == AlivenessStatus::Alive)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn status(&self, worker_id: &WorkerId) -> AlivenessStatus {
        let now = self.clock.now();
        let workers = self.workers.lock();
        workers
            .workers
            .get(worker_id)
            .map(|worker| self.status_of(worker, now))
            .unwrap_or(AlivenessStatus::NotRegistered)
    }

    pub fn has_any_alive_worker(&self) -> bool {
        let now = self.clock.now();
        let workers = self.workers.lock();
        workers
            .workers
            .values()
            .any(|worker| self.status_of(worker, now) == AlivenessStatus::Alive)
    }

    pub fn alive_worker_count(&self) -> usize {
        let now = self.clock.now();
        let workers = self.workers.lock();
        workers
            .workers
            .values()
            .filter(|worker| self.status_of(worker, now) == AlivenessStatus::Alive)
            .count()
    }

    /// Whether any worker has registered since the queue started.
    pub fn has_any_worker_ever_registered(&self) -> bool {
        self.workers.lock().any_ever_registered
    }

    pub fn snapshot(&self) -> BTreeMap<WorkerId, WorkerAliveness> {
        let now = self.clock.now();
        let workers = self.workers.lock();
        workers
            .workers
            .iter()
            .map(|(id, worker)| (id.clone(), self.aliveness_of(worker, now)))
            .collect()
    }

    fn is_silent(&self, worker: &TrackedWorker, now: Instant) -> bool {
        now.saturating_duration_since(worker.last_heartbeat) > self.allowed_silence
    }

    fn status_of(&self, worker: &TrackedWorker, now: Instant) -> AlivenessStatus {
        if worker.blocked {
            AlivenessStatus::Blocked
        } else if !worker.registered {
            AlivenessStatus::NotRegistered
        } else if self.is_silent(worker, now) {
            AlivenessStatus::Silent
        } else {
            AlivenessStatus::Alive
        }
    }

    fn aliveness_of(&self, worker: &TrackedWorker, now: Instant) -> WorkerAliveness {
        WorkerAliveness {
            status: self.status_of(worker, now),
            bucket_ids_being_processed: worker.bucket_ids_being_processed.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use dtq_utils::{
        net_protocol::workers::{BucketId, ExecutionConfiguration, TestEntry, WorkerId},
        time::{Clock, ManualClock},
    };

    use super::{AlivenessError, AlivenessStatus, StuckReason, WorkerAlivenessTracker};

    const SILENCE: Duration = Duration::from_secs(10);

    fn tracker() -> (WorkerAlivenessTracker, ManualClock) {
        let clock = ManualClock::new();
        (WorkerAlivenessTracker::new(SILENCE, clock.shared()), clock)
    }

    fn bucket_id(n: u8) -> BucketId {
        BucketId::derive(
            &[n],
            &[TestEntry::new("A", "test")],
            &ExecutionConfiguration::default(),
        )
    }

    #[test]
    fn unknown_worker_is_not_registered() {
        let (tracker, _) = tracker();
        let aliveness = tracker.aliveness(&WorkerId::from("w1"));
        assert_eq!(aliveness.status, AlivenessStatus::NotRegistered);
        assert!(aliveness.bucket_ids_being_processed.is_empty());
        assert!(!tracker.has_any_worker_ever_registered());
    }

    #[test]
    fn registered_worker_is_alive() {
        let (tracker, _) = tracker();
        let w1 = WorkerId::from("w1");
        tracker.register_worker(&w1).unwrap();

        assert!(tracker.is_alive(&w1));
        assert!(tracker.has_any_alive_worker());
        assert!(tracker.has_any_worker_ever_registered());
    }

    #[test]
    fn worker_goes_silent_only_after_allowed_silence() {
        let (tracker, clock) = tracker();
        let w1 = WorkerId::from("w1");
        tracker.register_worker(&w1).unwrap();

        clock.advance(SILENCE);
        assert_eq!(tracker.status(&w1), AlivenessStatus::Alive);

        clock.advance(Duration::from_millis(1));
        assert_eq!(tracker.status(&w1), AlivenessStatus::Silent);
        assert!(!tracker.has_any_alive_worker());
    }

    #[test]
    fn heartbeat_revives_silent_worker() {
        let (tracker, clock) = tracker();
        let w2 = WorkerId::from("w2");
        tracker.register_worker(&w2).unwrap();

        clock.advance(SILENCE * 2);
        assert_eq!(tracker.status(&w2), AlivenessStatus::Silent);

        tracker.report_alive(&w2, []).unwrap();
        assert_eq!(tracker.status(&w2), AlivenessStatus::Alive);
    }

    #[test]
    fn heartbeat_replaces_buckets_being_processed() {
        let (tracker, _) = tracker();
        let w1 = WorkerId::from("w1");
        tracker.register_worker(&w1).unwrap();

        tracker.did_dequeue_bucket(&w1, bucket_id(1));
        tracker.did_dequeue_bucket(&w1, bucket_id(2));
        assert_eq!(
            tracker.aliveness(&w1).bucket_ids_being_processed,
            [bucket_id(1), bucket_id(2)].into_iter().collect()
        );

        tracker.report_alive(&w1, [bucket_id(3)]).unwrap();
        assert_eq!(
            tracker.aliveness(&w1).bucket_ids_being_processed,
            [bucket_id(3)].into_iter().collect()
        );

        tracker.did_finish_bucket(&w1, &bucket_id(3));
        assert!(tracker.aliveness(&w1).bucket_ids_being_processed.is_empty());
    }

    #[test]
    fn heartbeat_from_unregistered_worker_is_rejected() {
        let (tracker, _) = tracker();
        let w1 = WorkerId::from("w1");
        assert_eq!(
            tracker.report_alive(&w1, []),
            Err(AlivenessError::WorkerNotRegistered(w1.clone()))
        );
        assert_eq!(tracker.status(&w1), AlivenessStatus::NotRegistered);
    }

    #[test]
    fn blocked_is_terminal() {
        let (tracker, _) = tracker();
        let w1 = WorkerId::from("w1");
        tracker.register_worker(&w1).unwrap();
        tracker.did_dequeue_bucket(&w1, bucket_id(1));

        tracker.block_worker(&w1);
        assert_eq!(tracker.status(&w1), AlivenessStatus::Blocked);

        assert_eq!(
            tracker.report_alive(&w1, []),
            Err(AlivenessError::WorkerBlocked(w1.clone()))
        );
        assert_eq!(
            tracker.register_worker(&w1),
            Err(AlivenessError::WorkerBlocked(w1.clone()))
        );
        assert_eq!(tracker.status(&w1), AlivenessStatus::Blocked);
        // Heartbeats from a blocked worker do not touch its tracked buckets.
        assert_eq!(
            tracker.aliveness(&w1).bucket_ids_being_processed,
            [bucket_id(1)].into_iter().collect()
        );
    }

    #[test]
    fn never_registered_worker_can_be_blocked() {
        let (tracker, _) = tracker();
        let w1 = WorkerId::from("w1");
        tracker.block_worker(&w1);

        assert_eq!(tracker.status(&w1), AlivenessStatus::Blocked);
        assert!(tracker.register_worker(&w1).is_err());
        assert!(!tracker.has_any_worker_ever_registered());
    }

    #[test]
    fn reregistration_forgets_buckets() {
        let (tracker, _) = tracker();
        let w1 = WorkerId::from("w1");
        tracker.register_worker(&w1).unwrap();
        tracker.did_dequeue_bucket(&w1, bucket_id(1));

        tracker.register_worker(&w1).unwrap();
        assert!(tracker.aliveness(&w1).bucket_ids_being_processed.is_empty());
    }

    #[test]
    fn bucket_forgotten_by_reregistration_is_lost() {
        let (tracker, clock) = tracker();
        let w1 = WorkerId::from("w1");
        tracker.register_worker(&w1).unwrap();
        let dequeued_at = clock.now();
        tracker.did_dequeue_bucket(&w1, bucket_id(1));
        assert_eq!(tracker.stuck_reason(&w1, &bucket_id(1), dequeued_at), None);

        clock.advance(Duration::from_secs(1));
        tracker.register_worker(&w1).unwrap();
        assert_eq!(
            tracker.stuck_reason(&w1, &bucket_id(1), dequeued_at),
            Some(StuckReason::BucketLost)
        );
    }

    #[test]
    fn one_heartbeat_without_a_fresh_bucket_does_not_lose_it() {
        let (tracker, clock) = tracker();
        let w1 = WorkerId::from("w1");
        tracker.register_worker(&w1).unwrap();

        clock.advance(Duration::from_secs(1));
        let dequeued_at = clock.now();
        tracker.did_dequeue_bucket(&w1, bucket_id(1));

        // Snapshot taken before the worker saw the bucket.
        clock.advance(Duration::from_secs(1));
        tracker.report_alive(&w1, []).unwrap();
        assert_eq!(tracker.stuck_reason(&w1, &bucket_id(1), dequeued_at), None);

        clock.advance(Duration::from_secs(1));
        tracker.report_alive(&w1, [bucket_id(1)]).unwrap();
        assert_eq!(tracker.stuck_reason(&w1, &bucket_id(1), dequeued_at), None);

        clock.advance(Duration::from_secs(1));
        tracker.report_alive(&w1, []).unwrap();
        assert_eq!(
            tracker.stuck_reason(&w1, &bucket_id(1), dequeued_at),
            Some(StuckReason::BucketLost)
        );
    }

    #[test]
    fn stuck_reason_of_unresponsive_workers() {
        let (tracker, clock) = tracker();
        let (w1, w2, w3) = (
            WorkerId::from("w1"),
            WorkerId::from("w2"),
            WorkerId::from("w3"),
        );
        let dequeued_at = clock.now();
        tracker.register_worker(&w1).unwrap();
        tracker.register_worker(&w2).unwrap();
        tracker.block_worker(&w2);

        assert_eq!(
            tracker.stuck_reason(&w2, &bucket_id(1), dequeued_at),
            Some(StuckReason::WorkerIsBlocked)
        );
        assert_eq!(tracker.stuck_reason(&w3, &bucket_id(1), dequeued_at), None);

        clock.advance(SILENCE * 2);
        assert_eq!(
            tracker.stuck_reason(&w1, &bucket_id(1), dequeued_at),
            Some(StuckReason::WorkerIsSilent)
        );
        assert!(tracker.alive_workers().is_empty());
    }

    #[test]
    fn snapshot_lists_all_known_workers() {
        let (tracker, clock) = tracker();
        let (w1, w2, w3) = (
            WorkerId::from("w1"),
            WorkerId::from("w2"),
            WorkerId::from("w3"),
        );
        tracker.register_worker(&w1).unwrap();
        clock.advance(SILENCE * 2);
        tracker.register_worker(&w2).unwrap();
        tracker.block_worker(&w3);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot[&w1].status, AlivenessStatus::Silent);
        assert_eq!(snapshot[&w2].status, AlivenessStatus::Alive);
        assert_eq!(snapshot[&w3].status, AlivenessStatus::Blocked);
        assert_eq!(tracker.alive_worker_count(), 1);
    }
}
