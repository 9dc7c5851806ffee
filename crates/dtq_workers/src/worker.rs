//! The worker process loop: register, pull buckets, run them, push results, repeat.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use dtq_utils::atomic;
use dtq_utils::net_protocol::queue::{
    DequeueBucketResponse, PushResultResponse, RegisterWorkerResponse, ReportAliveResponse,
};
use dtq_utils::net_protocol::workers::{Bucket, BucketId, RequestId, WorkerConfiguration, WorkerId};
use dtq_utils::retry::{async_retry_n, ExpDecay};
use dtq_utils::server_shutdown::{ShutdownManager, ShutdownReceiver};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::client::{ClientError, QueueClient};
use crate::executor::TestExecutor;

#[derive(Debug, Clone)]
pub struct DistWorkerConfig {
    pub worker_id: WorkerId,
    /// Attempts of every request to the queue before giving up.
    pub request_attempts: usize,
    pub request_backoff: ExpDecay,
}

impl DistWorkerConfig {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            request_attempts: 5,
            request_backoff: ExpDecay::doubling(Duration::from_millis(100), Duration::from_secs(5)),
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{0}")]
    Client(#[from] ClientError),

    #[error("worker {0} is blocked by the queue")]
    Blocked(WorkerId),

    #[error("worker {0} is not known to the queue")]
    UnknownWorker(WorkerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerSummary {
    pub buckets_executed: usize,
    pub results_accepted: usize,
}

/// A worker pulling buckets from a queue until the queue runs dry.
pub struct DistWorker {
    client: QueueClient,
    executor: Arc<dyn TestExecutor>,
    config: DistWorkerConfig,
}

/// State the dequeue loop shares with the heartbeat task.
#[derive(Default)]
struct Shared {
    in_progress: Mutex<BTreeSet<BucketId>>,
    blocked: AtomicBool,
}

impl DistWorker {
    pub fn new(
        client: QueueClient,
        executor: Arc<dyn TestExecutor>,
        config: DistWorkerConfig,
    ) -> Self {
        Self {
            client,
            executor,
            config,
        }
    }

    /// Works until the queue reports it is empty.
    #[tracing::instrument(level = "debug", skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run(self) -> Result<WorkerSummary, WorkerError> {
        self.client.check_version().await?;
        let mut worker_configuration = self.register().await?;

        let shared = Arc::new(Shared::default());
        let (heartbeat_shutdown, heartbeat_rx) = ShutdownManager::new_pair();
        let heartbeat = self.spawn_heartbeat(&worker_configuration, shared.clone(), heartbeat_rx);

        let result = self.work(&mut worker_configuration, &shared).await;

        heartbeat_shutdown.shutdown_immediately();
        if let Err(error) = heartbeat.await {
            tracing::warn!(%error, "heartbeat task failed");
        }

        match &result {
            Ok(summary) => tracing::info!(?summary, "worker finished"),
            Err(error) => tracing::error!(%error, "worker stopped"),
        }
        result
    }

    async fn work(
        &self,
        worker_configuration: &mut WorkerConfiguration,
        shared: &Shared,
    ) -> Result<WorkerSummary, WorkerError> {
        let worker_id = &self.config.worker_id;
        let mut summary = WorkerSummary::default();

        loop {
            if shared.blocked.load(atomic::ORDERING) {
                return Err(WorkerError::Blocked(worker_id.clone()));
            }

            // Retries reuse the request id, so a lost response cannot leak a claimed bucket.
            let request_id = RequestId::unique();
            let response = self
                .retrying(|| self.client.dequeue_bucket(worker_id, &request_id))
                .await?;

            match response {
                DequeueBucketResponse::BucketDequeued { bucket } => {
                    summary.buckets_executed += 1;
                    if self.execute(bucket, worker_configuration, shared).await? {
                        summary.results_accepted += 1;
                    }
                }
                DequeueBucketResponse::CheckAgainLater { after } => {
                    tracing::debug!(?after, "nothing to dequeue yet");
                    tokio::time::sleep(after).await;
                }
                DequeueBucketResponse::WorkerIsNotAlive => {
                    tracing::info!("queue considers worker not alive, registering again");
                    *worker_configuration = self.register().await?;
                }
                DequeueBucketResponse::QueueIsEmpty => return Ok(summary),
            }
        }
    }

    /// Runs a bucket and pushes its result. Returns whether the queue accepted the result.
    async fn execute(
        &self,
        bucket: Bucket,
        worker_configuration: &WorkerConfiguration,
        shared: &Shared,
    ) -> Result<bool, WorkerError> {
        let worker_id = &self.config.worker_id;
        let bucket_id = bucket.bucket_id.clone();
        tracing::debug!(%bucket_id, test_count = bucket.test_entries.len(), "executing bucket");

        shared.in_progress.lock().insert(bucket_id.clone());
        let testing_result = self.executor.execute(&bucket, worker_configuration).await;

        let request_id = RequestId::unique();
        let pushed = self
            .retrying(|| self.client.push_result(worker_id, &request_id, testing_result.clone()))
            .await;
        shared.in_progress.lock().remove(&bucket_id);

        match pushed? {
            PushResultResponse::Accepted => Ok(true),
            PushResultResponse::Rejected { reason } => {
                tracing::warn!(%bucket_id, %reason, "queue rejected testing result");
                Ok(false)
            }
        }
    }

    async fn register(&self) -> Result<WorkerConfiguration, WorkerError> {
        let worker_id = &self.config.worker_id;
        let response = self
            .retrying(|| self.client.register_worker(worker_id))
            .await?;

        match response {
            RegisterWorkerResponse::Success {
                worker_configuration,
            } => {
                tracing::info!(%worker_id, "registered with queue");
                Ok(worker_configuration)
            }
            RegisterWorkerResponse::Blocked => Err(WorkerError::Blocked(worker_id.clone())),
            RegisterWorkerResponse::UnknownWorker => {
                Err(WorkerError::UnknownWorker(worker_id.clone()))
            }
        }
    }

    async fn retrying<F, T>(&self, mut request: impl FnMut() -> F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        async_retry_n(
            self.config.request_attempts,
            self.config.request_backoff,
            |attempt| {
                if attempt > 1 {
                    tracing::debug!(attempt, "retrying request to queue");
                }
                request()
            },
        )
        .await
    }

    fn spawn_heartbeat(
        &self,
        worker_configuration: &WorkerConfiguration,
        shared: Arc<Shared>,
        mut shutdown: ShutdownReceiver,
    ) -> JoinHandle<()> {
        let client = self.client;
        let worker_id = self.config.worker_id.clone();
        let interval = worker_configuration.report_alive_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.recv_shutdown_immediately() => break,
                }

                let bucket_ids: Vec<_> = shared.in_progress.lock().iter().cloned().collect();
                match client.report_alive(&worker_id, bucket_ids).await {
                    Ok(ReportAliveResponse::Accepted) => {}
                    Ok(ReportAliveResponse::WorkerBlocked) => {
                        tracing::warn!(%worker_id, "queue blocked this worker");
                        shared.blocked.store(true, atomic::ORDERING);
                        break;
                    }
                    Ok(ReportAliveResponse::WorkerNotRegistered) => {
                        tracing::warn!(%worker_id, "queue does not know this worker");
                    }
                    Err(error) => {
                        tracing::warn!(%worker_id, %error, "failed to report alive");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use dtq_utils::auth::{ClientAuthStrategy, ServerAuthStrategy};
    use dtq_utils::net_opt::{ClientOptions, ServerOptions};
    use dtq_utils::net_protocol::{
        self,
        queue::{
            DequeueBucketResponse, Message, PushResultResponse, QueueVersion,
            RegisterWorkerResponse, ReportAliveResponse,
        },
        workers::{
            Bucket, BucketId, ExecutionConfiguration, TestEntry, TestEntryResult, TestingResult,
            WorkerConfiguration, WorkerId,
        },
    };
    use dtq_utils::retry::ExpDecay;
    use ntest::timeout;
    use parking_lot::Mutex;
    use tracing_test::{internal::logs_with_scope_contain, traced_test};

    use super::{DistWorker, DistWorkerConfig, WorkerError};
    use crate::client::{ClientError, QueueClient};
    use crate::executor::TestExecutor;

    /// Answers every message with whatever `respond` returns for it.
    async fn fake_queue<F>(respond: F) -> SocketAddr
    where
        F: Fn(Message) -> serde_json::Value + Send + Sync + 'static,
    {
        let listener = ServerOptions::new(ServerAuthStrategy::no_auth())
            .bind_async("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let respond = Arc::new(respond);

        tokio::spawn(async move {
            loop {
                let (conn, _) = listener.accept().await.unwrap();
                let handshake_ctx = listener.handshake_ctx();
                let respond = respond.clone();
                tokio::spawn(async move {
                    let mut conn = handshake_ctx.handshake(conn).await.unwrap();
                    let message: Message = net_protocol::async_read(&mut conn).await.unwrap();
                    let response = respond(message);
                    net_protocol::async_write(&mut conn, &response).await.unwrap();
                });
            }
        });

        addr
    }

    fn json<T: serde::Serialize>(value: T) -> serde_json::Value {
        serde_json::to_value(value).unwrap()
    }

    fn version() -> serde_json::Value {
        json(QueueVersion {
            version: dtq_utils::VERSION.to_owned(),
        })
    }

    fn registered(report_alive_interval: Duration) -> serde_json::Value {
        json(RegisterWorkerResponse::Success {
            worker_configuration: WorkerConfiguration {
                report_alive_interval,
                ..Default::default()
            },
        })
    }

    fn worker(addr: SocketAddr, executor: impl TestExecutor + 'static) -> DistWorker {
        let client = QueueClient::new(
            addr,
            ClientOptions::new(ClientAuthStrategy::no_auth()).build_async(),
        );
        let config = DistWorkerConfig {
            worker_id: WorkerId::from("W1"),
            request_attempts: 3,
            request_backoff: ExpDecay::constant(Duration::from_millis(1)),
        };
        DistWorker::new(client, Arc::new(executor), config)
    }

    fn bucket() -> Bucket {
        Bucket::new(
            b"",
            vec![TestEntry::new("A", "testFoo")],
            ExecutionConfiguration::default(),
        )
    }

    /// Passes every test, after `delay`.
    struct PassingExecutor {
        delay: Duration,
    }

    #[async_trait]
    impl TestExecutor for PassingExecutor {
        async fn execute(&self, bucket: &Bucket, _: &WorkerConfiguration) -> TestingResult {
            tokio::time::sleep(self.delay).await;
            TestingResult {
                bucket_id: bucket.bucket_id.clone(),
                results: bucket
                    .test_entries
                    .iter()
                    .map(|e| TestEntryResult::success(e.clone(), self.delay))
                    .collect(),
            }
        }
    }

    fn passing() -> PassingExecutor {
        PassingExecutor {
            delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn runs_buckets_until_queue_is_empty() {
        let dequeues = Arc::new(AtomicUsize::new(0));
        let pushed = Arc::new(Mutex::new(Vec::new()));

        let addr = fake_queue({
            let dequeues = dequeues.clone();
            let pushed = pushed.clone();
            move |message| match message {
                Message::QueueVersion => version(),
                Message::RegisterWorker { .. } => registered(Duration::from_secs(30)),
                Message::DequeueBucket { .. } => match dequeues.fetch_add(1, Ordering::SeqCst) {
                    0 => json(DequeueBucketResponse::BucketDequeued { bucket: bucket() }),
                    1 => json(DequeueBucketResponse::CheckAgainLater {
                        after: Duration::from_millis(1),
                    }),
                    _ => json(DequeueBucketResponse::QueueIsEmpty),
                },
                Message::PushResult { testing_result, .. } => {
                    pushed.lock().push(testing_result);
                    json(PushResultResponse::Accepted)
                }
                other => panic!("unexpected message {other:?}"),
            }
        })
        .await;

        let summary = worker(addr, passing()).run().await.unwrap();

        assert_eq!(summary.buckets_executed, 1);
        assert_eq!(summary.results_accepted, 1);
        assert_eq!(dequeues.load(Ordering::SeqCst), 3);
        let pushed = pushed.lock();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].bucket_id, bucket().bucket_id);
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn heartbeat_reports_bucket_in_progress() {
        let reported: Arc<Mutex<Vec<Vec<BucketId>>>> = Default::default();
        let dequeues = Arc::new(AtomicUsize::new(0));

        let addr = fake_queue({
            let reported = reported.clone();
            let dequeues = dequeues.clone();
            move |message| match message {
                Message::QueueVersion => version(),
                Message::RegisterWorker { .. } => registered(Duration::from_millis(5)),
                Message::DequeueBucket { .. } => match dequeues.fetch_add(1, Ordering::SeqCst) {
                    0 => json(DequeueBucketResponse::BucketDequeued { bucket: bucket() }),
                    _ => json(DequeueBucketResponse::QueueIsEmpty),
                },
                Message::PushResult { .. } => json(PushResultResponse::Accepted),
                Message::ReportAlive {
                    bucket_ids_being_processed,
                    ..
                } => {
                    reported.lock().push(bucket_ids_being_processed);
                    json(ReportAliveResponse::Accepted)
                }
                other => panic!("unexpected message {other:?}"),
            }
        })
        .await;

        let executor = PassingExecutor {
            delay: Duration::from_millis(100),
        };
        worker(addr, executor).run().await.unwrap();

        let reported: BTreeSet<_> = reported.lock().iter().flatten().cloned().collect();
        assert!(reported.contains(&bucket().bucket_id));
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn registers_again_when_not_alive() {
        let registrations = Arc::new(AtomicUsize::new(0));
        let dequeues = Arc::new(AtomicUsize::new(0));

        let addr = fake_queue({
            let registrations = registrations.clone();
            let dequeues = dequeues.clone();
            move |message| match message {
                Message::QueueVersion => version(),
                Message::RegisterWorker { .. } => {
                    registrations.fetch_add(1, Ordering::SeqCst);
                    registered(Duration::from_secs(30))
                }
                Message::DequeueBucket { .. } => match dequeues.fetch_add(1, Ordering::SeqCst) {
                    0 => json(DequeueBucketResponse::WorkerIsNotAlive),
                    _ => json(DequeueBucketResponse::QueueIsEmpty),
                },
                other => panic!("unexpected message {other:?}"),
            }
        })
        .await;

        worker(addr, passing()).run().await.unwrap();
        assert_eq!(registrations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn blocked_on_registration_is_an_error() {
        let addr = fake_queue(|message| match message {
            Message::QueueVersion => version(),
            Message::RegisterWorker { .. } => json(RegisterWorkerResponse::Blocked),
            other => panic!("unexpected message {other:?}"),
        })
        .await;

        let result = worker(addr, passing()).run().await;
        assert!(matches!(result, Err(WorkerError::Blocked(_))));
    }

    #[tokio::test]
    #[timeout(5000)]
    #[traced_test]
    async fn blocked_by_heartbeat_stops_worker() {
        let addr = fake_queue(|message| match message {
            Message::QueueVersion => version(),
            Message::RegisterWorker { .. } => registered(Duration::from_millis(5)),
            Message::DequeueBucket { .. } => json(DequeueBucketResponse::CheckAgainLater {
                after: Duration::from_millis(5),
            }),
            Message::ReportAlive { .. } => json(ReportAliveResponse::WorkerBlocked),
            other => panic!("unexpected message {other:?}"),
        })
        .await;

        let result = worker(addr, passing()).run().await;
        assert!(matches!(result, Err(WorkerError::Blocked(_))));
        assert!(logs_with_scope_contain(
            "dtq_workers::worker",
            "queue blocked this worker"
        ));
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn refuses_queue_of_other_version() {
        let addr = fake_queue(|message| match message {
            Message::QueueVersion => json(QueueVersion {
                version: "0.0.0-elsewhere".to_owned(),
            }),
            other => panic!("unexpected message {other:?}"),
        })
        .await;

        let result = worker(addr, passing()).run().await;
        assert!(matches!(
            result,
            Err(WorkerError::Client(ClientError::VersionMismatch { .. }))
        ));
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn unreachable_queue_fails_after_retries() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = worker(addr, passing()).run().await;
        assert!(matches!(result, Err(WorkerError::Client(ClientError::Io(_)))));
    }
}
