use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dtq_utils::auth::ServerAuthStrategy;
use dtq_utils::error::{
    here, log_request_error, AnyError, ErrorWorker, OpaqueResult, RequestError, ResultLocation,
};
use dtq_utils::net_async::{self, ServerStream, UnverifiedServerStream};
use dtq_utils::net_opt::ServerOptions;
use dtq_utils::net_protocol::{
    self,
    queue::{
        BlockWorkerResponse, DeleteJobResponse, DequeueBucketResponse, JobId, JobResultsResponse,
        JobStateResponse, Message, PushResultResponse, QueueVersion, RegisterWorkerResponse,
        ReportAliveResponse, ScheduleTestsRequest, ScheduleTestsResponse,
    },
    publicize_addr,
    workers::{BucketId, RequestId, TestingResult, WorkerId},
};
use dtq_utils::server_shutdown::{ShutdownManager, ShutdownReceiver};
use dtq_utils::time::{SharedClock, SystemClock};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::aliveness::{AlivenessError, WorkerAlivenessTracker};
use crate::balancing_queue::{
    AllowAllWorkers, BalancingBucketQueue, BalancingQueueConfig, JobState,
    NothingToDequeueBehavior, WorkerPermissionProvider,
};
use crate::bucket_queue::{BucketQueueConfig, DequeueOutcome, DequeuePreference};
use crate::enqueuer::TestsEnqueuer;
use crate::termination::{AutomaticTerminationController, AutomaticTerminationPolicy};
use crate::worker_configurations::WorkerConfigurations;

pub const DEFAULT_CHECK_AGAIN_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_ALLOWED_SILENCE_DURATION: Duration = Duration::from_secs(60);
pub const DEFAULT_NEW_WORKER_REGISTRATION_TIME_ALLOWANCE: Duration = Duration::from_secs(60);
pub const DEFAULT_STUCK_BUCKETS_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_NUMBER_OF_RETRIES: u32 = 1;

/// What happens to buckets claimed by a worker that went silent, was blocked, or lost track of
/// them.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimPolicy {
    /// Buckets stay claimed until their worker comes back with a result.
    LeaveInFlight,
    /// Buckets are periodically taken back and enqueued again, one test per bucket.
    #[default]
    ReenqueueFromSilentWorkers,
}

/// Configures initialization of the queue.
#[derive(Clone)]
pub struct QueueConfig {
    /// The IP address the queue should advertise to its clients.
    pub public_ip: IpAddr,
    /// The IP address the queue server binds to.
    pub bind_ip: IpAddr,
    /// The port the queue server binds to. Binds to any port if `0`.
    pub server_port: u16,
    /// How the queue server accepts connections.
    pub server_options: ServerOptions,
    /// Delay suggested to workers when there is nothing for them right now.
    pub check_again_interval: Duration,
    /// How long a worker may go without a heartbeat before it stops receiving buckets.
    pub allowed_silence_duration: Duration,
    /// How long the queue waits for its first worker before failing all jobs.
    pub new_worker_registration_time_allowance: Duration,
    /// How often buckets claimed by silent workers are looked for.
    pub stuck_buckets_poll_interval: Duration,
    pub reclaim_policy: ReclaimPolicy,
    /// Retries of failed tests, for tests that do not specify their own.
    pub number_of_retries: u32,
    /// Whether retries steer clear of the workers they failed on.
    pub dequeue_preference: DequeuePreference,
    pub termination_policy: AutomaticTerminationPolicy,
    /// Whether the queue terminates once every scheduled job is depleted.
    pub terminate_when_all_jobs_depleted: bool,
    pub nothing_to_dequeue: NothingToDequeueBehavior,
    pub worker_configurations: WorkerConfigurations,
    pub worker_permissions: Arc<dyn WorkerPermissionProvider>,
    pub clock: SharedClock,
}

impl Default for QueueConfig {
    /// Binds to any port on all interfaces, and advertises on localhost.
    fn default() -> Self {
        Self {
            public_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            server_port: 0,
            server_options: ServerOptions::new(ServerAuthStrategy::no_auth()),
            check_again_interval: DEFAULT_CHECK_AGAIN_INTERVAL,
            allowed_silence_duration: DEFAULT_ALLOWED_SILENCE_DURATION,
            new_worker_registration_time_allowance:
                DEFAULT_NEW_WORKER_REGISTRATION_TIME_ALLOWANCE,
            stuck_buckets_poll_interval: DEFAULT_STUCK_BUCKETS_POLL_INTERVAL,
            reclaim_policy: ReclaimPolicy::default(),
            number_of_retries: DEFAULT_NUMBER_OF_RETRIES,
            dequeue_preference: DequeuePreference::default(),
            termination_policy: AutomaticTerminationPolicy::default(),
            terminate_when_all_jobs_depleted: false,
            nothing_to_dequeue: NothingToDequeueBehavior::default(),
            worker_configurations: WorkerConfigurations::default(),
            worker_permissions: Arc::new(AllowAllWorkers),
            clock: SystemClock::shared(),
        }
    }
}

/// Everything the queue server shares between its connections.
#[derive(Clone)]
pub struct QueueState {
    aliveness: Arc<WorkerAlivenessTracker>,
    balancing: Arc<BalancingBucketQueue>,
    enqueuer: Arc<TestsEnqueuer>,
    termination: Arc<AutomaticTerminationController>,
    worker_configurations: Arc<WorkerConfigurations>,
    reclaim_policy: ReclaimPolicy,
}

impl QueueState {
    pub fn new(config: &QueueConfig) -> Self {
        let aliveness = Arc::new(WorkerAlivenessTracker::new(
            config.allowed_silence_duration,
            config.clock.clone(),
        ));
        let balancing = Arc::new(BalancingBucketQueue::new(
            BalancingQueueConfig {
                bucket_queue: BucketQueueConfig {
                    number_of_retries: config.number_of_retries,
                    check_again_after: config.check_again_interval,
                    dequeue_preference: config.dequeue_preference,
                },
                nothing_to_dequeue: config.nothing_to_dequeue,
            },
            config.clock.clone(),
            aliveness.clone(),
            config.worker_permissions.clone(),
        ));
        let enqueuer = Arc::new(TestsEnqueuer::new(balancing.clone()));
        let termination = Arc::new(AutomaticTerminationController::new(
            config.termination_policy,
            config.clock.clone(),
        ));

        Self {
            aliveness,
            balancing,
            enqueuer,
            termination,
            worker_configurations: Arc::new(config.worker_configurations.clone()),
            reclaim_policy: config.reclaim_policy,
        }
    }

    pub fn aliveness(&self) -> &WorkerAlivenessTracker {
        &self.aliveness
    }

    pub fn balancing(&self) -> &BalancingBucketQueue {
        &self.balancing
    }

    pub fn termination(&self) -> &AutomaticTerminationController {
        &self.termination
    }

    /// How many buckets new tests are split into, per configuration.
    fn splitting_worker_count(&self) -> usize {
        self.worker_configurations
            .known_worker_count()
            .max(self.aliveness.alive_worker_count())
            .max(1)
    }
}

/// A running queue server.
pub struct Queue {
    shutdown_manager: ShutdownManager,

    state: QueueState,

    server_addr: SocketAddr,
    server_handle: Option<JoinHandle<Result<(), QueueServerError>>>,
    sweeper_handle: Option<JoinHandle<()>>,

    active: bool,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("{0}")]
    Server(#[from] QueueServerError),

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("queue task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Queue {
    /// Binds the queue server and starts serving.
    pub async fn start(config: QueueConfig) -> Result<Self, QueueError> {
        let state = QueueState::new(&config);

        let listener = config
            .server_options
            .bind_async((config.bind_ip, config.server_port))
            .await?;
        let server_addr = publicize_addr(listener.local_addr()?, config.public_ip);

        let shutdown_manager = ShutdownManager::default();

        let server_handle = tokio::spawn({
            let server = QueueServer::new(state.clone());
            server.start(listener, shutdown_manager.add_receiver())
        });

        let sweeper_handle = match config.reclaim_policy {
            ReclaimPolicy::ReenqueueFromSilentWorkers => Some(tokio::spawn(sweep_stuck_buckets(
                state.balancing.clone(),
                config.stuck_buckets_poll_interval,
                shutdown_manager.add_receiver(),
            ))),
            ReclaimPolicy::LeaveInFlight => None,
        };

        tracing::info!(%server_addr, "queue started");

        Ok(Queue {
            shutdown_manager,
            state,
            server_addr,
            server_handle: Some(server_handle),
            sweeper_handle,
            active: true,
        })
    }

    /// The address clients should connect to.
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn state(&self) -> &QueueState {
        &self.state
    }

    /// Stops serving and waits for the server tasks to exit.
    #[instrument(level = "trace", skip(self))]
    pub async fn shutdown(&mut self) -> Result<(), QueueError> {
        self.active = false;
        self.shutdown_manager.shutdown_immediately();

        if let Some(sweeper) = self.sweeper_handle.take() {
            sweeper.await?;
        }
        if let Some(server) = self.server_handle.take() {
            server.await??;
        }

        tracing::info!(server_addr=%self.server_addr, "queue shut down");
        Ok(())
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if self.active {
            // Never shut down explicitly; at least stop the tasks.
            self.shutdown_manager.shutdown_immediately();
        }
    }
}

async fn sweep_stuck_buckets(
    balancing: Arc<BalancingBucketQueue>,
    poll_interval: Duration,
    mut shutdown: ShutdownReceiver,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown.recv_shutdown_immediately() => break,
        }

        let reclaimed = balancing.reenqueue_stuck_buckets();
        if !reclaimed.is_empty() {
            tracing::debug!(count = reclaimed.len(), "stuck bucket sweep reclaimed buckets");
        }
    }
}

/// Serves the queue protocol, one message per connection.
struct QueueServer {
    state: QueueState,
}

/// An error that happens in the construction or execution of the queue server.
///
/// Does not include errors in the handling of requests to the queue, but does include errors in
/// the acception or dispatch of connections.
#[derive(Debug, Error)]
pub enum QueueServerError {
    /// An IO-related error.
    #[error("{0}")]
    Io(#[from] io::Error),

    /// Any other opaque error that occurred.
    #[error("{0}")]
    Other(#[from] AnyError),
}

#[derive(Clone)]
struct QueueServerCtx {
    state: QueueState,
    handshake_ctx: net_async::ServerHandshakeCtx,
}

impl QueueServer {
    fn new(state: QueueState) -> Self {
        Self { state }
    }

    async fn start(
        self,
        server_listener: net_async::ServerListener,
        mut shutdown: ShutdownReceiver,
    ) -> Result<(), QueueServerError> {
        let ctx = QueueServerCtx {
            state: self.state,
            handshake_ctx: server_listener.handshake_ctx(),
        };

        loop {
            let client = tokio::select! {
                conn = server_listener.accept() => {
                    match conn {
                        Ok((conn, _)) => conn,
                        Err(e) => {
                            tracing::error!("error accepting connection to queue: {:?}", e);
                            continue;
                        }
                    }
                }
                _ = shutdown.recv_shutdown_immediately() => {
                    break;
                }
            };

            let ctx = ctx.clone();
            tokio::spawn(async move {
                let result = Self::handle(ctx, client).await;
                if let Err(error) = result {
                    log_request_error!(error, "error handling connection to queue: {}")
                }
            });
        }

        Ok(())
    }

    async fn handle(ctx: QueueServerCtx, stream: UnverifiedServerStream) -> Result<(), RequestError> {
        let mut stream = ctx
            .handshake_ctx
            .handshake(stream)
            .await
            .located(here!())
            .no_worker()?;
        let message: Message = net_protocol::async_read(&mut stream)
            .await
            .located(here!())
            .no_worker()?;

        let state = ctx.state;
        match message {
            Message::HealthCheck => Self::handle_healthcheck(stream).await.no_worker(),
            Message::QueueVersion => Self::handle_queue_version(stream).await.no_worker(),
            Message::RegisterWorker { worker_id } => {
                Self::handle_register_worker(state, &worker_id, stream)
                    .await
                    .for_worker(&worker_id)
            }
            Message::DequeueBucket {
                worker_id,
                request_id,
            } => Self::handle_dequeue_bucket(state, &worker_id, request_id, stream)
                .await
                .for_worker(&worker_id),
            Message::PushResult {
                worker_id,
                request_id,
                testing_result,
            } => Self::handle_push_result(state, &worker_id, request_id, testing_result, stream)
                .await
                .for_worker(&worker_id),
            Message::ReportAlive {
                worker_id,
                bucket_ids_being_processed,
            } => Self::handle_report_alive(state, &worker_id, bucket_ids_being_processed, stream)
                .await
                .for_worker(&worker_id),
            Message::ScheduleTests(request) => {
                Self::handle_schedule_tests(state, request, stream)
                    .await
                    .no_worker()
            }
            Message::JobState { job_id } => {
                Self::handle_job_state(state, job_id, stream).await.no_worker()
            }
            Message::JobResults { job_id } => {
                Self::handle_job_results(state, job_id, stream).await.no_worker()
            }
            Message::DeleteJob { job_id } => {
                Self::handle_delete_job(state, job_id, stream).await.no_worker()
            }
            Message::BlockWorker { worker_id } => {
                Self::handle_block_worker(state, &worker_id, stream)
                    .await
                    .for_worker(&worker_id)
            }
        }
    }

    #[instrument(level = "trace", skip(stream))]
    async fn handle_healthcheck(mut stream: ServerStream) -> OpaqueResult<()> {
        net_protocol::async_write(&mut stream, &net_protocol::health::healthy())
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(stream))]
    async fn handle_queue_version(mut stream: ServerStream) -> OpaqueResult<()> {
        let response = QueueVersion {
            version: dtq_utils::VERSION.to_owned(),
        };
        net_protocol::async_write(&mut stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(state, stream))]
    async fn handle_register_worker(
        state: QueueState,
        worker_id: &WorkerId,
        mut stream: ServerStream,
    ) -> OpaqueResult<()> {
        let response = match state.worker_configurations.lookup(worker_id) {
            None => {
                tracing::warn!(%worker_id, "unknown worker tried to register");
                RegisterWorkerResponse::UnknownWorker
            }
            Some(worker_configuration) => match state.aliveness.register_worker(worker_id) {
                Ok(()) => {
                    state.termination.indicate_activity();
                    RegisterWorkerResponse::Success {
                        worker_configuration: worker_configuration.clone(),
                    }
                }
                Err(AlivenessError::WorkerBlocked(_)) => RegisterWorkerResponse::Blocked,
                Err(error @ AlivenessError::WorkerNotRegistered(_)) => {
                    return Err(error).located(here!())
                }
            },
        };

        net_protocol::async_write(&mut stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(state, stream))]
    async fn handle_dequeue_bucket(
        state: QueueState,
        worker_id: &WorkerId,
        request_id: RequestId,
        mut stream: ServerStream,
    ) -> OpaqueResult<()> {
        let response = match state.balancing.dequeue_bucket(worker_id, &request_id) {
            DequeueOutcome::BucketDequeued(bucket) => {
                state.termination.indicate_activity();
                DequeueBucketResponse::BucketDequeued { bucket }
            }
            DequeueOutcome::QueueIsEmpty => DequeueBucketResponse::QueueIsEmpty,
            DequeueOutcome::CheckAgainLater(after) => {
                DequeueBucketResponse::CheckAgainLater { after }
            }
            DequeueOutcome::WorkerIsNotAlive => DequeueBucketResponse::WorkerIsNotAlive,
        };

        net_protocol::async_write(&mut stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(state, testing_result, stream), fields(bucket_id=%testing_result.bucket_id))]
    async fn handle_push_result(
        state: QueueState,
        worker_id: &WorkerId,
        request_id: RequestId,
        testing_result: TestingResult,
        mut stream: ServerStream,
    ) -> OpaqueResult<()> {
        let response = match state
            .balancing
            .accept(worker_id, &request_id, testing_result)
        {
            Ok(_) => {
                state.termination.indicate_activity();
                PushResultResponse::Accepted
            }
            Err(error) => {
                tracing::warn!(%worker_id, %error, "rejected testing result");
                PushResultResponse::Rejected {
                    reason: error.to_string(),
                }
            }
        };

        net_protocol::async_write(&mut stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(state, bucket_ids_being_processed, stream))]
    async fn handle_report_alive(
        state: QueueState,
        worker_id: &WorkerId,
        bucket_ids_being_processed: Vec<BucketId>,
        mut stream: ServerStream,
    ) -> OpaqueResult<()> {
        let response = match state
            .aliveness
            .report_alive(worker_id, bucket_ids_being_processed)
        {
            Ok(()) => ReportAliveResponse::Accepted,
            Err(AlivenessError::WorkerBlocked(_)) => ReportAliveResponse::WorkerBlocked,
            Err(AlivenessError::WorkerNotRegistered(_)) => {
                ReportAliveResponse::WorkerNotRegistered
            }
        };

        net_protocol::async_write(&mut stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(state, request, stream), fields(job_id=%request.job.job_id))]
    async fn handle_schedule_tests(
        state: QueueState,
        request: ScheduleTestsRequest,
        mut stream: ServerStream,
    ) -> OpaqueResult<()> {
        let request_id = request.request_id.clone();
        let worker_count = state.splitting_worker_count();

        let response = match state.enqueuer.enqueue(request, worker_count) {
            Ok(_) => {
                state.termination.indicate_activity();
                ScheduleTestsResponse::Scheduled { request_id }
            }
            Err(error) => {
                tracing::warn!(%error, "rejected scheduling request");
                ScheduleTestsResponse::Rejected {
                    reason: error.to_string(),
                }
            }
        };

        net_protocol::async_write(&mut stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(state, stream))]
    async fn handle_job_state(
        state: QueueState,
        job_id: JobId,
        mut stream: ServerStream,
    ) -> OpaqueResult<()> {
        let response = match state.balancing.failure() {
            Some(reason) => JobStateResponse::Failed { reason },
            None => match state.balancing.state(&job_id) {
                Some(JobState::Running(running)) => JobStateResponse::Running(running),
                Some(JobState::Deleted) => JobStateResponse::Deleted,
                None => JobStateResponse::NotFound,
            },
        };

        net_protocol::async_write(&mut stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(state, stream))]
    async fn handle_job_results(
        state: QueueState,
        job_id: JobId,
        mut stream: ServerStream,
    ) -> OpaqueResult<()> {
        let response = match state.balancing.results(&job_id) {
            Some(results) => JobResultsResponse::Results(results),
            None => JobResultsResponse::NotFound,
        };

        net_protocol::async_write(&mut stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(state, stream))]
    async fn handle_delete_job(
        state: QueueState,
        job_id: JobId,
        mut stream: ServerStream,
    ) -> OpaqueResult<()> {
        let response = match state.balancing.delete(&job_id) {
            Ok(()) => DeleteJobResponse::Acknowledged,
            Err(_) => DeleteJobResponse::NotFound,
        };

        net_protocol::async_write(&mut stream, &response)
            .await
            .located(here!())
    }

    #[instrument(level = "trace", skip(state, stream))]
    async fn handle_block_worker(
        state: QueueState,
        worker_id: &WorkerId,
        mut stream: ServerStream,
    ) -> OpaqueResult<()> {
        state.aliveness.block_worker(worker_id);
        tracing::info!(%worker_id, "blocked worker");

        if state.reclaim_policy == ReclaimPolicy::ReenqueueFromSilentWorkers {
            let reclaimed = state.balancing.reenqueue_stuck_buckets();
            tracing::info!(%worker_id, count = reclaimed.len(), "reclaimed buckets after blocking");
        }

        net_protocol::async_write(&mut stream, &BlockWorkerResponse::Acknowledged)
            .await
            .located(here!())
    }
}
