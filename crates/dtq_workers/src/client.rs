//! Client side of the queue protocol, used by workers and submitters alike.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use dtq_utils::net_async::ConfiguredClient;
use dtq_utils::net_protocol::{
    self,
    health::Health,
    queue::{
        BlockWorkerResponse, DeleteJobResponse, DequeueBucketResponse, JobId, JobResults,
        JobResultsResponse, JobStateResponse, Message, PushResultResponse, QueueVersion,
        RegisterWorkerResponse, ReportAliveResponse, RunningQueueState, ScheduleTestsRequest,
        ScheduleTestsResponse,
    },
    workers::{BucketId, RequestId, TestingResult, WorkerId},
};
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("queue failed: {0}")]
    QueueFailed(String),

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("job {0} was deleted")]
    JobDeleted(JobId),

    #[error("scheduling was rejected: {0}")]
    ScheduleRejected(String),

    #[error("queue runs version {queue}, but this client is version {client}")]
    VersionMismatch { queue: String, client: String },
}

/// Talks to a queue server, one connection per request.
#[derive(Debug, Clone, Copy)]
pub struct QueueClient {
    queue_addr: SocketAddr,
    client: ConfiguredClient,
}

impl QueueClient {
    pub fn new(queue_addr: SocketAddr, client: ConfiguredClient) -> Self {
        Self { queue_addr, client }
    }

    pub fn queue_addr(&self) -> SocketAddr {
        self.queue_addr
    }

    async fn request<T: DeserializeOwned>(&self, message: &Message) -> Result<T, ClientError> {
        let mut conn = self.client.connect(self.queue_addr).await?;
        net_protocol::async_write(&mut conn, message).await?;
        let response = net_protocol::async_read(&mut conn).await?;
        Ok(response)
    }

    pub async fn health_check(&self) -> Result<Health, ClientError> {
        self.request(&Message::HealthCheck).await
    }

    pub async fn queue_version(&self) -> Result<String, ClientError> {
        let QueueVersion { version } = self.request(&Message::QueueVersion).await?;
        Ok(version)
    }

    /// Fails unless the queue runs the same version as this client.
    pub async fn check_version(&self) -> Result<(), ClientError> {
        let queue = self.queue_version().await?;
        if queue != dtq_utils::VERSION {
            return Err(ClientError::VersionMismatch {
                queue,
                client: dtq_utils::VERSION.to_owned(),
            });
        }
        Ok(())
    }

    pub async fn register_worker(
        &self,
        worker_id: &WorkerId,
    ) -> Result<RegisterWorkerResponse, ClientError> {
        self.request(&Message::RegisterWorker {
            worker_id: worker_id.clone(),
        })
        .await
    }

    pub async fn dequeue_bucket(
        &self,
        worker_id: &WorkerId,
        request_id: &RequestId,
    ) -> Result<DequeueBucketResponse, ClientError> {
        self.request(&Message::DequeueBucket {
            worker_id: worker_id.clone(),
            request_id: request_id.clone(),
        })
        .await
    }

    pub async fn push_result(
        &self,
        worker_id: &WorkerId,
        request_id: &RequestId,
        testing_result: TestingResult,
    ) -> Result<PushResultResponse, ClientError> {
        self.request(&Message::PushResult {
            worker_id: worker_id.clone(),
            request_id: request_id.clone(),
            testing_result,
        })
        .await
    }

    pub async fn report_alive(
        &self,
        worker_id: &WorkerId,
        bucket_ids_being_processed: Vec<BucketId>,
    ) -> Result<ReportAliveResponse, ClientError> {
        self.request(&Message::ReportAlive {
            worker_id: worker_id.clone(),
            bucket_ids_being_processed,
        })
        .await
    }

    /// Schedules tests; resending the same request is harmless.
    pub async fn schedule_tests(
        &self,
        request: ScheduleTestsRequest,
    ) -> Result<RequestId, ClientError> {
        match self.request(&Message::ScheduleTests(request)).await? {
            ScheduleTestsResponse::Scheduled { request_id } => Ok(request_id),
            ScheduleTestsResponse::Rejected { reason } => Err(ClientError::ScheduleRejected(reason)),
        }
    }

    pub async fn job_state(&self, job_id: &JobId) -> Result<JobStateResponse, ClientError> {
        self.request(&Message::JobState {
            job_id: job_id.clone(),
        })
        .await
    }

    pub async fn job_results(&self, job_id: &JobId) -> Result<JobResults, ClientError> {
        let response = self
            .request(&Message::JobResults {
                job_id: job_id.clone(),
            })
            .await?;
        match response {
            JobResultsResponse::Results(results) => Ok(results),
            JobResultsResponse::NotFound => Err(ClientError::JobNotFound(job_id.clone())),
        }
    }

    pub async fn delete_job(&self, job_id: &JobId) -> Result<(), ClientError> {
        let response = self
            .request(&Message::DeleteJob {
                job_id: job_id.clone(),
            })
            .await?;
        match response {
            DeleteJobResponse::Acknowledged => Ok(()),
            DeleteJobResponse::NotFound => Err(ClientError::JobNotFound(job_id.clone())),
        }
    }

    pub async fn block_worker(&self, worker_id: &WorkerId) -> Result<(), ClientError> {
        let BlockWorkerResponse::Acknowledged = self
            .request(&Message::BlockWorker {
                worker_id: worker_id.clone(),
            })
            .await?;
        Ok(())
    }

    /// Polls the job's state every `poll_interval` until it is depleted, then fetches its
    /// results. Dropping the returned future stops waiting.
    pub async fn wait_for_job(
        &self,
        job_id: &JobId,
        poll_interval: Duration,
    ) -> Result<JobResults, ClientError> {
        loop {
            match self.job_state(job_id).await? {
                JobStateResponse::Running(state) if state.is_depleted() => break,
                JobStateResponse::Running(RunningQueueState {
                    enqueued_bucket_count,
                    dequeued_bucket_count,
                    ..
                }) => {
                    tracing::debug!(
                        %job_id,
                        enqueued_bucket_count,
                        dequeued_bucket_count,
                        "job still running"
                    );
                }
                JobStateResponse::Deleted => return Err(ClientError::JobDeleted(job_id.clone())),
                JobStateResponse::NotFound => {
                    return Err(ClientError::JobNotFound(job_id.clone()))
                }
                JobStateResponse::Failed { reason } => return Err(ClientError::QueueFailed(reason)),
            }
            tokio::time::sleep(poll_interval).await;
        }

        self.job_results(job_id).await
    }
}
