//! Runs a queue server from start until it decides, or is told, to stop.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::queue::{Queue, QueueConfig, QueueError, QueueState};
use crate::termination::{wait_until, TerminationError};

#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    pub poll_interval: Duration,
    pub new_worker_registration_time_allowance: Duration,
    pub terminate_when_all_jobs_depleted: bool,
}

impl From<&QueueConfig> for RunnerConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            poll_interval: config.check_again_interval,
            new_worker_registration_time_allowance: config.new_worker_registration_time_allowance,
            terminate_when_all_jobs_depleted: config.terminate_when_all_jobs_depleted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The automatic termination policy allowed it.
    PolicyAllowed,
    /// Every scheduled job ran to completion.
    AllJobsDepleted,
}

/// Watches a queue until it may terminate.
///
/// If no worker registers within the allowance, all jobs are failed; the queue stays up to
/// tell submitters so until its termination policy lets it go, and the failure is returned.
pub async fn run_until_terminated(
    state: &QueueState,
    config: &RunnerConfig,
) -> Result<TerminationReason, TerminationError> {
    let allowance = config.new_worker_registration_time_allowance;
    let any_worker_registered = wait_until(config.poll_interval, Some(allowance), || {
        state.aliveness().has_any_worker_ever_registered()
    })
    .await;

    if !any_worker_registered {
        let error = TerminationError::NoWorkersRegistered(allowance);
        state.balancing().fail_all(error.to_string());
        wait_until(config.poll_interval, None, || {
            state.termination().is_termination_allowed()
        })
        .await;
        return Err(error);
    }

    let all_jobs_depleted = || {
        config.terminate_when_all_jobs_depleted
            && state.balancing().has_any_job_ever_been_scheduled()
            && state.balancing().is_depleted()
    };

    let mut reason = TerminationReason::PolicyAllowed;
    wait_until(config.poll_interval, None, || {
        if state.termination().is_termination_allowed() {
            reason = TerminationReason::PolicyAllowed;
            true
        } else if all_jobs_depleted() {
            reason = TerminationReason::AllJobsDepleted;
            true
        } else {
            false
        }
    })
    .await;

    tracing::info!(?reason, "queue may terminate");
    Ok(reason)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Terminated(TerminationReason),
    Interrupted,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{0}")]
    Queue(#[from] QueueError),

    #[error("{0}")]
    Termination(#[from] TerminationError),
}

/// A started queue server, along with the rules for stopping it.
pub struct QueueServerRunner {
    queue: Queue,
    config: RunnerConfig,
}

impl QueueServerRunner {
    pub async fn start(config: QueueConfig) -> Result<Self, QueueError> {
        let runner_config = RunnerConfig::from(&config);
        let queue = Queue::start(config).await?;
        Ok(Self {
            queue,
            config: runner_config,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.queue.server_addr()
    }

    pub fn state(&self) -> &QueueState {
        self.queue.state()
    }

    /// Serves until termination is allowed or `interrupted` resolves, then shuts the queue down.
    pub async fn run(
        mut self,
        interrupted: impl Future<Output = ()>,
    ) -> Result<RunOutcome, RunnerError> {
        let outcome = tokio::select! {
            terminated = run_until_terminated(self.queue.state(), &self.config) => {
                terminated.map(RunOutcome::Terminated)
            }
            _ = interrupted => {
                tracing::info!("queue interrupted");
                Ok(RunOutcome::Interrupted)
            }
        };

        self.queue.shutdown().await?;
        Ok(outcome?)
    }
}
