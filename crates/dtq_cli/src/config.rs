//! The queue's configuration file.

use std::{
    fs,
    net::{IpAddr, Ipv4Addr},
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use dtq_queue::{
    balancing_queue::{AllowAllWorkers, NothingToDequeueBehavior},
    bucket_queue::DequeuePreference,
    queue::{
        QueueConfig, ReclaimPolicy, DEFAULT_ALLOWED_SILENCE_DURATION,
        DEFAULT_CHECK_AGAIN_INTERVAL, DEFAULT_NEW_WORKER_REGISTRATION_TIME_ALLOWANCE,
        DEFAULT_NUMBER_OF_RETRIES, DEFAULT_STUCK_BUCKETS_POLL_INTERVAL,
    },
    termination::AutomaticTerminationPolicy,
    worker_configurations::WorkerConfigurations,
};
use dtq_utils::{net_opt::ServerOptions, time::SystemClock};
use serde_derive::{Deserialize, Serialize};

/// Durations are written in (possibly fractional) seconds.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct QueueFileConfig {
    pub bind_ip: IpAddr,
    pub public_ip: Option<IpAddr>,
    pub port: u16,
    #[serde(with = "dtq_utils::serde_secs")]
    pub check_again_interval: Duration,
    #[serde(with = "dtq_utils::serde_secs")]
    pub allowed_silence_duration: Duration,
    #[serde(with = "dtq_utils::serde_secs")]
    pub new_worker_registration_time_allowance: Duration,
    #[serde(with = "dtq_utils::serde_secs")]
    pub stuck_buckets_poll_interval: Duration,
    pub reclaim_policy: ReclaimPolicy,
    pub number_of_retries: u32,
    pub dequeue_preference: DequeuePreference,
    pub termination_policy: AutomaticTerminationPolicy,
    pub terminate_when_all_jobs_depleted: bool,
    pub nothing_to_dequeue: NothingToDequeueBehavior,
    pub worker_configurations: WorkerConfigurations,
}

impl Default for QueueFileConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            public_ip: None,
            port: 0,
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
        }
    }
}

impl QueueFileConfig {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let toml_str = fs::read_to_string(path)
            .with_context(|| format!("failed to read queue configuration {}", path.display()))?;
        let config = toml::from_str(&toml_str)
            .with_context(|| format!("invalid queue configuration {}", path.display()))?;
        Ok(config)
    }

    pub fn into_queue_config(self, server_options: ServerOptions) -> QueueConfig {
        let public_ip = self.public_ip.unwrap_or_else(|| match self.bind_ip {
            ip if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            ip => ip,
        });

        QueueConfig {
            public_ip,
            bind_ip: self.bind_ip,
            server_port: self.port,
            server_options,
            check_again_interval: self.check_again_interval,
            allowed_silence_duration: self.allowed_silence_duration,
            new_worker_registration_time_allowance: self.new_worker_registration_time_allowance,
            stuck_buckets_poll_interval: self.stuck_buckets_poll_interval,
            reclaim_policy: self.reclaim_policy,
            number_of_retries: self.number_of_retries,
            dequeue_preference: self.dequeue_preference,
            termination_policy: self.termination_policy,
            terminate_when_all_jobs_depleted: self.terminate_when_all_jobs_depleted,
            nothing_to_dequeue: self.nothing_to_dequeue,
            worker_configurations: self.worker_configurations,
            worker_permissions: Arc::new(AllowAllWorkers),
            clock: SystemClock::shared(),
        }
    }
}
