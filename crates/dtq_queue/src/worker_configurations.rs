//! The workers a queue admits, and the configuration each receives on registration.

use std::collections::HashMap;

use dtq_utils::net_protocol::workers::{WorkerConfiguration, WorkerId};
use serde_derive::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfigurations {
    /// Configuration for workers not listed in `specific`. If absent, such workers are refused.
    #[serde(default)]
    pub default: Option<WorkerConfiguration>,
    #[serde(default)]
    pub specific: HashMap<WorkerId, WorkerConfiguration>,
}

impl Default for WorkerConfigurations {
    /// Admits any worker with the default configuration.
    fn default() -> Self {
        Self {
            default: Some(WorkerConfiguration::default()),
            specific: HashMap::new(),
        }
    }
}

impl WorkerConfigurations {
    /// Admits only the listed workers.
    pub fn only(specific: impl IntoIterator<Item = (WorkerId, WorkerConfiguration)>) -> Self {
        Self {
            default: None,
            specific: specific.into_iter().collect(),
        }
    }

    /// The configuration of a worker, or [None] if the worker is unknown.
    pub fn lookup(&self, worker_id: &WorkerId) -> Option<&WorkerConfiguration> {
        self.specific.get(worker_id).or(self.default.as_ref())
    }

    pub fn known_worker_count(&self) -> usize {
        self.specific.len()
    }
}
