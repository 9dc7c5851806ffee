//! Deciding when a queue server may shut itself down.

use std::time::{Duration, Instant};

use dtq_utils::time::SharedClock;
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AutomaticTerminationPolicy {
    /// Never terminate on its own.
    #[default]
    StayAlive,
    /// Terminate once nothing happened for `period`.
    AfterBeingIdle {
        #[serde(with = "dtq_utils::serde_secs")]
        period: Duration,
    },
    /// Terminate once `period` passed since start, busy or not.
    AfterFixedPeriod {
        #[serde(with = "dtq_utils::serde_secs")]
        period: Duration,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TerminationError {
    #[error("no worker registered within {0:?}")]
    NoWorkersRegistered(Duration),
}

/// Tracks activity on the queue and applies an [AutomaticTerminationPolicy] to it.
#[derive(Debug)]
pub struct AutomaticTerminationController {
    policy: AutomaticTerminationPolicy,
    clock: SharedClock,
    started_at: Instant,
    last_activity: Mutex<Instant>,
}

impl AutomaticTerminationController {
    pub fn new(policy: AutomaticTerminationPolicy, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            policy,
            clock,
            started_at: now,
            last_activity: Mutex::new(now),
        }
    }

    pub fn policy(&self) -> AutomaticTerminationPolicy {
        self.policy
    }

    /// Restarts the idle period.
    pub fn indicate_activity(&self) {
        *self.last_activity.lock() = self.clock.now();
    }

    pub fn is_termination_allowed(&self) -> bool {
        let now = self.clock.now();
        match self.policy {
            AutomaticTerminationPolicy::StayAlive => false,
            AutomaticTerminationPolicy::AfterBeingIdle { period } => {
                now.saturating_duration_since(*self.last_activity.lock()) >= period
            }
            AutomaticTerminationPolicy::AfterFixedPeriod { period } => {
                now.saturating_duration_since(self.started_at) >= period
            }
        }
    }
}

/// Checks `condition` every `poll_interval` until it holds, or until `deadline` passed.
/// Returns whether the condition held.
///
/// Dropping the returned future stops the polling.
pub async fn wait_until(
    poll_interval: Duration,
    deadline: Option<Duration>,
    mut condition: impl FnMut() -> bool,
) -> bool {
    let give_up_at = deadline.map(|d| tokio::time::Instant::now() + d);
    loop {
        if condition() {
            return true;
        }
        if let Some(give_up_at) = give_up_at {
            if tokio::time::Instant::now() >= give_up_at {
                return false;
            }
        }
        tokio::time::sleep(poll_interval).await;
    }
}
