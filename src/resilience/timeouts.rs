//! Hierarchical timeout budgets.
//!
//! A dispatch has one overall deadline. Each attempt gets whatever is left
//! of it, and the replica is told a slightly smaller slice so that its own
//! per-tool timeouts fire before the gateway gives up on the stream.

use std::time::Duration;

use tokio::time::Instant;

/// Smallest budget ever handed to a replica.
const MIN_REPLICA_BUDGET: Duration = Duration::from_secs(1);

/// Overall deadline for one dispatch.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            at: started + budget,
            budget,
        }
    }

    /// The overall budget this deadline was created with.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.started)
    }

    /// Budget to advertise to the replica for the innermost timeouts.
    pub fn replica_budget(&self, margin: Duration) -> Duration {
        self.remaining()
            .saturating_sub(margin)
            .max(MIN_REPLICA_BUDGET)
    }
}
