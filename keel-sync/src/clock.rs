//! Wall-clock time that follows the tokio clock.
//!
//! Retry deadlines are stored as UTC timestamps. Deriving "now" from a tokio
//! `Instant` keeps those deadlines consistent with `tokio::time::pause` and
//! `advance` in tests.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.mono.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }

    /// Time left until `deadline`, zero if it has passed.
    pub fn until(&self, deadline: DateTime<Utc>) -> Duration {
        (deadline - self.now()).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn after(&self, delay: Duration) -> DateTime<Utc> {
        self.now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
