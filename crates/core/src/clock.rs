// SPDX-License-Identifier: Apache-2.0

//! Clock abstraction so deadline and idle-time logic is testable.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Source of monotonic and wall-clock time.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Monotonic instant for deadline arithmetic.
    fn monotonic(&self) -> Instant;
    /// Wall-clock milliseconds since the Unix epoch.
    fn epoch_ms(&self) -> u64;
}

/// Real system clock.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn monotonic(&self) -> Instant {
        Instant::now()
    }

    fn epoch_ms(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
    }
}

/// Hand-driven clock for tests. Both time sources advance together.
#[derive(Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

struct ManualState {
    monotonic: Instant,
    epoch_ms: u64,
}

impl ManualClock {
    pub fn starting_at(epoch_ms: u64) -> Self {
        Self { state: Arc::new(Mutex::new(ManualState { monotonic: Instant::now(), epoch_ms })) }
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        state.monotonic += by;
        state.epoch_ms += by.as_millis() as u64;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_at(1_000_000)
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Instant {
        self.state.lock().monotonic
    }

    fn epoch_ms(&self) -> u64 {
        self.state.lock().epoch_ms
    }
}

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;
