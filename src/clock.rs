//! Monotonic run clock.
//!
//! Built on [`tokio::time::Instant`] so tests can pause and advance time
//! deterministically with `#[tokio::test(start_paused = true)]`.

use std::time::Duration;
use tokio::time::Instant;

/// A fixed origin that every offset in a run is measured from.
///
/// Sample timestamps, stage boundaries and arrival-rate start times are all
/// offsets from the origin, so pacing never accumulates drift from the time
/// spent doing work between sleeps.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    origin: Instant,
}

impl RunClock {
    /// Start a clock at the current instant.
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// A clock whose origin lies `offset` after this clock's origin.
    pub fn shifted(&self, offset: Duration) -> Self {
        Self {
            origin: self.origin + offset,
        }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// Time since the origin.
    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    /// The absolute instant at `offset` from the origin.
    pub fn instant_at(&self, offset: Duration) -> Instant {
        self.origin + offset
    }

    /// Offset of `instant` from the origin, saturating at zero.
    pub fn offset_of(&self, instant: Instant) -> Duration {
        instant.saturating_duration_since(self.origin)
    }

    /// Sleep until `offset` from the origin. Returns immediately if it has
    /// already passed.
    pub async fn sleep_until(&self, offset: Duration) {
        tokio::time::sleep_until(self.instant_at(offset)).await;
    }
}
