//! `constant-arrival-rate` and `ramping-arrival-rate`: the target is a
//! rate of iteration starts, independent of how long iterations take.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;

use super::{drain, run_iteration, Executor, ExecutorContext, ScenarioCounters};
use crate::stage::ArrivalSchedule;

/// Starts iterations at the instants given by an [`ArrivalSchedule`].
///
/// Each start takes a free VU from the reservation (creating one while
/// below `maxVUs`). When none is available the start is dropped and counted
/// in `dropped_iterations`; it is never queued, so the schedule never falls
/// behind to catch up later.
#[derive(Debug, Clone)]
pub struct ArrivalRate {
    kind: &'static str,
    schedule: ArrivalSchedule,
    graceful_stop: Duration,
}

impl ArrivalRate {
    pub fn new(kind: &'static str, schedule: ArrivalSchedule, graceful_stop: Duration) -> Self {
        Self {
            kind,
            schedule,
            graceful_stop,
        }
    }
}

#[async_trait]
impl Executor for ArrivalRate {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn nominal_duration(&self) -> Duration {
        self.schedule.total_duration()
    }

    fn graceful_stop(&self) -> Duration {
        self.graceful_stop
    }

    async fn run(&self, ctx: Arc<ExecutorContext>) {
        tracing::info!(
            scenario = %ctx.scenario,
            executor = self.kind,
            pre_allocated = ctx.reservation.allocated(),
            max_vus = ctx.reservation.max_vus(),
            planned_starts = self.schedule.total_starts(),
            duration = ?self.schedule.total_duration(),
            "Scenario started"
        );

        let tracker = TaskTracker::new();
        let mut n = 0u64;
        let mut stopped = false;

        while let Some(offset) = self.schedule.start_offset(n) {
            tokio::select! {
                biased;
                _ = ctx.stop.cancelled() => {
                    stopped = true;
                    break;
                }
                _ = ctx.clock.sleep_until(offset) => {}
            }
            if let Some(pos) = self.schedule.ramp().position(offset) {
                ctx.enter_stage(pos.index, pos.stage_start);
            }

            match ctx.reservation.try_acquire() {
                Ok(mut vu) => {
                    ScenarioCounters::bump(&ctx.counters.scheduled);
                    let ctx = Arc::clone(&ctx);
                    tracker.spawn(async move {
                        run_iteration(&ctx, &mut vu).await;
                        ctx.reservation.release(vu);
                    });
                },
                Err(err) => {
                    ctx.record_dropped();
                    tracing::debug!(scenario = %ctx.scenario, start = n, error = %err, "Dropped iteration");
                },
            }
            n += 1;
        }

        // In-flight iterations keep running until the nominal end.
        if !stopped {
            tokio::select! {
                biased;
                _ = ctx.stop.cancelled() => {}
                _ = ctx.clock.sleep_until(self.schedule.total_duration()) => {}
            }
        }

        let dropped = ctx.counters.dropped();
        if dropped > 0 {
            tracing::warn!(
                scenario = %ctx.scenario,
                dropped,
                max_vus = ctx.reservation.max_vus(),
                "Not enough VUs to sustain the arrival rate"
            );
        }
        drain(&ctx, &tracker, self.graceful_stop).await;
        tracing::info!(scenario = %ctx.scenario, starts = n, "Scenario finished");
    }
}
