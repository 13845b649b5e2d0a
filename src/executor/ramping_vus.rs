//! `constant-vus` and `ramping-vus`: the target is a VU count.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{drain, vu_loop, Executor, ExecutorContext};
use crate::stage::Ramp;

/// How often the desired VU count is re-evaluated within a stage. Stage
/// boundaries are always evaluated exactly.
const RECONCILE_INTERVAL: Duration = Duration::from_millis(100);

/// Keeps `Ramp::vus_at(t)` VUs looping over the iteration function.
///
/// Ramping up spawns a VU task per missing VU. Ramping down cancels the
/// most recently started VUs first (LIFO); each finishes its current
/// iteration before parking its VU. A constant-VU scenario is a ramp with
/// a single flat stage.
#[derive(Debug, Clone)]
pub struct RampingVus {
    kind: &'static str,
    ramp: Ramp,
    graceful_stop: Duration,
}

impl RampingVus {
    pub fn new(kind: &'static str, ramp: Ramp, graceful_stop: Duration) -> Self {
        Self {
            kind,
            ramp,
            graceful_stop,
        }
    }
}

#[async_trait]
impl Executor for RampingVus {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn nominal_duration(&self) -> Duration {
        self.ramp.total_duration()
    }

    fn graceful_stop(&self) -> Duration {
        self.graceful_stop
    }

    async fn run(&self, ctx: Arc<ExecutorContext>) {
        let allocated = ctx.reservation.scale_to(self.ramp.peak());
        tracing::info!(
            scenario = %ctx.scenario,
            executor = self.kind,
            start_vus = self.ramp.start(),
            peak_vus = self.ramp.peak(),
            allocated,
            duration = ?self.ramp.total_duration(),
            "Scenario started"
        );

        let tracker = TaskTracker::new();
        // Most recently started VU last, so ramp-down pops it first.
        let mut vu_tokens: Vec<CancellationToken> = Vec::new();

        loop {
            let elapsed = ctx.clock.elapsed();
            let Some(pos) = self.ramp.position(elapsed) else {
                break;
            };
            ctx.enter_stage(pos.index, pos.stage_start);

            let desired = self.ramp.vus_at(elapsed) as usize;
            if desired != vu_tokens.len() {
                tracing::debug!(
                    scenario = %ctx.scenario,
                    stage = pos.index,
                    from = vu_tokens.len(),
                    to = desired,
                    "Scaling VUs"
                );
            }
            while vu_tokens.len() < desired {
                let token = ctx.stop.child_token();
                tracker.spawn(vu_loop(Arc::clone(&ctx), token.clone()));
                vu_tokens.push(token);
            }
            while vu_tokens.len() > desired {
                if let Some(token) = vu_tokens.pop() {
                    token.cancel();
                }
            }

            let stage_end = pos.stage_end(&self.ramp.stages()[pos.index]);
            let next = (elapsed + RECONCILE_INTERVAL).min(stage_end);
            tokio::select! {
                biased;
                _ = ctx.stop.cancelled() => break,
                _ = ctx.clock.sleep_until(next) => {}
            }
        }

        drain(&ctx, &tracker, self.graceful_stop).await;
        tracing::info!(scenario = %ctx.scenario, "Scenario finished");
    }
}
