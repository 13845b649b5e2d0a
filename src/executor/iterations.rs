//! `shared-iterations` and `per-vu-iterations`: the target is a fixed
//! number of iterations, bounded by `maxDuration`.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;

use super::{drain, run_iteration, Executor, ExecutorContext, IterationOutcome, ScenarioCounters};

/// How the iteration budget is split between VUs.
#[derive(Debug, Clone, Copy)]
enum Budget {
    /// One pool of `total` iterations claimed by whichever VU is free.
    Shared { total: u64 },
    /// Every VU runs exactly `each` iterations.
    PerVu { each: u64 },
}

/// Run `vus` VUs over an iteration budget until it is spent or
/// `max_duration` passes, whichever comes first.
async fn run_budget(
    ctx: &Arc<ExecutorContext>,
    kind: &'static str,
    vus: u64,
    budget: Budget,
    max_duration: Duration,
    graceful_stop: Duration,
) {
    let allocated = ctx.reservation.scale_to(vus);
    tracing::info!(
        scenario = %ctx.scenario,
        executor = kind,
        vus,
        allocated,
        ?budget,
        max_duration = ?max_duration,
        "Scenario started"
    );
    ctx.enter_stage(0, Duration::ZERO);

    let claimed = Arc::new(AtomicU64::new(0));
    let tracker = TaskTracker::new();
    for _ in 0..vus {
        let ctx = Arc::clone(ctx);
        let claimed = Arc::clone(&claimed);
        tracker.spawn(async move {
            let token = ctx.stop.clone();
            let Some(mut vu) = ctx.reservation.acquire(&token).await else {
                return;
            };
            let mut own = 0u64;
            while !token.is_cancelled() {
                let has_budget = match budget {
                    Budget::Shared { total } => claimed.fetch_add(1, Ordering::Relaxed) < total,
                    Budget::PerVu { each } => own < each,
                };
                if !has_budget {
                    break;
                }
                own += 1;
                ScenarioCounters::bump(&ctx.counters.scheduled);
                if run_iteration(&ctx, &mut vu).await == IterationOutcome::Interrupted {
                    break;
                }
                tokio::task::yield_now().await;
            }
            ctx.reservation.release(vu);
        });
    }
    tracker.close();

    tokio::select! {
        biased;
        _ = ctx.stop.cancelled() => {}
        _ = tracker.wait() => {}
        _ = ctx.clock.sleep_until(max_duration) => {
            tracing::info!(
                scenario = %ctx.scenario,
                started = ctx.counters.started(),
                "maxDuration reached before all iterations ran"
            );
        }
    }

    drain(ctx, &tracker, graceful_stop).await;
    tracing::info!(scenario = %ctx.scenario, "Scenario finished");
}

/// `iterations` spread over `vus` VUs: a VU claims the next iteration as
/// soon as it finishes its previous one, so faster VUs run more.
#[derive(Debug, Clone)]
pub struct SharedIterations {
    vus: u64,
    iterations: u64,
    max_duration: Duration,
    graceful_stop: Duration,
}

impl SharedIterations {
    pub fn new(vus: u64, iterations: u64, max_duration: Duration, graceful_stop: Duration) -> Self {
        Self {
            vus,
            iterations,
            max_duration,
            graceful_stop,
        }
    }
}

#[async_trait]
impl Executor for SharedIterations {
    fn kind(&self) -> &'static str {
        "shared-iterations"
    }

    fn nominal_duration(&self) -> Duration {
        self.max_duration
    }

    fn graceful_stop(&self) -> Duration {
        self.graceful_stop
    }

    async fn run(&self, ctx: Arc<ExecutorContext>) {
        run_budget(
            &ctx,
            self.kind(),
            self.vus,
            Budget::Shared {
                total: self.iterations,
            },
            self.max_duration,
            self.graceful_stop,
        )
        .await;
    }
}

/// Each of `vus` VUs runs exactly `iterations` iterations.
#[derive(Debug, Clone)]
pub struct PerVuIterations {
    vus: u64,
    iterations: u64,
    max_duration: Duration,
    graceful_stop: Duration,
}

impl PerVuIterations {
    pub fn new(vus: u64, iterations: u64, max_duration: Duration, graceful_stop: Duration) -> Self {
        Self {
            vus,
            iterations,
            max_duration,
            graceful_stop,
        }
    }
}

#[async_trait]
impl Executor for PerVuIterations {
    fn kind(&self) -> &'static str {
        "per-vu-iterations"
    }

    fn nominal_duration(&self) -> Duration {
        self.max_duration
    }

    fn graceful_stop(&self) -> Duration {
        self.graceful_stop
    }

    async fn run(&self, ctx: Arc<ExecutorContext>) {
        run_budget(
            &ctx,
            self.kind(),
            self.vus,
            Budget::PerVu {
                each: self.iterations,
            },
            self.max_duration,
            self.graceful_stop,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, sleeping};
    use super::super::ExecutorState;
    use super::*;
    use crate::metrics::names;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_iterations_are_split_between_vus() {
        let (ctx, registry) = context(sleeping(secs(1)), 3, 3);
        let executor = SharedIterations::new(3, 10, secs(600), secs(30));
        let started = tokio::time::Instant::now();
        executor.run(Arc::clone(&ctx)).await;

        let stats = ctx.counters.snapshot("test", "shared-iterations");
        assert_eq!(stats.started, 10);
        assert_eq!(stats.completed, 10);
        assert_eq!(registry.snapshot(names::ITERATIONS).unwrap().sum(), 10.0);
        // Rounds of 3, 3, 3 and 1.
        assert_eq!(started.elapsed(), secs(4));
        assert_eq!(ctx.state(), ExecutorState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_vu_iterations_run_exactly_n_each() {
        let (ctx, _registry) = context(sleeping(secs(1)), 2, 2);
        let executor = PerVuIterations::new(2, 3, secs(600), secs(30));
        let started = tokio::time::Instant::now();
        executor.run(Arc::clone(&ctx)).await;

        let stats = ctx.counters.snapshot("test", "per-vu-iterations");
        assert_eq!(stats.completed, 6);
        assert_eq!(started.elapsed(), secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_cuts_the_budget_short() {
        let (ctx, _registry) = context(sleeping(secs(1)), 1, 1);
        let executor = SharedIterations::new(1, 100, Duration::from_millis(2_500), Duration::ZERO);
        let started = tokio::time::Instant::now();
        executor.run(Arc::clone(&ctx)).await;

        let stats = ctx.counters.snapshot("test", "shared-iterations");
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.interrupted, 1);
        assert_eq!(started.elapsed(), Duration::from_millis(2_500));
        assert_eq!(ctx.reservation.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_iterations_finishes_immediately() {
        let (ctx, _registry) = context(sleeping(secs(1)), 2, 2);
        let executor = PerVuIterations::new(2, 0, secs(600), secs(30));
        let started = tokio::time::Instant::now();
        executor.run(Arc::clone(&ctx)).await;
        assert_eq!(ctx.counters.started(), 0);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
