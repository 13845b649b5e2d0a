//! Executors: scheduling strategies that turn a scenario's config into
//! iteration starts over time.
//!
//! Every executor moves through the same states:
//!
//! ```text
//! NotStarted -> Running(stage, stage_start) -> Draining -> Finished
//! ```
//!
//! `Draining` begins at the nominal end of the scenario or when the
//! scenario's stop token fires. No new iterations start from then on; the
//! executor waits up to `gracefulStop` for in-flight iterations and then
//! interrupts whatever is left.
//!
//! The variant is chosen once from [`ExecutorConfig`] by [`build`].

mod arrival_rate;
mod iterations;
mod ramping_vus;

pub use arrival_rate::ArrivalRate;
pub use iterations::{PerVuIterations, SharedIterations};
pub use ramping_vus::RampingVus;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::clock::RunClock;
use crate::config::ExecutorConfig;
use crate::metrics::{names, Sample};
use crate::pool::{VirtualUser, VuReservation};
use crate::stage::{ArrivalSchedule, Ramp};
use crate::vu::{Iteration, MetricsSink, VuContext};

/// Lifecycle of one executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    NotStarted,
    Running {
        stage_index: usize,
        /// Offset of the stage's start from the scenario's start.
        stage_start: Duration,
    },
    Draining,
    Finished,
}

/// How a single iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    Completed,
    /// The iteration function returned an error.
    Failed,
    /// Force-terminated when the grace period ran out; its result is discarded.
    Interrupted,
}

/// Live per-scenario counters.
#[derive(Debug, Default)]
pub struct ScenarioCounters {
    scheduled: AtomicU64,
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    interrupted: AtomicU64,
    dropped: AtomicU64,
}

impl ScenarioCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, scenario: &str, executor: &'static str) -> ScenarioStats {
        ScenarioStats {
            scenario: scenario.to_string(),
            executor,
            scheduled: self.scheduled.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Final counts for one scenario.
///
/// `started + dropped == scheduled` for every executor; only arrival-rate
/// executors ever drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioStats {
    pub scenario: String,
    pub executor: &'static str,
    pub scheduled: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub interrupted: u64,
    pub dropped: u64,
}

/// Everything an executor needs from the run.
pub struct ExecutorContext {
    pub scenario: Arc<str>,
    pub reservation: VuReservation,
    pub iteration: Arc<dyn Iteration>,
    pub metrics: MetricsSink,
    /// Clock whose origin is the scenario's start.
    pub clock: RunClock,
    /// Stops new iterations from starting.
    pub stop: CancellationToken,
    /// Interrupts in-flight iterations.
    pub hard_stop: CancellationToken,
    pub setup_data: Option<Arc<serde_json::Value>>,
    pub counters: Arc<ScenarioCounters>,
    state: watch::Sender<ExecutorState>,
}

impl ExecutorContext {
    pub fn new(
        scenario: impl Into<Arc<str>>,
        reservation: VuReservation,
        iteration: Arc<dyn Iteration>,
        metrics: MetricsSink,
    ) -> Self {
        let (state, _) = watch::channel(ExecutorState::NotStarted);
        Self {
            scenario: scenario.into(),
            reservation,
            iteration,
            metrics,
            clock: RunClock::start(),
            stop: CancellationToken::new(),
            hard_stop: CancellationToken::new(),
            setup_data: None,
            counters: Arc::new(ScenarioCounters::default()),
            state,
        }
    }

    pub fn with_clock(mut self, clock: RunClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_tokens(mut self, stop: CancellationToken, hard_stop: CancellationToken) -> Self {
        self.stop = stop;
        self.hard_stop = hard_stop;
        self
    }

    pub fn with_setup_data(mut self, data: Option<Arc<serde_json::Value>>) -> Self {
        self.setup_data = data;
        self
    }

    /// Watch the executor's state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ExecutorState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ExecutorState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ExecutorState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!(scenario = %self.scenario, from = ?*current, to = ?state, "Executor state");
            *current = state;
            true
        });
    }

    fn enter_stage(&self, stage_index: usize, stage_start: Duration) {
        self.set_state(ExecutorState::Running {
            stage_index,
            stage_start,
        });
    }

    fn record_dropped(&self) {
        ScenarioCounters::bump(&self.counters.scheduled);
        ScenarioCounters::bump(&self.counters.dropped);
        self.metrics.emit(Sample::counter(
            names::DROPPED_ITERATIONS,
            1.0,
            self.metrics.now(),
        ));
    }
}

/// A scheduling strategy for one scenario.
#[async_trait]
pub trait Executor: Send + Sync {
    /// The config name of this executor kind, e.g. `"ramping-vus"`.
    fn kind(&self) -> &'static str;

    /// Time from scenario start until no new iterations start.
    fn nominal_duration(&self) -> Duration;

    fn graceful_stop(&self) -> Duration;

    /// Drive the scenario to completion, leaving the context `Finished`.
    async fn run(&self, ctx: Arc<ExecutorContext>);
}

/// Pick the executor implementation for `config`.
pub fn build(config: &ExecutorConfig) -> Box<dyn Executor> {
    match config {
        ExecutorConfig::ConstantVus(c) => Box::new(RampingVus::new(
            "constant-vus",
            Ramp::flat(c.vus, c.duration),
            c.graceful_stop,
        )),
        ExecutorConfig::RampingVus(c) => Box::new(RampingVus::new(
            "ramping-vus",
            Ramp::new(c.start_vus, c.stages.clone()),
            c.graceful_stop,
        )),
        ExecutorConfig::ConstantArrivalRate(c) => Box::new(ArrivalRate::new(
            "constant-arrival-rate",
            ArrivalSchedule::constant(c.rate, c.duration, c.time_unit),
            c.graceful_stop,
        )),
        ExecutorConfig::RampingArrivalRate(c) => Box::new(ArrivalRate::new(
            "ramping-arrival-rate",
            ArrivalSchedule::new(c.start_rate, c.stages.clone(), c.time_unit),
            c.graceful_stop,
        )),
        ExecutorConfig::SharedIterations(c) => Box::new(SharedIterations::new(
            c.vus,
            c.iterations,
            c.max_duration,
            c.graceful_stop,
        )),
        ExecutorConfig::PerVuIterations(c) => Box::new(PerVuIterations::new(
            c.vus,
            c.iterations,
            c.max_duration,
            c.graceful_stop,
        )),
    }
}

/// Run one iteration on `vu`, racing it against the hard stop.
pub(crate) async fn run_iteration(ctx: &ExecutorContext, vu: &mut VirtualUser) -> IterationOutcome {
    let iteration = vu.next_iteration();
    let vu_ctx = VuContext::new(
        vu.id(),
        iteration,
        Arc::clone(&ctx.scenario),
        vu.client(),
        ctx.metrics.clone(),
        ctx.setup_data.clone(),
    );
    ScenarioCounters::bump(&ctx.counters.started);
    let started_at = Instant::now();

    tokio::select! {
        biased;
        _ = ctx.hard_stop.cancelled() => {
            ScenarioCounters::bump(&ctx.counters.interrupted);
            ctx.metrics.emit(Sample::counter(
                names::INTERRUPTED_ITERATIONS,
                1.0,
                ctx.metrics.now(),
            ));
            IterationOutcome::Interrupted
        }
        result = ctx.iteration.run(vu_ctx) => {
            let now = ctx.metrics.now();
            ctx.metrics.emit(Sample::counter(names::ITERATIONS, 1.0, now));
            ctx.metrics.emit(Sample::timing(names::ITERATION_DURATION, started_at.elapsed(), now));
            match result {
                Ok(()) => {
                    ScenarioCounters::bump(&ctx.counters.completed);
                    IterationOutcome::Completed
                },
                Err(err) => {
                    ScenarioCounters::bump(&ctx.counters.failed);
                    ctx.metrics.emit(Sample::counter(names::ITERATION_ERRORS, 1.0, now));
                    tracing::warn!(
                        scenario = %ctx.scenario,
                        vu = vu.id(),
                        iteration,
                        error = %err,
                        "Iteration failed"
                    );
                    IterationOutcome::Failed
                },
            }
        }
    }
}

/// Hold a VU and run iterations back to back until `token` fires.
pub(crate) async fn vu_loop(ctx: Arc<ExecutorContext>, token: CancellationToken) {
    let Some(mut vu) = ctx.reservation.acquire(&token).await else {
        return;
    };
    while !token.is_cancelled() {
        ScenarioCounters::bump(&ctx.counters.scheduled);
        if run_iteration(&ctx, &mut vu).await == IterationOutcome::Interrupted {
            break;
        }
        tokio::task::yield_now().await;
    }
    ctx.reservation.release(vu);
}

/// Stop new iterations, give in-flight ones `graceful_stop` to finish,
/// then interrupt the rest.
pub(crate) async fn drain(ctx: &ExecutorContext, tracker: &TaskTracker, graceful_stop: Duration) {
    ctx.set_state(ExecutorState::Draining);
    ctx.stop.cancel();
    tracker.close();

    if tokio::time::timeout(graceful_stop, tracker.wait()).await.is_err() {
        tracing::info!(
            scenario = %ctx.scenario,
            in_flight = tracker.len(),
            "Graceful stop expired, interrupting iterations"
        );
        ctx.hard_stop.cancel();
        tracker.wait().await;
    }
    ctx.set_state(ExecutorState::Finished);
}
