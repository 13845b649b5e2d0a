//! Scenario orchestration.
//!
//! [`ScenarioRunner`] runs every scenario of a [`RunPlan`] in parallel,
//! each on its own executor, and turns the aggregated metrics into a
//! [`RunResult`]:
//!
//! - One [`VuPool`] and one [`MetricsRegistry`] are created per `run()`;
//!   nothing is shared between runs in the same process.
//! - Each scenario starts at its `startTime` and gets child tokens of the
//!   run's soft stop (no new iterations) and hard stop (interrupt
//!   iterations).
//! - Every evaluation interval the runner records the `vus`/`vus_max`
//!   gauges and checks `abortOnFail` thresholds. A tripped threshold
//!   cancels the soft stop, so no scenario starts another iteration.
//! - Thresholds are evaluated once more when all scenarios have finished.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::clock::RunClock;
use crate::config::RunPlan;
use crate::error::{IterationError, LoadTestError};
use crate::executor::{self, ExecutorContext, ScenarioStats};
#[cfg(feature = "http-client")]
use crate::http::ReqwestClient;
use crate::http::ClientFactory;
use crate::metrics::{names, CheckSummary, MetricSummary, MetricsRegistry, Sample, Tags};
use crate::pool::VuPool;
use crate::threshold::{evaluate, Threshold, ThresholdFailure};
use crate::vu::{Iteration, MetricsSink, VuContext};

/// Default interval between in-run threshold evaluations.
pub const DEFAULT_EVALUATION_INTERVAL: Duration = Duration::from_secs(2);

/// Shorter evaluation intervals are raised to this.
pub const MIN_EVALUATION_INTERVAL: Duration = Duration::from_millis(1);

/// Slack after the latest scenario end before everything is hard-stopped.
const SAFETY_MARGIN: Duration = Duration::from_secs(30);

type SetupFn =
    Box<dyn FnOnce(VuContext) -> BoxFuture<'static, Result<serde_json::Value, IterationError>> + Send>;
type TeardownFn = Box<
    dyn FnOnce(VuContext, Option<serde_json::Value>) -> BoxFuture<'static, Result<(), IterationError>>
        + Send,
>;

/// Why a run ended before its scenarios completed on their own.
#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    /// `abortOnFail` thresholds failed at offset `at`.
    Threshold {
        failures: Vec<ThresholdFailure>,
        at: Duration,
    },
    /// The run's cancellation token fired at offset `at`.
    External { at: Duration },
}

impl AbortReason {
    pub fn at(&self) -> Duration {
        match self {
            Self::Threshold { at, .. } | Self::External { at } => *at,
        }
    }
}

/// The outcome of a run.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Every threshold held and no threshold aborted the run.
    pub passed: bool,
    pub aborted: Option<AbortReason>,
    /// All thresholds of the run, in config order.
    pub thresholds: Vec<Threshold>,
    pub failed_thresholds: Vec<ThresholdFailure>,
    /// Final metric snapshots keyed by name.
    pub metrics: std::collections::BTreeMap<String, MetricSummary>,
    pub checks: Vec<CheckSummary>,
    pub scenarios: Vec<ScenarioStats>,
    pub elapsed: Duration,
}

impl RunResult {
    /// Process exit code: 0 passed, 99 thresholds failed (including an
    /// `abortOnFail` abort), 105 aborted from outside.
    pub fn exit_code(&self) -> i32 {
        match &self.aborted {
            Some(AbortReason::External { .. }) => 105,
            Some(AbortReason::Threshold { .. }) => 99,
            None if self.passed => 0,
            None => 99,
        }
    }

    /// Whether `threshold` is among the failed ones.
    pub fn is_failed(&self, threshold: &Threshold) -> bool {
        self.failed_thresholds
            .iter()
            .any(|f| &f.threshold == threshold)
    }
}

/// Runs a [`RunPlan`] with one iteration function for every scenario.
pub struct ScenarioRunner {
    plan: RunPlan,
    iteration: Arc<dyn Iteration>,
    client_factory: Option<ClientFactory>,
    setup: Option<SetupFn>,
    teardown: Option<TeardownFn>,
    evaluation_interval: Duration,
    cancel: CancellationToken,
}

impl ScenarioRunner {
    pub fn new(plan: RunPlan, iteration: impl Iteration + 'static) -> Self {
        Self::with_shared_iteration(plan, Arc::new(iteration))
    }

    pub fn with_shared_iteration(plan: RunPlan, iteration: Arc<dyn Iteration>) -> Self {
        Self {
            plan,
            iteration,
            client_factory: None,
            setup: None,
            teardown: None,
            evaluation_interval: DEFAULT_EVALUATION_INTERVAL,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `factory` to create each VU's HTTP client instead of `reqwest`.
    pub fn with_client_factory(mut self, factory: ClientFactory) -> Self {
        self.client_factory = Some(factory);
        self
    }

    /// Run `setup` once before any scenario starts. Its value is shared
    /// read-only with every iteration. A setup error fails the run.
    pub fn with_setup<F, Fut>(mut self, setup: F) -> Self
    where
        F: FnOnce(VuContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value, IterationError>> + Send + 'static,
    {
        self.setup = Some(Box::new(move |vu| Box::pin(setup(vu))));
        self
    }

    /// Run `teardown` once after every scenario finished, with the setup
    /// value. Errors are logged.
    pub fn with_teardown<F, Fut>(mut self, teardown: F) -> Self
    where
        F: FnOnce(VuContext, Option<serde_json::Value>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), IterationError>> + Send + 'static,
    {
        self.teardown = Some(Box::new(move |vu, data| Box::pin(teardown(vu, data))));
        self
    }

    /// How often thresholds are evaluated while the run is in progress.
    /// Values below [`MIN_EVALUATION_INTERVAL`] are clamped to it.
    pub fn with_evaluation_interval(mut self, interval: Duration) -> Self {
        self.evaluation_interval = interval.max(MIN_EVALUATION_INTERVAL);
        self
    }

    /// Cancelling `token` stops the run gracefully; the result is marked
    /// as externally aborted.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    fn client_factory(&self) -> Result<ClientFactory, LoadTestError> {
        match &self.client_factory {
            Some(factory) => Ok(Arc::clone(factory)),
            #[cfg(feature = "http-client")]
            None => Ok(ReqwestClient::factory(ReqwestClient::DEFAULT_TIMEOUT)),
            #[cfg(not(feature = "http-client"))]
            None => Err(LoadTestError::validation(
                "No HTTP client configured; enable the `http-client` feature or call with_client_factory",
            )),
        }
    }

    /// Run every scenario to completion and evaluate the thresholds.
    pub async fn run(self) -> Result<RunResult, LoadTestError> {
        let factory = self.client_factory()?;
        let registry = Arc::new(MetricsRegistry::new());
        let pool = VuPool::new(self.plan.total_max_vus(), Arc::clone(&factory));

        let mut reservations = Vec::with_capacity(self.plan.scenarios.len());
        for spec in &self.plan.scenarios {
            let reservation = pool
                .reserve(
                    &spec.name,
                    spec.executor.pre_allocated_vus(),
                    spec.executor.max_vus(),
                )
                .map_err(|e| LoadTestError::validation(e.to_string()))?;
            reservations.push(reservation);
        }
        tracing::info!(
            scenarios = self.plan.scenarios.len(),
            max_vus = self.plan.total_max_vus(),
            thresholds = self.plan.thresholds.len(),
            "Load test starting"
        );

        let setup_data = match self.setup {
            Some(setup) => {
                let vu = lifecycle_context(&registry, &factory, "setup", None);
                let data = setup(vu).await.map_err(|e| LoadTestError::Setup {
                    message: e.to_string(),
                })?;
                Some(Arc::new(data))
            },
            None => None,
        };

        let clock = RunClock::start();
        let stop = CancellationToken::new();
        let hard_stop = CancellationToken::new();
        let tracker = TaskTracker::new();
        let mut contexts = Vec::with_capacity(self.plan.scenarios.len());

        for (spec, reservation) in self.plan.scenarios.iter().zip(reservations) {
            let executor = executor::build(&spec.executor);
            let start_time = spec.executor.start_time();
            let tags = Tags::from([("scenario".to_string(), spec.name.clone())]);
            let ctx = Arc::new(
                ExecutorContext::new(
                    spec.name.as_str(),
                    reservation,
                    Arc::clone(&self.iteration),
                    MetricsSink::new(Arc::clone(&registry), clock, tags),
                )
                .with_clock(clock.shifted(start_time))
                .with_tokens(stop.child_token(), hard_stop.child_token())
                .with_setup_data(setup_data.clone()),
            );
            contexts.push((Arc::clone(&ctx), executor.kind()));

            tracker.spawn(async move {
                tokio::select! {
                    biased;
                    _ = ctx.stop.cancelled() => {
                        tracing::info!(scenario = %ctx.scenario, "Scenario stopped before its start time");
                    }
                    _ = clock.sleep_until(start_time) => executor.run(ctx).await,
                }
            });
        }
        tracker.close();

        let has_abort_thresholds = self.plan.thresholds.iter().any(|t| t.abort_on_fail);
        let deadline = self.plan.latest_end() + SAFETY_MARGIN;
        let mut interval = tokio::time::interval(self.evaluation_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut aborted: Option<AbortReason> = None;

        loop {
            tokio::select! {
                biased;
                _ = tracker.wait() => break,
                _ = self.cancel.cancelled(), if aborted.is_none() => {
                    let at = clock.elapsed();
                    tracing::info!(at = ?at, "Run cancelled, stopping scenarios");
                    aborted = Some(AbortReason::External { at });
                    stop.cancel();
                }
                _ = clock.sleep_until(deadline) => {
                    tracing::warn!(deadline = ?deadline, "Run exceeded its deadline, interrupting iterations");
                    stop.cancel();
                    hard_stop.cancel();
                    tracker.wait().await;
                    break;
                }
                _ = interval.tick() => {
                    record_vu_gauges(&registry, &pool, clock.elapsed());
                    if has_abort_thresholds && aborted.is_none() {
                        let at = clock.elapsed();
                        let triggers = evaluate(&self.plan.thresholds, &registry.snapshot_all(), at)
                            .abort_triggers(at);
                        if !triggers.is_empty() {
                            for failure in &triggers {
                                tracing::info!(%failure, at = ?at, "Threshold crossed, aborting run");
                            }
                            aborted = Some(AbortReason::Threshold { failures: triggers, at });
                            stop.cancel();
                        }
                    }
                }
            }
        }

        let elapsed = clock.elapsed();
        record_vu_gauges(&registry, &pool, elapsed);

        if let Some(teardown) = self.teardown {
            let vu = lifecycle_context(&registry, &factory, "teardown", setup_data.clone());
            let data = setup_data.as_deref().cloned();
            if let Err(err) = teardown(vu, data).await {
                tracing::warn!(error = %err, "Teardown failed");
            }
        }
        let created = pool.teardown();

        let metrics = registry.snapshot_all();
        let evaluation = evaluate(&self.plan.thresholds, &metrics, elapsed);
        let mut failed_thresholds = evaluation.failures;
        if let Some(AbortReason::Threshold { failures, .. }) = &aborted {
            for failure in failures {
                if !failed_thresholds.iter().any(|f| f.threshold == failure.threshold) {
                    failed_thresholds.push(failure.clone());
                }
            }
        }
        let passed = failed_thresholds.is_empty();

        let scenarios: Vec<ScenarioStats> = contexts
            .iter()
            .map(|(ctx, kind)| ctx.counters.snapshot(&ctx.scenario, kind))
            .collect();
        tracing::info!(
            passed,
            elapsed = ?elapsed,
            vus_created = created,
            failed_thresholds = failed_thresholds.len(),
            "Load test finished"
        );

        Ok(RunResult {
            passed,
            aborted,
            thresholds: self.plan.thresholds,
            failed_thresholds,
            metrics,
            checks: registry.checks(),
            scenarios,
            elapsed,
        })
    }
}

/// A VU-like context for setup and teardown, outside any scenario.
fn lifecycle_context(
    registry: &Arc<MetricsRegistry>,
    factory: &ClientFactory,
    phase: &str,
    setup_data: Option<Arc<serde_json::Value>>,
) -> VuContext {
    let tags = Tags::from([("scenario".to_string(), phase.to_string())]);
    VuContext::new(
        0,
        0,
        Arc::from(phase),
        factory(0),
        MetricsSink::new(Arc::clone(registry), RunClock::start(), tags),
        setup_data,
    )
}

fn record_vu_gauges(registry: &MetricsRegistry, pool: &VuPool, now: Duration) {
    let stats = pool.stats();
    registry.record(&Sample::gauge(names::VUS, stats.active as f64, now));
    registry.record(&Sample::gauge(names::VUS_MAX, stats.allocated as f64, now));
}
