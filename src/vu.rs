//! The per-iteration API handed to user code.
//!
//! Each iteration receives a fresh [`VuContext`] for the VU running it. The
//! context carries the VU's HTTP client, the run's metrics sink and the
//! shared setup data; everything recorded through it is tagged with the
//! scenario name. Samples from one VU are recorded in the order its
//! iteration produces them.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::RunClock;
use crate::error::{HttpError, IterationError};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::metrics::{names, MetricsRegistry, Sample, Tags};

/// User code run once per scheduled iteration.
///
/// Implemented for any `Fn(VuContext) -> impl Future<Output = Result<(), E>>`
/// where `E: Into<IterationError>`.
#[async_trait]
pub trait Iteration: Send + Sync {
    async fn run(&self, vu: VuContext) -> Result<(), IterationError>;
}

#[async_trait]
impl<F, Fut, E> Iteration for F
where
    F: Fn(VuContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), E>> + Send,
    E: Into<IterationError>,
{
    async fn run(&self, vu: VuContext) -> Result<(), IterationError> {
        (self)(vu).await.map_err(Into::into)
    }
}

/// Where samples go: the run's registry, stamped by the run clock and
/// tagged with a fixed set of tags.
#[derive(Debug, Clone)]
pub struct MetricsSink {
    registry: Arc<MetricsRegistry>,
    clock: RunClock,
    tags: Arc<Tags>,
}

impl MetricsSink {
    pub fn new(registry: Arc<MetricsRegistry>, clock: RunClock, tags: Tags) -> Self {
        Self {
            registry,
            clock,
            tags: Arc::new(tags),
        }
    }

    /// Current offset from the start of the run.
    pub fn now(&self) -> Duration {
        self.clock.elapsed()
    }

    /// Add the sink's tags to `sample` and record it.
    pub fn emit(&self, sample: Sample) {
        let sample = if self.tags.is_empty() {
            sample
        } else {
            sample.with_tags(&self.tags)
        };
        self.registry.record(&sample);
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }
}

/// What an iteration knows about the VU running it.
#[derive(Clone)]
pub struct VuContext {
    vu_id: u64,
    iteration: u64,
    scenario: Arc<str>,
    client: Arc<dyn HttpClient>,
    metrics: MetricsSink,
    setup_data: Option<Arc<serde_json::Value>>,
}

impl VuContext {
    pub fn new(
        vu_id: u64,
        iteration: u64,
        scenario: Arc<str>,
        client: Arc<dyn HttpClient>,
        metrics: MetricsSink,
        setup_data: Option<Arc<serde_json::Value>>,
    ) -> Self {
        Self {
            vu_id,
            iteration,
            scenario,
            client,
            metrics,
            setup_data,
        }
    }

    pub fn vu_id(&self) -> u64 {
        self.vu_id
    }

    /// This VU's iteration number within the scenario, starting at 0.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    /// The value returned by the run's setup function, if any.
    pub fn setup_data(&self) -> Option<&serde_json::Value> {
        self.setup_data.as_deref()
    }

    pub fn metrics(&self) -> &MetricsSink {
        &self.metrics
    }

    /// Issue a request and record `http_reqs`, `http_req_duration`,
    /// `http_req_waiting`, `http_req_receiving`, `http_req_failed` and
    /// `data_received`.
    ///
    /// Transport errors are recorded as failed requests and returned; status
    /// codes >= 400 come back as `Ok` and only count as failed.
    pub async fn request(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let method = request.method.to_string();
        let name = request.tag_name().to_string();
        let result = self.client.request(request).await;
        self.record_http(&method, &name, &result);
        result
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        self.request(HttpRequest::get(url)).await
    }

    /// Issue `requests` concurrently and record each outcome.
    pub async fn batch(&self, requests: Vec<HttpRequest>) -> Vec<Result<HttpResponse, HttpError>> {
        let labels: Vec<(String, String)> = requests
            .iter()
            .map(|r| (r.method.to_string(), r.tag_name().to_string()))
            .collect();
        let results = self.client.batch(requests).await;
        for ((method, name), result) in labels.iter().zip(&results) {
            self.record_http(method, name, result);
        }
        results
    }

    fn record_http(&self, method: &str, name: &str, result: &Result<HttpResponse, HttpError>) {
        let now = self.metrics.now();
        let tag = |sample: Sample| {
            sample
                .with_tag("method", method)
                .with_tag("name", name)
        };
        match result {
            Ok(res) => {
                let status = res.status.to_string();
                let tag = |sample: Sample| tag(sample).with_tag("status", status.as_str());
                self.metrics.emit(tag(Sample::counter(names::HTTP_REQS, 1.0, now)));
                self.metrics.emit(tag(Sample::timing(
                    names::HTTP_REQ_DURATION,
                    res.timings.duration,
                    now,
                )));
                self.metrics.emit(tag(Sample::timing(
                    names::HTTP_REQ_WAITING,
                    res.timings.waiting,
                    now,
                )));
                self.metrics.emit(tag(Sample::timing(
                    names::HTTP_REQ_RECEIVING,
                    res.timings.receiving,
                    now,
                )));
                self.metrics
                    .emit(tag(Sample::rate(names::HTTP_REQ_FAILED, res.is_failure(), now)));
                self.metrics.emit(Sample::counter(
                    names::DATA_RECEIVED,
                    res.body.len() as f64,
                    now,
                ));
            },
            Err(err) => {
                let tag = |sample: Sample| tag(sample).with_tag("error", err.error_category());
                self.metrics.emit(tag(Sample::counter(names::HTTP_REQS, 1.0, now)));
                self.metrics.emit(tag(Sample::rate(names::HTTP_REQ_FAILED, true, now)));
                tracing::debug!(
                    scenario = %self.scenario,
                    vu = self.vu_id,
                    request = name,
                    error = %err,
                    "Request failed"
                );
            },
        }
    }

    /// Record one named check and return `passed`.
    pub fn check(&self, name: &str, passed: bool) -> bool {
        self.metrics.emit(
            Sample::rate(names::CHECKS, passed, self.metrics.now()).with_tag("check", name),
        );
        passed
    }

    /// Evaluate every predicate against `value`, recording one check sample
    /// each. Returns whether all of them passed.
    pub fn check_all<T: ?Sized>(&self, value: &T, checks: &[(&str, fn(&T) -> bool)]) -> bool {
        checks
            .iter()
            .fold(true, |all, (name, predicate)| self.check(name, predicate(value)) && all)
    }

    /// Think time. A plain timer: if the scenario's grace period runs out
    /// meanwhile, the executor drops the whole iteration future.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Record a custom metric sample, tagged like every other sample of
    /// this VU.
    pub fn add_sample(&self, sample: Sample) {
        self.metrics.emit(sample);
    }
}

impl std::fmt::Debug for VuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VuContext")
            .field("vu_id", &self.vu_id)
            .field("iteration", &self.iteration)
            .field("scenario", &self.scenario)
            .finish()
    }
}
