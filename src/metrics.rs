//! Concurrent metrics aggregation with HdrHistogram-backed percentiles.
//!
//! Every measured event becomes an immutable [`Sample`] that is folded into
//! exactly one [`MetricSummary`] per metric name. The [`MetricsRegistry`]
//! keeps each summary behind its own lock inside a sharded map, so VUs
//! recording different metrics never contend and a snapshot of one metric
//! only briefly blocks writers of that metric.
//!
//! Trend distributions use [`hdrhistogram::Histogram`] with 3 significant
//! figures, which bounds percentile error to 0.1% relative without keeping
//! the samples themselves.

use dashmap::DashMap;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::SampleError;

/// Built-in metric names.
pub mod names {
    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_WAITING: &str = "http_req_waiting";
    pub const HTTP_REQ_RECEIVING: &str = "http_req_receiving";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const DATA_RECEIVED: &str = "data_received";
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const ITERATION_ERRORS: &str = "iteration_errors";
    pub const INTERRUPTED_ITERATIONS: &str = "interrupted_iterations";
    pub const DROPPED_ITERATIONS: &str = "dropped_iterations";
    pub const CHECKS: &str = "checks";
    pub const VUS: &str = "vus";
    pub const VUS_MAX: &str = "vus_max";
}

/// Trend values are milliseconds; the histogram stores microseconds.
const TREND_SCALE: f64 = 1000.0;

/// How a metric aggregates its samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Cumulative sum (`http_reqs`, `iterations`).
    Counter,
    /// Latest value, plus the observed min and max (`vus`).
    Gauge,
    /// Share of non-zero samples (`checks`, `http_req_failed`).
    Rate,
    /// Distribution with percentiles (`http_req_duration`).
    Trend,
}

impl MetricKind {
    /// The kind of a built-in metric, if `name` is one.
    pub fn of_builtin(name: &str) -> Option<Self> {
        use names::*;
        match name {
            HTTP_REQS | DATA_RECEIVED | ITERATIONS | ITERATION_ERRORS
            | INTERRUPTED_ITERATIONS | DROPPED_ITERATIONS => Some(Self::Counter),
            HTTP_REQ_DURATION | HTTP_REQ_WAITING | HTTP_REQ_RECEIVING | ITERATION_DURATION => {
                Some(Self::Trend)
            },
            HTTP_REQ_FAILED | CHECKS => Some(Self::Rate),
            VUS | VUS_MAX => Some(Self::Gauge),
            _ => None,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Rate => "rate",
            Self::Trend => "trend",
        };
        f.write_str(s)
    }
}

pub type Tags = BTreeMap<String, String>;

/// A single measured event.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: String,
    pub kind: MetricKind,
    /// Milliseconds for trends, 0/1 for rates, amounts for counters and gauges.
    pub value: f64,
    pub tags: Tags,
    /// Offset from the start of the run.
    pub timestamp: Duration,
}

impl Sample {
    pub fn new(
        metric: impl Into<String>,
        kind: MetricKind,
        value: f64,
        timestamp: Duration,
    ) -> Self {
        Self {
            metric: metric.into(),
            kind,
            value,
            tags: Tags::new(),
            timestamp,
        }
    }

    pub fn counter(metric: impl Into<String>, value: f64, timestamp: Duration) -> Self {
        Self::new(metric, MetricKind::Counter, value, timestamp)
    }

    pub fn gauge(metric: impl Into<String>, value: f64, timestamp: Duration) -> Self {
        Self::new(metric, MetricKind::Gauge, value, timestamp)
    }

    pub fn rate(metric: impl Into<String>, passed: bool, timestamp: Duration) -> Self {
        Self::new(
            metric,
            MetricKind::Rate,
            if passed { 1.0 } else { 0.0 },
            timestamp,
        )
    }

    /// A trend sample from a duration, stored in milliseconds.
    pub fn timing(metric: impl Into<String>, duration: Duration, timestamp: Duration) -> Self {
        Self::new(
            metric,
            MetricKind::Trend,
            duration.as_secs_f64() * 1000.0,
            timestamp,
        )
    }

    pub fn trend(metric: impl Into<String>, value: f64, timestamp: Duration) -> Self {
        Self::new(metric, MetricKind::Trend, value, timestamp)
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_tags(mut self, tags: &Tags) -> Self {
        self.tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

/// Aggregated state of one metric.
#[derive(Debug, Clone)]
pub struct MetricSummary {
    name: String,
    kind: MetricKind,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    last: f64,
    non_zero: u64,
    histogram: Option<Histogram<u64>>,
}

impl MetricSummary {
    /// An empty summary for a metric of `kind`.
    ///
    /// Trend summaries get a histogram with 3 significant figures and
    /// auto-resize enabled.
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Self {
        let histogram = (kind == MetricKind::Trend).then(|| {
            let mut h = Histogram::<u64>::new(3).expect("3 sigfigs is always valid");
            h.auto(true);
            h
        });
        Self {
            name: name.into(),
            kind,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            last: 0.0,
            non_zero: 0,
            histogram,
        }
    }

    /// Fold one value into the summary.
    ///
    /// Non-finite values, and values the trend histogram cannot hold, leave
    /// the summary unchanged.
    pub fn add(&mut self, value: f64) -> Result<(), SampleError> {
        if !value.is_finite() {
            return Err(SampleError::NotFinite { value });
        }
        if let Some(h) = self.histogram.as_mut() {
            let scaled = (value.max(0.0) * TREND_SCALE).round() as u64;
            h.record(scaled)
                .map_err(|reason| SampleError::Histogram { value, reason })?;
        }
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.last = value;
        if value != 0.0 {
            self.non_zero += 1;
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Number of samples recorded.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Smallest sample, or 0 when empty.
    pub fn min(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.min
        }
    }

    /// Largest sample, or 0 when empty.
    pub fn max(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.max
        }
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Most recent sample (the current value of a gauge).
    pub fn last(&self) -> f64 {
        self.last
    }

    /// Samples that were non-zero, i.e. passes of a rate metric.
    pub fn passes(&self) -> u64 {
        self.non_zero
    }

    pub fn fails(&self) -> u64 {
        self.count - self.non_zero
    }

    /// Share of non-zero samples in `[0, 1]`; 0 when empty.
    pub fn rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.non_zero as f64 / self.count as f64
        }
    }

    /// Approximate percentile `p` (0-100) of a trend. Returns 0 when the
    /// metric is empty or is not a trend.
    pub fn percentile(&self, p: f64) -> f64 {
        match &self.histogram {
            Some(h) if !h.is_empty() => {
                let quantile = (p / 100.0).clamp(0.0, 1.0);
                h.value_at_quantile(quantile) as f64 / TREND_SCALE
            },
            _ => 0.0,
        }
    }

    pub fn median(&self) -> f64 {
        self.percentile(50.0)
    }
}

/// Per-check pass/fail breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckSummary {
    pub name: String,
    pub passes: u64,
    pub fails: u64,
}

/// The run's shared sample sink.
///
/// `record` is safe to call from any number of tasks at once. Each metric
/// lives behind its own [`parking_lot::Mutex`]; the [`DashMap`] only locks a
/// shard while a metric is first registered or looked up.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    metrics: DashMap<String, Arc<Mutex<MetricSummary>>>,
    checks: DashMap<String, Arc<Mutex<(u64, u64)>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `sample` into its metric's summary.
    ///
    /// Built-in metrics always have their built-in kind; a custom metric
    /// keeps the kind of its first sample. Samples of another kind, and
    /// non-finite values, are dropped with a warning.
    pub fn record(&self, sample: &Sample) {
        if !sample.value.is_finite() {
            tracing::warn!(
                metric = %sample.metric,
                value = sample.value,
                "Dropping non-finite sample"
            );
            return;
        }
        let entry = self.entry(&sample.metric, sample.kind);
        let mut summary = entry.lock();
        if summary.kind != sample.kind {
            tracing::warn!(
                metric = %sample.metric,
                expected = %summary.kind,
                got = %sample.kind,
                "Dropping sample with conflicting metric kind"
            );
            return;
        }
        if let Err(err) = summary.add(sample.value) {
            tracing::warn!(metric = %sample.metric, error = %err, "Dropping sample");
            return;
        }
        drop(summary);

        if sample.metric == names::CHECKS {
            if let Some(check) = sample.tags.get("check") {
                let counts = self
                    .checks
                    .entry(check.clone())
                    .or_insert_with(|| Arc::new(Mutex::new((0, 0))))
                    .clone();
                let mut counts = counts.lock();
                if sample.value != 0.0 {
                    counts.0 += 1;
                } else {
                    counts.1 += 1;
                }
            }
        }
    }

    fn entry(&self, name: &str, kind: MetricKind) -> Arc<Mutex<MetricSummary>> {
        if let Some(existing) = self.metrics.get(name) {
            return Arc::clone(existing.value());
        }
        let kind = MetricKind::of_builtin(name).unwrap_or(kind);
        self.metrics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(MetricSummary::new(name, kind))))
            .clone()
    }

    /// Point-in-time copy of one metric's summary.
    pub fn snapshot(&self, name: &str) -> Option<MetricSummary> {
        let entry = self.metrics.get(name).map(|e| Arc::clone(e.value()))?;
        let summary = entry.lock().clone();
        Some(summary)
    }

    /// Point-in-time copies of every metric, keyed by name.
    pub fn snapshot_all(&self) -> BTreeMap<String, MetricSummary> {
        let entries: Vec<(String, Arc<Mutex<MetricSummary>>)> = self
            .metrics
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        entries
            .into_iter()
            .map(|(name, entry)| {
                let summary = entry.lock().clone();
                (name, summary)
            })
            .collect()
    }

    /// Pass/fail counts per check name, sorted by name.
    pub fn checks(&self) -> Vec<CheckSummary> {
        let mut checks: Vec<CheckSummary> = self
            .checks
            .iter()
            .map(|e| {
                let (passes, fails) = *e.value().lock();
                CheckSummary {
                    name: e.key().clone(),
                    passes,
                    fails,
                }
            })
            .collect();
        checks.sort_by(|a, b| a.name.cmp(&b.name));
        checks
    }
}
