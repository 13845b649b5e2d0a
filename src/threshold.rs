//! Threshold expressions and their evaluation.
//!
//! A threshold is a pass/fail rule over one metric's summary, written as
//! `<statistic> <comparator> <number>`:
//!
//! ```text
//! p(99) < 1500
//! avg<200
//! rate <= 0.01
//! count > 100
//! ```
//!
//! Expressions are parsed once when the config is planned; [`evaluate`]
//! then runs them against snapshots as often as the runner likes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::metrics::{MetricKind, MetricSummary};

/// The value a threshold inspects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statistic {
    Avg,
    Min,
    Max,
    Med,
    /// Percentile in `[0, 100]`.
    Percentile(f64),
    Count,
    Rate,
    Value,
}

impl Statistic {
    /// Whether this statistic exists for metrics of `kind`.
    pub fn applies_to(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Trend => matches!(
                self,
                Self::Avg | Self::Min | Self::Max | Self::Med | Self::Percentile(_) | Self::Count
            ),
            MetricKind::Counter => matches!(self, Self::Count | Self::Rate),
            MetricKind::Rate => matches!(self, Self::Rate),
            MetricKind::Gauge => matches!(self, Self::Value | Self::Min | Self::Max),
        }
    }

    /// Read the statistic from `summary`. Counter rates are per second of
    /// `elapsed`. `None` if it does not apply to the summary's kind.
    pub fn read(&self, summary: &MetricSummary, elapsed: Duration) -> Option<f64> {
        if !self.applies_to(summary.kind()) {
            return None;
        }
        let value = match (self, summary.kind()) {
            (Self::Avg, _) => summary.avg(),
            (Self::Min, _) => summary.min(),
            (Self::Max, _) => summary.max(),
            (Self::Med, _) => summary.median(),
            (Self::Percentile(p), _) => summary.percentile(*p),
            (Self::Count, MetricKind::Counter) => summary.sum(),
            (Self::Count, _) => summary.count() as f64,
            (Self::Rate, MetricKind::Counter) => {
                let secs = elapsed.as_secs_f64();
                if secs > 0.0 {
                    summary.sum() / secs
                } else {
                    0.0
                }
            },
            (Self::Rate, _) => summary.rate(),
            (Self::Value, _) => summary.last(),
        };
        Some(value)
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Med => f.write_str("med"),
            Self::Percentile(p) => write!(f, "p({p})"),
            Self::Count => f.write_str("count"),
            Self::Rate => f.write_str("rate"),
            Self::Value => f.write_str("value"),
        }
    }
}

impl FromStr for Statistic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let stat = match s {
            "avg" => Self::Avg,
            "min" => Self::Min,
            "max" => Self::Max,
            "med" => Self::Med,
            "count" => Self::Count,
            "rate" => Self::Rate,
            "value" => Self::Value,
            _ => {
                let inner = s
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .or_else(|| s.strip_prefix('p'))
                    .ok_or_else(|| format!("unknown statistic '{s}'"))?;
                let p: f64 = inner
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid percentile '{s}'"))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(format!("percentile must be within 0..=100, got {p}"));
                }
                Self::Percentile(p)
            },
        };
        Ok(stat)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparator {
    // Two-character operators first so "<=" is not read as "<".
    const TOKENS: [(&'static str, Comparator); 6] = [
        ("<=", Comparator::Le),
        (">=", Comparator::Ge),
        ("==", Comparator::Eq),
        ("!=", Comparator::Ne),
        ("<", Comparator::Lt),
        (">", Comparator::Gt),
    ];

    pub fn holds(&self, actual: f64, expected: f64) -> bool {
        match self {
            Self::Lt => actual < expected,
            Self::Le => actual <= expected,
            Self::Gt => actual > expected,
            Self::Ge => actual >= expected,
            Self::Eq => actual == expected,
            Self::Ne => actual != expected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

/// A parsed `<statistic> <comparator> <number>` expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdExpr {
    pub statistic: Statistic,
    pub comparator: Comparator,
    pub value: f64,
}

impl FromStr for ThresholdExpr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (at, comparator, token) = Comparator::TOKENS
            .iter()
            .filter_map(|(token, cmp)| s.find(token).map(|at| (at, *cmp, *token)))
            .min_by_key(|(at, _, token)| (*at, std::cmp::Reverse(token.len())))
            .ok_or_else(|| format!("no comparator in '{s}'"))?;

        let statistic: Statistic = s[..at].parse()?;
        let rhs = s[at + token.len()..].trim();
        let value: f64 = rhs
            .parse()
            .map_err(|_| format!("invalid threshold value '{rhs}'"))?;
        Ok(Self {
            statistic,
            comparator,
            value,
        })
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.statistic, self.comparator.as_str(), self.value)
    }
}

/// A pass/fail rule on one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: String,
    /// The expression as written in the config.
    pub source: String,
    pub expr: ThresholdExpr,
    /// Stop the run as soon as this threshold fails.
    pub abort_on_fail: bool,
    /// Ignore failures for abort purposes until this much run time passed.
    pub delay_abort_eval: Option<Duration>,
}

impl Threshold {
    /// Parse `source` as a threshold on `metric`.
    pub fn parse(metric: &str, source: &str) -> Result<Self, String> {
        Ok(Self {
            metric: metric.to_string(),
            source: source.to_string(),
            expr: source.parse()?,
            abort_on_fail: false,
            delay_abort_eval: None,
        })
    }

    pub fn with_abort_on_fail(mut self, abort: bool) -> Self {
        self.abort_on_fail = abort;
        self
    }

    pub fn with_delay_abort_eval(mut self, delay: Option<Duration>) -> Self {
        self.delay_abort_eval = delay;
        self
    }

    /// Whether a failure of this threshold at `elapsed` should abort the run.
    pub fn aborts_at(&self, elapsed: Duration) -> bool {
        self.abort_on_fail && self.delay_abort_eval.map_or(true, |delay| elapsed >= delay)
    }
}

/// A threshold that did not hold.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdFailure {
    pub threshold: Threshold,
    /// The observed statistic, or `None` if it could not be read.
    pub actual: Option<f64>,
}

impl fmt::Display for ThresholdFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.actual {
            Some(actual) => write!(
                f,
                "{}: '{}' failed (actual {} = {actual:.2})",
                self.threshold.metric, self.threshold.source, self.threshold.expr.statistic
            ),
            None => write!(
                f,
                "{}: '{}' failed (statistic not available)",
                self.threshold.metric, self.threshold.source
            ),
        }
    }
}

/// Result of one evaluation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub failures: Vec<ThresholdFailure>,
}

impl Evaluation {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failures that abort the run at `elapsed`.
    pub fn abort_triggers(&self, elapsed: Duration) -> Vec<ThresholdFailure> {
        self.failures
            .iter()
            .filter(|f| f.threshold.aborts_at(elapsed))
            .cloned()
            .collect()
    }
}

/// Evaluate every threshold against `summaries`.
///
/// Thresholds on metrics with no samples are skipped. `elapsed` is the run
/// time used for counter rates.
pub fn evaluate(
    thresholds: &[Threshold],
    summaries: &BTreeMap<String, MetricSummary>,
    elapsed: Duration,
) -> Evaluation {
    let failures = thresholds
        .iter()
        .filter_map(|threshold| {
            let summary = summaries.get(&threshold.metric)?;
            let actual = threshold.expr.statistic.read(summary, elapsed);
            match actual {
                Some(actual) if threshold.expr.comparator.holds(actual, threshold.expr.value) => None,
                Some(actual) => Some(ThresholdFailure {
                    threshold: threshold.clone(),
                    actual: Some(actual),
                }),
                None => {
                    tracing::warn!(
                        metric = %threshold.metric,
                        statistic = %threshold.expr.statistic,
                        kind = %summary.kind(),
                        "Threshold statistic does not apply to metric kind"
                    );
                    Some(ThresholdFailure {
                        threshold: threshold.clone(),
                        actual: None,
                    })
                },
            }
        })
        .collect();
    Evaluation { failures }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{names, MetricSummary};

    fn trend(values: &[f64]) -> BTreeMap<String, MetricSummary> {
        let mut summary = MetricSummary::new(names::HTTP_REQ_DURATION, MetricKind::Trend);
        for v in values {
            summary.add(*v).unwrap();
        }
        BTreeMap::from([(names::HTTP_REQ_DURATION.to_string(), summary)])
    }

    #[test]
    fn test_parse_percentile_expression() {
        let expr: ThresholdExpr = "p(99) < 1500".parse().unwrap();
        assert_eq!(expr.statistic, Statistic::Percentile(99.0));
        assert_eq!(expr.comparator, Comparator::Lt);
        assert_eq!(expr.value, 1500.0);

        let expr: ThresholdExpr = "p(99.9)<=250.5".parse().unwrap();
        assert_eq!(expr.statistic, Statistic::Percentile(99.9));
        assert_eq!(expr.comparator, Comparator::Le);
        assert_eq!(expr.value, 250.5);
    }

    #[test]
    fn test_parse_named_statistics() {
        let cases = [
            ("avg<200", Statistic::Avg, Comparator::Lt),
            ("med >= 10", Statistic::Med, Comparator::Ge),
            ("rate<0.01", Statistic::Rate, Comparator::Lt),
            ("count>100", Statistic::Count, Comparator::Gt),
            ("max == 5", Statistic::Max, Comparator::Eq),
            ("value != 0", Statistic::Value, Comparator::Ne),
            ("p95 < 300", Statistic::Percentile(95.0), Comparator::Lt),
        ];
        for (src, stat, cmp) in cases {
            let expr: ThresholdExpr = src.parse().unwrap();
            assert_eq!(expr.statistic, stat, "{src}");
            assert_eq!(expr.comparator, cmp, "{src}");
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("p(99) 1500".parse::<ThresholdExpr>().is_err());
        assert!("mean < 10".parse::<ThresholdExpr>().is_err());
        assert!("p(101) < 10".parse::<ThresholdExpr>().is_err());
        assert!("avg < fast".parse::<ThresholdExpr>().is_err());
        assert!("< 10".parse::<ThresholdExpr>().is_err());
    }

    #[test]
    fn test_p99_1400_passes_and_1600_fails() {
        let threshold = Threshold::parse(names::HTTP_REQ_DURATION, "p(99)<1500").unwrap();

        let mut passing = vec![200.0; 98];
        passing.extend([1400.0, 1400.0]);
        let eval = evaluate(&[threshold.clone()], &trend(&passing), Duration::from_secs(10));
        assert!(eval.passed());

        let mut failing = vec![200.0; 98];
        failing.extend([1600.0, 1600.0]);
        let eval = evaluate(&[threshold], &trend(&failing), Duration::from_secs(10));
        assert!(!eval.passed());
        let actual = eval.failures[0].actual.unwrap();
        assert!((actual - 1600.0).abs() < 1600.0 * 0.001);
    }

    #[test]
    fn test_missing_metric_is_not_evaluated() {
        let threshold = Threshold::parse("checks", "rate>0.99").unwrap();
        let eval = evaluate(&[threshold], &BTreeMap::new(), Duration::from_secs(1));
        assert!(eval.passed());
    }

    #[test]
    fn test_inapplicable_statistic_fails() {
        let mut summary = MetricSummary::new("logins", MetricKind::Rate);
        summary.add(1.0).unwrap();
        let summaries = BTreeMap::from([("logins".to_string(), summary)]);
        let threshold = Threshold::parse("logins", "p(95)<10").unwrap();
        let eval = evaluate(&[threshold], &summaries, Duration::from_secs(1));
        assert_eq!(eval.failures.len(), 1);
        assert!(eval.failures[0].actual.is_none());
    }

    #[test]
    fn test_counter_rate_is_per_second() {
        let mut summary = MetricSummary::new(names::HTTP_REQS, MetricKind::Counter);
        for _ in 0..50 {
            summary.add(1.0).unwrap();
        }
        let summaries = BTreeMap::from([(names::HTTP_REQS.to_string(), summary)]);
        let ok = Threshold::parse(names::HTTP_REQS, "rate>=5").unwrap();
        let too_slow = Threshold::parse(names::HTTP_REQS, "rate>6").unwrap();
        let eval = evaluate(&[ok, too_slow], &summaries, Duration::from_secs(10));
        assert_eq!(eval.failures.len(), 1);
        assert_eq!(eval.failures[0].threshold.source, "rate>6");
    }

    #[test]
    fn test_abort_triggers_respect_delay() {
        let threshold = Threshold::parse(names::HTTP_REQ_DURATION, "avg<100")
            .unwrap()
            .with_abort_on_fail(true)
            .with_delay_abort_eval(Some(Duration::from_secs(10)));
        let eval = evaluate(&[threshold], &trend(&[500.0]), Duration::from_secs(5));
        assert!(!eval.passed());
        assert!(eval.abort_triggers(Duration::from_secs(5)).is_empty());
        assert_eq!(eval.abort_triggers(Duration::from_secs(10)).len(), 1);
    }

    #[test]
    fn test_statistic_applicability() {
        assert!(Statistic::Percentile(90.0).applies_to(MetricKind::Trend));
        assert!(!Statistic::Percentile(90.0).applies_to(MetricKind::Counter));
        assert!(Statistic::Rate.applies_to(MetricKind::Rate));
        assert!(!Statistic::Avg.applies_to(MetricKind::Rate));
        assert!(Statistic::Value.applies_to(MetricKind::Gauge));
    }
}
