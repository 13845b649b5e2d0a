//! k6-style terminal summary of a finished run.
//!
//! [`render_summary`] is a pure function from a [`RunResult`] to a
//! `String`: no I/O, so it is easy to test without a terminal. Colors come
//! from the `colored` crate and follow its global override, which the CLI
//! turns off for `--no-color` or piped output.

use colored::Colorize;
use std::collections::BTreeMap;

use crate::durations::format_duration;
use crate::metrics::{names, MetricKind, MetricSummary};
use crate::runner::{AbortReason, RunResult};
use crate::threshold::Threshold;

/// Width for dotted metric row padding.
const PAD_WIDTH: usize = 40;

/// Render the summary.
///
/// ```text
///      ✓ status is 200
///
///      checks.................................: 100.00% ✓ 40  ✗ 0
///    ✓ http_req_duration......................: avg=12.40ms min=8.10ms med=11.90ms max=40.20ms p(90)=15.00ms p(95)=17.20ms
///        ✓ p(99) < 1500
///      http_reqs..............................: 40  3.98/s
///      vus....................................: 2   min=0 max=2
///
///      default: constant-vus, 40 started, 40 completed
/// ```
pub fn render_summary(result: &RunResult) -> String {
    let mut lines = vec![render_header(result)];

    if let Some(aborted) = &result.aborted {
        lines.push(render_abort(aborted));
        lines.push(String::new());
    }

    if !result.checks.is_empty() {
        for check in &result.checks {
            if check.fails == 0 {
                lines.push(format!("     {} {}", "✓".green(), check.name));
            } else {
                let total = check.passes + check.fails;
                let pct = check.passes as f64 / total as f64 * 100.0;
                lines.push(format!("     {} {}", "✗".red(), check.name));
                lines.push(format!(
                    "      ↳  {pct:.0}% ✓ {} / ✗ {}",
                    check.passes, check.fails
                ));
            }
        }
        lines.push(String::new());
    }

    let mut by_metric: BTreeMap<&str, Vec<&Threshold>> = BTreeMap::new();
    for threshold in &result.thresholds {
        by_metric.entry(&threshold.metric).or_default().push(threshold);
    }

    let elapsed_secs = result.elapsed.as_secs_f64();
    for (name, summary) in &result.metrics {
        let thresholds = by_metric.remove(name.as_str()).unwrap_or_default();
        let marker = if thresholds.is_empty() {
            " ".to_string()
        } else if thresholds.iter().any(|t| result.is_failed(t)) {
            "✗".red().to_string()
        } else {
            "✓".green().to_string()
        };
        let value = format_value(summary, elapsed_secs);
        lines.push(format!("   {marker}{}", format_metric_row(name, &value, PAD_WIDTH)));
        for threshold in thresholds {
            lines.push(format_threshold(result, threshold));
        }
    }

    // Thresholds on metrics that never received a sample.
    for (name, thresholds) in by_metric {
        let value = "no samples".dimmed().to_string();
        lines.push(format!("    {}", format_metric_row(name, &value, PAD_WIDTH)));
        for threshold in thresholds {
            lines.push(format_threshold(result, threshold));
        }
    }

    if !result.scenarios.is_empty() {
        lines.push(String::new());
        for stats in &result.scenarios {
            let mut parts = vec![
                format!("{} started", stats.started),
                format!("{} completed", stats.completed),
            ];
            if stats.failed > 0 {
                parts.push(format!("{} failed", stats.failed).yellow().to_string());
            }
            if stats.interrupted > 0 {
                parts.push(format!("{} interrupted", stats.interrupted).yellow().to_string());
            }
            if stats.dropped > 0 {
                parts.push(format!("{} dropped", stats.dropped).red().to_string());
            }
            lines.push(format!(
                "     {}: {}, {}",
                stats.scenario.bold(),
                stats.executor,
                parts.join(", ")
            ));
        }
    }

    lines.join("\n")
}

fn render_header(result: &RunResult) -> String {
    let status = if result.passed && result.aborted.is_none() {
        "passed".green().bold().to_string()
    } else {
        "failed".red().bold().to_string()
    };
    format!(
        r#"
          /\      |  {}
         /  \     |
    /\  /    \    |  scenarios: {}
   /  \/      \   |  elapsed:   {}
  /    \       \  |  result:    {}
 /      \       \ |
"#,
        "stampede".bold(),
        result.scenarios.len(),
        format_duration(result.elapsed),
        status,
    )
}

fn render_abort(aborted: &AbortReason) -> String {
    match aborted {
        AbortReason::Threshold { failures, at } => {
            let which: Vec<String> = failures
                .iter()
                .map(|f| format!("{} '{}'", f.threshold.metric, f.threshold.source))
                .collect();
            format!(
                "     {} at {}: thresholds crossed: {}",
                "aborted".red().bold(),
                format_duration(*at),
                which.join(", ")
            )
        },
        AbortReason::External { at } => format!(
            "     {} at {}: run was cancelled",
            "aborted".yellow().bold(),
            format_duration(*at)
        ),
    }
}

fn format_threshold(result: &RunResult, threshold: &Threshold) -> String {
    let failure = result
        .failed_thresholds
        .iter()
        .find(|f| &f.threshold == threshold);
    match failure {
        None => format!("       {} {}", "✓".green(), threshold.source),
        Some(f) => match f.actual {
            Some(actual) => format!(
                "       {} {} ({}={actual:.2})",
                "✗".red(),
                threshold.source,
                threshold.expr.statistic
            ),
            None => format!("       {} {}", "✗".red(), threshold.source),
        },
    }
}

/// The value column for one metric, by kind.
fn format_value(summary: &MetricSummary, elapsed_secs: f64) -> String {
    match summary.kind() {
        MetricKind::Trend => format!(
            "avg={} min={} med={} max={} p(90)={} p(95)={}",
            format_ms(summary.avg()),
            format_ms(summary.min()),
            format_ms(summary.median()),
            format_ms(summary.max()),
            format_ms(summary.percentile(90.0)),
            format_ms(summary.percentile(95.0)),
        ),
        MetricKind::Counter => {
            let per_sec = if elapsed_secs > 0.0 {
                summary.sum() / elapsed_secs
            } else {
                0.0
            };
            if summary.name() == names::DATA_RECEIVED {
                format!("{} {}/s", format_bytes(summary.sum()), format_bytes(per_sec))
            } else {
                format!("{:<3} {per_sec:.2}/s", summary.sum())
            }
        },
        MetricKind::Rate => {
            let pct = format!("{:.2}%", summary.rate() * 100.0);
            let colored = if summary.name() == names::HTTP_REQ_FAILED && summary.passes() > 0 {
                pct.red().to_string()
            } else {
                pct
            };
            format!("{colored} ✓ {:<3} ✗ {}", summary.passes(), summary.fails())
        },
        MetricKind::Gauge => format!(
            "{:<3} min={} max={}",
            summary.last(),
            summary.min(),
            summary.max()
        ),
    }
}

/// Milliseconds as `850.12ms`, or seconds above one second (`1.20s`).
fn format_ms(ms: f64) -> String {
    if ms >= 1000.0 {
        format!("{:.2}s", ms / 1000.0)
    } else if ms >= 1.0 || ms == 0.0 {
        format!("{ms:.2}ms")
    } else {
        format!("{:.2}µs", ms * 1000.0)
    }
}

fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 4] = ["B", "kB", "MB", "GB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Format a single metric row with dot-padding.
///
/// Produces: `"  metric_name..................: value_string"`
fn format_metric_row(name: &str, value: &str, pad_width: usize) -> String {
    format!("  {name:.<pad_width$}: {value}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ScenarioStats;
    use crate::metrics::CheckSummary;
    use crate::threshold::ThresholdFailure;
    use std::time::Duration;

    /// Disable colors in tests for deterministic assertions.
    fn setup_no_color() {
        colored::control::set_override(false);
    }

    fn summary(name: &str, kind: MetricKind, values: &[f64]) -> (String, MetricSummary) {
        let mut s = MetricSummary::new(name, kind);
        for v in values {
            s.add(*v).unwrap();
        }
        (name.to_string(), s)
    }

    fn result() -> RunResult {
        let p99 = Threshold::parse(names::HTTP_REQ_DURATION, "p(99) < 1500").unwrap();
        let failed = Threshold::parse(names::HTTP_REQ_FAILED, "rate < 0.01").unwrap();
        RunResult {
            passed: false,
            aborted: None,
            thresholds: vec![p99, failed.clone()],
            failed_thresholds: vec![ThresholdFailure {
                threshold: failed,
                actual: Some(0.25),
            }],
            metrics: BTreeMap::from([
                summary(names::HTTP_REQ_DURATION, MetricKind::Trend, &[100.0, 200.0, 1200.0]),
                summary(names::HTTP_REQ_FAILED, MetricKind::Rate, &[1.0, 0.0, 0.0, 0.0]),
                summary(names::HTTP_REQS, MetricKind::Counter, &[1.0, 1.0, 1.0, 1.0]),
                summary(names::DATA_RECEIVED, MetricKind::Counter, &[1500.0, 2500.0]),
                summary(names::VUS, MetricKind::Gauge, &[0.0, 2.0, 1.0]),
            ]),
            checks: vec![
                CheckSummary {
                    name: "status is 200".to_string(),
                    passes: 3,
                    fails: 1,
                },
                CheckSummary {
                    name: "body not empty".to_string(),
                    passes: 4,
                    fails: 0,
                },
            ],
            scenarios: vec![ScenarioStats {
                scenario: "default".to_string(),
                executor: "constant-arrival-rate",
                scheduled: 10,
                started: 4,
                completed: 4,
                failed: 0,
                interrupted: 0,
                dropped: 6,
            }],
            elapsed: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_render_summary_rows_by_kind() {
        setup_no_color();
        let output = render_summary(&result());
        assert!(output.contains("stampede"));
        assert!(output.contains("avg=500.00ms"), "trend avg missing:\n{output}");
        assert!(output.contains("max=1.20s"));
        assert!(output.contains("25.00% ✓ 1"), "rate row missing:\n{output}");
        assert!(output.contains("2.00/s"), "counter rate missing:\n{output}");
        assert!(output.contains("4.0 kB"), "data_received missing:\n{output}");
        assert!(output.contains("min=0 max=2"), "gauge row missing:\n{output}");
    }

    #[test]
    fn test_render_summary_marks_thresholds() {
        setup_no_color();
        let output = render_summary(&result());
        assert!(output.contains("✓ p(99) < 1500"));
        assert!(output.contains("✗ rate < 0.01 (rate=0.25)"));
        assert!(output.contains("✗  http_req_failed"), "{output}");
        assert!(output.contains("✓  http_req_duration"), "{output}");
    }

    #[test]
    fn test_render_summary_checks_and_scenarios() {
        setup_no_color();
        let output = render_summary(&result());
        assert!(output.contains("✓ body not empty"));
        assert!(output.contains("✗ status is 200"));
        assert!(output.contains("↳  75% ✓ 3 / ✗ 1"));
        assert!(output.contains("default: constant-arrival-rate, 4 started, 4 completed, 6 dropped"));
    }

    #[test]
    fn test_render_abort_reason() {
        setup_no_color();
        let mut result = result();
        result.aborted = Some(AbortReason::External {
            at: Duration::from_millis(1500),
        });
        let output = render_summary(&result);
        assert!(output.contains("aborted at 1.500s: run was cancelled"), "{output}");
    }

    #[test]
    fn test_threshold_without_samples_is_listed() {
        setup_no_color();
        let mut result = result();
        result
            .thresholds
            .push(Threshold::parse("iteration_duration", "avg < 100").unwrap());
        let output = render_summary(&result);
        assert!(output.contains("iteration_duration"));
        assert!(output.contains("no samples"));
    }

    #[test]
    fn test_format_metric_row_dot_padding() {
        let row = format_metric_row("test_metric", "42ms", 30);
        assert!(row.contains("test_metric"));
        assert!(row.contains("42ms"));
        assert!(row.contains("..."));
    }

    #[test]
    fn test_format_ms_units() {
        assert_eq!(format_ms(0.5), "500.00µs");
        assert_eq!(format_ms(12.345), "12.35ms");
        assert_eq!(format_ms(1500.0), "1.50s");
    }
}
