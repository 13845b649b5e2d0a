//! Load test configuration.
//!
//! Configs are TOML files (or JSON, by extension) using k6's option names.
//! Every struct rejects unknown keys, so a misspelled option fails the load
//! instead of being silently ignored.
//!
//! # Example TOML
//!
//! ```toml
//! [scenarios.browse]
//! executor = "ramping-vus"
//! startVUs = 0
//! stages = [
//!   { duration = "40s", target = 4 },
//!   { duration = "1m20s", target = 10 },
//!   { duration = "20s", target = 0 },
//! ]
//!
//! [scenarios.api]
//! executor = "constant-arrival-rate"
//! rate = 50
//! timeUnit = "1s"
//! duration = "2m"
//! preAllocatedVUs = 10
//! maxVUs = 50
//! startTime = "30s"
//!
//! [thresholds]
//! http_req_duration = ["p(99) < 1500"]
//! http_req_failed = [{ threshold = "rate < 0.01", abortOnFail = true }]
//! ```
//!
//! Instead of `scenarios`, the shortcut options `vus`, `duration`,
//! `iterations` and `stages` describe a single scenario named `default`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::LoadTestError;
use crate::metrics::MetricKind;
use crate::script::ScriptConfig;
use crate::stage::{Ramp, Stage};
use crate::threshold::Threshold;

/// Name of the scenario built from shortcut options.
pub const DEFAULT_SCENARIO: &str = "default";

fn default_graceful_stop() -> Duration {
    Duration::from_secs(30)
}

fn default_time_unit() -> Duration {
    Duration::from_secs(1)
}

fn default_max_duration() -> Duration {
    Duration::from_secs(600)
}

fn default_one() -> u64 {
    1
}

/// Top-level options.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoadTestConfig {
    /// Shortcut: number of VUs for the `default` scenario.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vus: Option<u64>,
    /// Shortcut: run `vus` VUs for this long (`constant-vus`).
    #[serde(
        default,
        with = "crate::durations::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration: Option<Duration>,
    /// Shortcut: total iterations shared by `vus` VUs (`shared-iterations`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u64>,
    /// Shortcut: a `ramping-vus` profile starting from `vus`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<Stage>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scenarios: BTreeMap<String, ExecutorConfig>,
    /// Metric name to one or more threshold expressions.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub thresholds: BTreeMap<String, ThresholdList>,
    /// Declarative requests run by each iteration when no compiled
    /// iteration function is supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptConfig>,
}

/// One scenario's executor and its parameters, tagged by `executor`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "executor", rename_all = "kebab-case")]
pub enum ExecutorConfig {
    SharedIterations(SharedIterationsConfig),
    PerVuIterations(PerVuIterationsConfig),
    ConstantVus(ConstantVusConfig),
    RampingVus(RampingVusConfig),
    ConstantArrivalRate(ConstantArrivalRateConfig),
    RampingArrivalRate(RampingArrivalRateConfig),
}

/// `iterations` shared between `vus` VUs.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SharedIterationsConfig {
    #[serde(default = "default_one")]
    pub vus: u64,
    #[serde(default = "default_one")]
    pub iterations: u64,
    #[serde(
        default = "default_max_duration",
        with = "crate::durations",
        alias = "maxDuration"
    )]
    pub max_duration: Duration,
    #[serde(
        default = "default_graceful_stop",
        with = "crate::durations",
        alias = "gracefulStop"
    )]
    pub graceful_stop: Duration,
    #[serde(default, with = "crate::durations", alias = "startTime")]
    pub start_time: Duration,
}

/// `iterations` run by each of `vus` VUs.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PerVuIterationsConfig {
    #[serde(default = "default_one")]
    pub vus: u64,
    #[serde(default = "default_one")]
    pub iterations: u64,
    #[serde(
        default = "default_max_duration",
        with = "crate::durations",
        alias = "maxDuration"
    )]
    pub max_duration: Duration,
    #[serde(
        default = "default_graceful_stop",
        with = "crate::durations",
        alias = "gracefulStop"
    )]
    pub graceful_stop: Duration,
    #[serde(default, with = "crate::durations", alias = "startTime")]
    pub start_time: Duration,
}

/// `vus` VUs looping for `duration`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConstantVusConfig {
    #[serde(default = "default_one")]
    pub vus: u64,
    #[serde(with = "crate::durations")]
    pub duration: Duration,
    #[serde(
        default = "default_graceful_stop",
        with = "crate::durations",
        alias = "gracefulStop"
    )]
    pub graceful_stop: Duration,
    #[serde(default, with = "crate::durations", alias = "startTime")]
    pub start_time: Duration,
}

/// A VU count ramped through `stages`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RampingVusConfig {
    #[serde(default = "default_one", alias = "startVUs")]
    pub start_vus: u64,
    pub stages: Vec<Stage>,
    #[serde(
        default = "default_graceful_stop",
        with = "crate::durations",
        alias = "gracefulStop"
    )]
    pub graceful_stop: Duration,
    #[serde(default, with = "crate::durations", alias = "startTime")]
    pub start_time: Duration,
}

/// `rate` iteration starts per `time_unit` for `duration`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConstantArrivalRateConfig {
    pub rate: u64,
    #[serde(
        default = "default_time_unit",
        with = "crate::durations",
        alias = "timeUnit"
    )]
    pub time_unit: Duration,
    #[serde(with = "crate::durations")]
    pub duration: Duration,
    #[serde(alias = "preAllocatedVUs")]
    pub pre_allocated_vus: u64,
    /// Defaults to `pre_allocated_vus`.
    #[serde(default, alias = "maxVUs", skip_serializing_if = "Option::is_none")]
    pub max_vus: Option<u64>,
    #[serde(
        default = "default_graceful_stop",
        with = "crate::durations",
        alias = "gracefulStop"
    )]
    pub graceful_stop: Duration,
    #[serde(default, with = "crate::durations", alias = "startTime")]
    pub start_time: Duration,
}

/// An iteration start rate ramped through `stages`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RampingArrivalRateConfig {
    #[serde(default, alias = "startRate")]
    pub start_rate: u64,
    #[serde(
        default = "default_time_unit",
        with = "crate::durations",
        alias = "timeUnit"
    )]
    pub time_unit: Duration,
    pub stages: Vec<Stage>,
    #[serde(alias = "preAllocatedVUs")]
    pub pre_allocated_vus: u64,
    /// Defaults to `pre_allocated_vus`.
    #[serde(default, alias = "maxVUs", skip_serializing_if = "Option::is_none")]
    pub max_vus: Option<u64>,
    #[serde(
        default = "default_graceful_stop",
        with = "crate::durations",
        alias = "gracefulStop"
    )]
    pub graceful_stop: Duration,
    #[serde(default, with = "crate::durations", alias = "startTime")]
    pub start_time: Duration,
}

/// One expression or a list of them.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ThresholdList {
    One(ThresholdEntry),
    Many(Vec<ThresholdEntry>),
}

impl ThresholdList {
    pub fn entries(&self) -> &[ThresholdEntry] {
        match self {
            Self::One(entry) => std::slice::from_ref(entry),
            Self::Many(entries) => entries,
        }
    }
}

/// `"p(99) < 1500"` or `{ threshold = "...", abortOnFail = true }`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ThresholdEntry {
    Expr(String),
    Detailed(DetailedThreshold),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DetailedThreshold {
    pub threshold: String,
    #[serde(default, alias = "abortOnFail")]
    pub abort_on_fail: bool,
    #[serde(
        default,
        with = "crate::durations::option",
        alias = "delayAbortEval",
        skip_serializing_if = "Option::is_none"
    )]
    pub delay_abort_eval: Option<Duration>,
}

/// A named scenario ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioSpec {
    pub name: String,
    pub executor: ExecutorConfig,
}

/// Validated scenarios and parsed thresholds.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunPlan {
    pub scenarios: Vec<ScenarioSpec>,
    pub thresholds: Vec<Threshold>,
}

impl RunPlan {
    /// Sum of every scenario's `maxVUs`: the capacity of the run's pool.
    pub fn total_max_vus(&self) -> u64 {
        self.scenarios.iter().map(|s| s.executor.max_vus()).sum()
    }

    /// Latest offset from run start at which any scenario may still be
    /// running, grace period included.
    pub fn latest_end(&self) -> Duration {
        self.scenarios
            .iter()
            .map(|s| s.executor.start_time() + s.executor.nominal_duration() + s.executor.graceful_stop())
            .max()
            .unwrap_or_default()
    }
}

impl LoadTestConfig {
    /// Parse and validate a TOML config.
    pub fn from_toml(content: &str) -> Result<Self, LoadTestError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON config (k6 `options` object).
    pub fn from_json(content: &str) -> Result<Self, LoadTestError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file. `.json` files are read as JSON, anything else
    /// as TOML.
    pub fn load(path: &Path) -> Result<Self, LoadTestError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoadTestError::ConfigIo {
            source,
            path: path.display().to_string(),
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        }
    }

    /// Check the config without keeping the plan.
    pub fn validate(&self) -> Result<(), LoadTestError> {
        if let Some(script) = &self.script {
            script.validate()?;
        }
        self.plan().map(|_| ())
    }

    /// Apply command-line overrides of the shortcut options.
    ///
    /// A `duration` override replaces every other way of describing the
    /// run (`stages`, `iterations`, `scenarios`) with a `constant-vus`
    /// scenario.
    pub fn apply_overrides(&mut self, vus: Option<u64>, duration: Option<Duration>) {
        if let Some(vus) = vus {
            self.vus = Some(vus);
        }
        if let Some(duration) = duration {
            self.duration = Some(duration);
            self.stages.clear();
            self.iterations = None;
            self.scenarios.clear();
        }
    }

    /// Resolve shortcut options, validate every scenario and parse every
    /// threshold.
    pub fn plan(&self) -> Result<RunPlan, LoadTestError> {
        let scenarios = self.resolve_scenarios()?;
        for spec in &scenarios {
            spec.executor.validate(&spec.name)?;
        }
        let thresholds = self.parse_thresholds()?;
        Ok(RunPlan {
            scenarios,
            thresholds,
        })
    }

    fn has_shortcuts(&self) -> bool {
        self.vus.is_some() || self.duration.is_some() || self.iterations.is_some() || !self.stages.is_empty()
    }

    fn resolve_scenarios(&self) -> Result<Vec<ScenarioSpec>, LoadTestError> {
        if !self.scenarios.is_empty() {
            if self.has_shortcuts() {
                return Err(LoadTestError::validation(
                    "`scenarios` cannot be combined with the `vus`, `duration`, `iterations` or `stages` shortcuts",
                ));
            }
            return Ok(self
                .scenarios
                .iter()
                .map(|(name, executor)| ScenarioSpec {
                    name: name.clone(),
                    executor: executor.clone(),
                })
                .collect());
        }

        let executor = if !self.stages.is_empty() {
            if self.duration.is_some() || self.iterations.is_some() {
                return Err(LoadTestError::validation(
                    "`stages` cannot be combined with `duration` or `iterations`",
                ));
            }
            ExecutorConfig::RampingVus(RampingVusConfig {
                start_vus: self.vus.unwrap_or(0),
                stages: self.stages.clone(),
                graceful_stop: default_graceful_stop(),
                start_time: Duration::ZERO,
            })
        } else if let Some(iterations) = self.iterations {
            ExecutorConfig::SharedIterations(SharedIterationsConfig {
                vus: self.vus.unwrap_or(1),
                iterations,
                max_duration: self.duration.unwrap_or_else(default_max_duration),
                graceful_stop: default_graceful_stop(),
                start_time: Duration::ZERO,
            })
        } else if let Some(duration) = self.duration {
            ExecutorConfig::ConstantVus(ConstantVusConfig {
                vus: self.vus.unwrap_or(1),
                duration,
                graceful_stop: default_graceful_stop(),
                start_time: Duration::ZERO,
            })
        } else {
            ExecutorConfig::PerVuIterations(PerVuIterationsConfig {
                vus: self.vus.unwrap_or(1),
                iterations: 1,
                max_duration: default_max_duration(),
                graceful_stop: default_graceful_stop(),
                start_time: Duration::ZERO,
            })
        };
        Ok(vec![ScenarioSpec {
            name: DEFAULT_SCENARIO.to_string(),
            executor,
        }])
    }

    fn parse_thresholds(&self) -> Result<Vec<Threshold>, LoadTestError> {
        let mut parsed = Vec::new();
        for (metric, list) in &self.thresholds {
            for entry in list.entries() {
                let (source, abort_on_fail, delay) = match entry {
                    ThresholdEntry::Expr(source) => (source.as_str(), false, None),
                    ThresholdEntry::Detailed(d) => (d.threshold.as_str(), d.abort_on_fail, d.delay_abort_eval),
                };
                let invalid = |reason: String| LoadTestError::InvalidThreshold {
                    metric: metric.clone(),
                    expression: source.to_string(),
                    reason,
                };
                let threshold = Threshold::parse(metric, source)
                    .map_err(invalid)?
                    .with_abort_on_fail(abort_on_fail)
                    .with_delay_abort_eval(delay);

                if let Some(kind) = MetricKind::of_builtin(metric) {
                    let statistic = threshold.expr.statistic;
                    if !statistic.applies_to(kind) {
                        return Err(invalid(format!(
                            "statistic '{statistic}' does not apply to {kind} metrics"
                        )));
                    }
                }
                parsed.push(threshold);
            }
        }
        Ok(parsed)
    }
}

fn check_stages(scenario: &str, stages: &[Stage]) -> Result<(), LoadTestError> {
    if stages.is_empty() {
        return Err(LoadTestError::validation(format!(
            "Scenario '{scenario}' needs at least one stage"
        )));
    }
    if let Some(i) = stages.iter().position(|s| s.duration.is_zero()) {
        return Err(LoadTestError::validation(format!(
            "Scenario '{scenario}': stage {} has a zero duration; each stage must have a positive duration",
            i + 1
        )));
    }
    Ok(())
}

fn check_positive(scenario: &str, field: &str, value: u64) -> Result<(), LoadTestError> {
    if value == 0 {
        return Err(LoadTestError::validation(format!(
            "Scenario '{scenario}': `{field}` must be greater than 0"
        )));
    }
    Ok(())
}

fn check_nonzero_duration(scenario: &str, field: &str, value: Duration) -> Result<(), LoadTestError> {
    if value.is_zero() {
        return Err(LoadTestError::validation(format!(
            "Scenario '{scenario}': `{field}` must be greater than 0s"
        )));
    }
    Ok(())
}

fn check_vu_caps(scenario: &str, pre_allocated: u64, max_vus: Option<u64>) -> Result<(), LoadTestError> {
    if let Some(max) = max_vus {
        if max < pre_allocated {
            return Err(LoadTestError::validation(format!(
                "Scenario '{scenario}': maxVUs ({max}) is below preAllocatedVUs ({pre_allocated})"
            )));
        }
    }
    if max_vus.unwrap_or(pre_allocated) == 0 {
        return Err(LoadTestError::validation(format!(
            "Scenario '{scenario}': an arrival-rate scenario needs at least one VU"
        )));
    }
    Ok(())
}

impl ExecutorConfig {
    /// The `executor` tag value.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::SharedIterations(_) => "shared-iterations",
            Self::PerVuIterations(_) => "per-vu-iterations",
            Self::ConstantVus(_) => "constant-vus",
            Self::RampingVus(_) => "ramping-vus",
            Self::ConstantArrivalRate(_) => "constant-arrival-rate",
            Self::RampingArrivalRate(_) => "ramping-arrival-rate",
        }
    }

    /// Check the parameters of the scenario named `scenario`.
    pub fn validate(&self, scenario: &str) -> Result<(), LoadTestError> {
        if scenario.trim().is_empty() {
            return Err(LoadTestError::validation("Scenario names must not be empty"));
        }
        match self {
            Self::SharedIterations(c) => {
                check_positive(scenario, "vus", c.vus)?;
                check_positive(scenario, "iterations", c.iterations)?;
                if c.iterations < c.vus {
                    return Err(LoadTestError::validation(format!(
                        "Scenario '{scenario}': `iterations` ({}) must not be lower than `vus` ({})",
                        c.iterations, c.vus
                    )));
                }
                check_nonzero_duration(scenario, "maxDuration", c.max_duration)
            },
            Self::PerVuIterations(c) => {
                check_positive(scenario, "vus", c.vus)?;
                check_positive(scenario, "iterations", c.iterations)?;
                check_nonzero_duration(scenario, "maxDuration", c.max_duration)
            },
            Self::ConstantVus(c) => {
                check_positive(scenario, "vus", c.vus)?;
                check_nonzero_duration(scenario, "duration", c.duration)
            },
            Self::RampingVus(c) => check_stages(scenario, &c.stages),
            Self::ConstantArrivalRate(c) => {
                check_positive(scenario, "rate", c.rate)?;
                check_nonzero_duration(scenario, "timeUnit", c.time_unit)?;
                check_nonzero_duration(scenario, "duration", c.duration)?;
                check_vu_caps(scenario, c.pre_allocated_vus, c.max_vus)
            },
            Self::RampingArrivalRate(c) => {
                check_nonzero_duration(scenario, "timeUnit", c.time_unit)?;
                check_stages(scenario, &c.stages)?;
                check_vu_caps(scenario, c.pre_allocated_vus, c.max_vus)
            },
        }
    }

    /// Most VUs the scenario may hold at once.
    pub fn max_vus(&self) -> u64 {
        match self {
            Self::SharedIterations(c) => c.vus,
            Self::PerVuIterations(c) => c.vus,
            Self::ConstantVus(c) => c.vus,
            Self::RampingVus(c) => Ramp::new(c.start_vus, c.stages.clone()).peak(),
            Self::ConstantArrivalRate(c) => c.max_vus.unwrap_or(c.pre_allocated_vus).max(c.pre_allocated_vus),
            Self::RampingArrivalRate(c) => c.max_vus.unwrap_or(c.pre_allocated_vus).max(c.pre_allocated_vus),
        }
    }

    /// VUs created before the run starts.
    pub fn pre_allocated_vus(&self) -> u64 {
        match self {
            Self::ConstantArrivalRate(c) => c.pre_allocated_vus,
            Self::RampingArrivalRate(c) => c.pre_allocated_vus,
            _ => self.max_vus(),
        }
    }

    pub fn graceful_stop(&self) -> Duration {
        match self {
            Self::SharedIterations(c) => c.graceful_stop,
            Self::PerVuIterations(c) => c.graceful_stop,
            Self::ConstantVus(c) => c.graceful_stop,
            Self::RampingVus(c) => c.graceful_stop,
            Self::ConstantArrivalRate(c) => c.graceful_stop,
            Self::RampingArrivalRate(c) => c.graceful_stop,
        }
    }

    /// Offset of the scenario's start from the start of the run.
    pub fn start_time(&self) -> Duration {
        match self {
            Self::SharedIterations(c) => c.start_time,
            Self::PerVuIterations(c) => c.start_time,
            Self::ConstantVus(c) => c.start_time,
            Self::RampingVus(c) => c.start_time,
            Self::ConstantArrivalRate(c) => c.start_time,
            Self::RampingArrivalRate(c) => c.start_time,
        }
    }

    /// Time from the scenario's start until no new iterations start.
    pub fn nominal_duration(&self) -> Duration {
        match self {
            Self::SharedIterations(c) => c.max_duration,
            Self::PerVuIterations(c) => c.max_duration,
            Self::ConstantVus(c) => c.duration,
            Self::RampingVus(c) => c.stages.iter().map(|s| s.duration).sum(),
            Self::ConstantArrivalRate(c) => c.duration,
            Self::RampingArrivalRate(c) => c.stages.iter().map(|s| s.duration).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threshold::{Comparator, Statistic};
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_parse_scenarios_with_camel_case_options() {
        let config = LoadTestConfig::from_toml(
            r#"
[scenarios.api]
executor = "ramping-arrival-rate"
startRate = 5
timeUnit = "1m"
preAllocatedVUs = 2
maxVUs = 20
gracefulStop = "10s"
startTime = "5s"
stages = [{ duration = "1m20s", target = 60 }]
"#,
        )
        .unwrap();

        let plan = config.plan().unwrap();
        assert_eq!(plan.scenarios.len(), 1);
        assert_eq!(plan.scenarios[0].name, "api");
        assert_eq!(
            plan.scenarios[0].executor,
            ExecutorConfig::RampingArrivalRate(RampingArrivalRateConfig {
                start_rate: 5,
                time_unit: secs(60),
                stages: vec![Stage::new(secs(80), 60)],
                pre_allocated_vus: 2,
                max_vus: Some(20),
                graceful_stop: secs(10),
                start_time: secs(5),
            })
        );
        assert_eq!(plan.total_max_vus(), 20);
        assert_eq!(plan.latest_end(), secs(5 + 80 + 10));
    }

    #[test]
    fn test_unknown_top_level_option_is_rejected() {
        let err = LoadTestConfig::from_toml("vus = 2\nduraton = \"10s\"\n").unwrap_err();
        assert!(matches!(err, LoadTestError::ConfigParse { .. }));
        assert!(err.to_string().contains("duraton"));
    }

    #[test]
    fn test_unknown_executor_option_is_rejected() {
        let err = LoadTestConfig::from_toml(
            r#"
[scenarios.s]
executor = "constant-vus"
vus = 2
duration = "10s"
rate = 5
"#,
        )
        .unwrap_err();
        assert!(matches!(err, LoadTestError::ConfigParse { .. }));
    }

    #[test]
    fn test_unknown_executor_kind_is_rejected() {
        let err = LoadTestConfig::from_toml(
            "[scenarios.s]\nexecutor = \"externally-controlled\"\nvus = 1\n",
        )
        .unwrap_err();
        assert!(matches!(err, LoadTestError::ConfigParse { .. }));
    }

    #[test]
    fn test_stages_shortcut_becomes_ramping_vus() {
        let config = LoadTestConfig::from_toml(
            r#"
stages = [
  { duration = "40s", target = 4 },
  { duration = "1m20s", target = 10 },
  { duration = "20s", target = 0 },
]
"#,
        )
        .unwrap();
        let plan = config.plan().unwrap();
        assert_eq!(plan.scenarios[0].name, DEFAULT_SCENARIO);
        match &plan.scenarios[0].executor {
            ExecutorConfig::RampingVus(c) => {
                assert_eq!(c.start_vus, 0);
                assert_eq!(c.stages.len(), 3);
            },
            other => panic!("Expected ramping-vus, got {other:?}"),
        }
        assert_eq!(plan.scenarios[0].executor.nominal_duration(), secs(140));
        assert_eq!(plan.total_max_vus(), 10);
    }

    #[test]
    fn test_other_shortcuts() {
        let plan = LoadTestConfig::from_toml("vus = 3\nduration = \"30s\"\n")
            .unwrap()
            .plan()
            .unwrap();
        assert_eq!(plan.scenarios[0].executor.kind_name(), "constant-vus");

        let plan = LoadTestConfig::from_toml("vus = 3\niterations = 30\n")
            .unwrap()
            .plan()
            .unwrap();
        assert_eq!(plan.scenarios[0].executor.kind_name(), "shared-iterations");

        let plan = LoadTestConfig::from_toml("").unwrap().plan().unwrap();
        assert_eq!(plan.scenarios[0].executor.kind_name(), "per-vu-iterations");
        assert_eq!(plan.scenarios[0].executor.max_vus(), 1);
    }

    #[test]
    fn test_mixing_scenarios_and_shortcuts_fails() {
        let err = LoadTestConfig::from_toml(
            r#"
vus = 5
[scenarios.s]
executor = "constant-vus"
duration = "10s"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, LoadTestError::ConfigValidation { .. }));

        let err = LoadTestConfig::from_toml(
            "duration = \"10s\"\nstages = [{ duration = \"5s\", target = 1 }]\n",
        )
        .unwrap_err();
        assert!(matches!(err, LoadTestError::ConfigValidation { .. }));
    }

    #[test]
    fn test_invalid_executor_parameters() {
        let cases = [
            "[scenarios.s]\nexecutor = \"ramping-vus\"\nstages = []\n",
            "[scenarios.s]\nexecutor = \"ramping-vus\"\nstages = [{ duration = \"0s\", target = 3 }]\n",
            "[scenarios.s]\nexecutor = \"constant-arrival-rate\"\nrate = 10\nduration = \"1m\"\npreAllocatedVUs = 10\nmaxVUs = 5\n",
            "[scenarios.s]\nexecutor = \"constant-arrival-rate\"\nrate = 10\nduration = \"1m\"\npreAllocatedVUs = 0\n",
            "[scenarios.s]\nexecutor = \"shared-iterations\"\nvus = 10\niterations = 5\n",
            "[scenarios.s]\nexecutor = \"constant-vus\"\nvus = 0\nduration = \"10s\"\n",
        ];
        for case in cases {
            let err = LoadTestConfig::from_toml(case).unwrap_err();
            assert!(
                matches!(err, LoadTestError::ConfigValidation { .. }),
                "expected validation error for {case:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn test_thresholds_in_both_forms() {
        let config = LoadTestConfig::from_toml(
            r#"
[thresholds]
http_req_duration = ["p(99) < 1500", "avg<200"]
http_req_failed = [{ threshold = "rate < 0.01", abortOnFail = true, delayAbortEval = "10s" }]
checks = "rate > 0.9"
"#,
        )
        .unwrap();
        let thresholds = config.plan().unwrap().thresholds;
        assert_eq!(thresholds.len(), 4);

        let failed = thresholds
            .iter()
            .find(|t| t.metric == "http_req_failed")
            .unwrap();
        assert!(failed.abort_on_fail);
        assert_eq!(failed.delay_abort_eval, Some(secs(10)));
        assert_eq!(failed.expr.statistic, Statistic::Rate);
        assert_eq!(failed.expr.comparator, Comparator::Lt);

        let p99 = thresholds.iter().find(|t| t.source == "p(99) < 1500").unwrap();
        assert_eq!(p99.expr.statistic, Statistic::Percentile(99.0));
        assert!(!p99.abort_on_fail);
    }

    #[test]
    fn test_bad_threshold_expressions_are_rejected() {
        let err = LoadTestConfig::from_toml("[thresholds]\nhttp_req_duration = [\"p(99) ~ 1500\"]\n")
            .unwrap_err();
        assert!(matches!(err, LoadTestError::InvalidThreshold { .. }));

        // `rate` is not a statistic of a trend.
        let err = LoadTestConfig::from_toml("[thresholds]\nhttp_req_duration = [\"rate < 0.1\"]\n")
            .unwrap_err();
        match err {
            LoadTestError::InvalidThreshold { metric, reason, .. } => {
                assert_eq!(metric, "http_req_duration");
                assert!(reason.contains("trend"));
            },
            other => panic!("Expected InvalidThreshold, got {other:?}"),
        }

        // Custom metrics are only checked at evaluation time.
        assert!(LoadTestConfig::from_toml("[thresholds]\nmy_metric = [\"rate < 0.1\"]\n").is_ok());
    }

    #[test]
    fn test_json_options_object() {
        let config = LoadTestConfig::from_json(
            r#"{
                "scenarios": {
                    "stress": {
                        "executor": "ramping-vus",
                        "startVUs": 0,
                        "stages": [{ "duration": "10s", "target": 4 }]
                    }
                },
                "thresholds": { "http_req_duration": ["p(95)<500"] }
            }"#,
        )
        .unwrap();
        let plan = config.plan().unwrap();
        assert_eq!(plan.scenarios[0].executor.kind_name(), "ramping-vus");
        assert_eq!(plan.scenarios[0].executor.pre_allocated_vus(), 4);
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = LoadTestConfig::from_toml(
            "[scenarios.s]\nexecutor = \"constant-vus\"\nvus = 2\nduration = \"1m\"\n",
        )
        .unwrap();
        config.apply_overrides(Some(7), Some(secs(15)));
        let plan = config.plan().unwrap();
        assert_eq!(plan.scenarios[0].name, DEFAULT_SCENARIO);
        assert_eq!(
            plan.scenarios[0].executor,
            ExecutorConfig::ConstantVus(ConstantVusConfig {
                vus: 7,
                duration: secs(15),
                graceful_stop: secs(30),
                start_time: Duration::ZERO,
            })
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut tmpfile = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        tmpfile.write_all(b"vus = 2\nduration = \"5s\"\n").unwrap();
        tmpfile.flush().unwrap();
        let config = LoadTestConfig::load(tmpfile.path()).unwrap();
        assert_eq!(config.vus, Some(2));
        assert_eq!(config.duration, Some(secs(5)));

        let mut json = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        json.write_all(br#"{"vus": 2, "iterations": 4}"#).unwrap();
        json.flush().unwrap();
        let config = LoadTestConfig::load(json.path()).unwrap();
        assert_eq!(config.iterations, Some(4));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = LoadTestConfig::load(Path::new("/nonexistent/path.toml")).unwrap_err();
        assert!(matches!(err, LoadTestError::ConfigIo { .. }));
    }
}
