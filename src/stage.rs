//! Stage interpolation.
//!
//! A [`Ramp`] plays a sequence of [`Stage`]s in order, moving linearly from
//! the previous target to each stage's target across the stage's duration.
//! VU-count executors read it as a concurrency curve via [`Ramp::vus_at`];
//! arrival-rate executors wrap it in an [`ArrivalSchedule`], which integrates
//! the rate curve to find when each iteration should start.

use serde::{Deserialize, Serialize};
use std::time::Duration;

const EPSILON: f64 = 1e-9;

/// A time-boxed segment of a ramp.
///
/// ```toml
/// [[stages]]
/// duration = "40s"
/// target = 4
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Stage {
    /// How long the stage lasts. Must be non-zero.
    #[serde(with = "crate::durations")]
    pub duration: Duration,
    /// Target VUs, or target iterations per time unit, at the stage's end.
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

/// Where a ramp is at a given instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StagePosition {
    pub index: usize,
    /// Offset at which this stage began.
    pub stage_start: Duration,
    pub from: u64,
    pub to: u64,
    /// Fraction of the stage elapsed, in `[0, 1)`.
    pub progress: f64,
}

impl StagePosition {
    /// Offset at which this stage ends.
    pub fn stage_end(&self, stage: &Stage) -> Duration {
        self.stage_start + stage.duration
    }
}

/// A start value followed by stages played strictly in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Ramp {
    start: u64,
    stages: Vec<Stage>,
}

impl Ramp {
    pub fn new(start: u64, stages: Vec<Stage>) -> Self {
        Self { start, stages }
    }

    /// A flat hold at `value` for `duration`.
    pub fn flat(value: u64, duration: Duration) -> Self {
        Self::new(value, vec![Stage::new(duration, value)])
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Sum of all stage durations.
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// The target once every stage has played.
    pub fn end_value(&self) -> u64 {
        self.stages.last().map_or(self.start, |s| s.target)
    }

    /// Largest value the ramp ever reaches.
    pub fn peak(&self) -> u64 {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start, u64::max)
    }

    /// Locate `elapsed` within the stages. `None` once every stage has ended.
    pub fn position(&self, elapsed: Duration) -> Option<StagePosition> {
        let mut stage_start = Duration::ZERO;
        let mut from = self.start;
        for (index, stage) in self.stages.iter().enumerate() {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let into = elapsed.saturating_sub(stage_start);
                return Some(StagePosition {
                    index,
                    stage_start,
                    from,
                    to: stage.target,
                    progress: into.as_secs_f64() / stage.duration.as_secs_f64(),
                });
            }
            stage_start = stage_end;
            from = stage.target;
        }
        None
    }

    /// The continuous interpolated target at `elapsed`.
    pub fn target_at(&self, elapsed: Duration) -> f64 {
        match self.position(elapsed) {
            Some(p) => p.from as f64 + (p.to as f64 - p.from as f64) * p.progress,
            None => self.end_value() as f64,
        }
    }

    /// The whole-VU concurrency at `elapsed`.
    ///
    /// Rounds down while a stage ramps up and up while it ramps down, so the
    /// count is monotonic within a stage, stays between the stage's two
    /// endpoints, and equals the stage target exactly at its end boundary.
    pub fn vus_at(&self, elapsed: Duration) -> u64 {
        let Some(p) = self.position(elapsed) else {
            return self.end_value();
        };
        let value = p.from as f64 + (p.to as f64 - p.from as f64) * p.progress;
        let rounded = if p.to >= p.from {
            (value + EPSILON).floor()
        } else {
            (value - EPSILON).ceil()
        };
        (rounded.max(0.0) as u64).clamp(p.from.min(p.to), p.from.max(p.to))
    }
}

/// The iteration start curve of an arrival-rate executor.
///
/// Stage targets are iterations per `time_unit`. The number of iterations
/// that should have started by offset `t` is the integral of the rate up to
/// `t`; start `n` (zero-based) is scheduled at the instant that integral
/// reaches `n`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrivalSchedule {
    ramp: Ramp,
    time_unit: Duration,
}

impl ArrivalSchedule {
    pub fn new(start_rate: u64, stages: Vec<Stage>, time_unit: Duration) -> Self {
        Self {
            ramp: Ramp::new(start_rate, stages),
            time_unit,
        }
    }

    /// `rate` iterations per `time_unit`, held for `duration`.
    pub fn constant(rate: u64, duration: Duration, time_unit: Duration) -> Self {
        Self {
            ramp: Ramp::flat(rate, duration),
            time_unit,
        }
    }

    pub fn ramp(&self) -> &Ramp {
        &self.ramp
    }

    pub fn time_unit(&self) -> Duration {
        self.time_unit
    }

    pub fn total_duration(&self) -> Duration {
        self.ramp.total_duration()
    }

    /// Interpolated rate at `elapsed`, in iterations per `time_unit`.
    pub fn rate_at(&self, elapsed: Duration) -> f64 {
        self.ramp.target_at(elapsed)
    }

    /// Iterations that should have started by `elapsed` (fractional).
    pub fn expected_starts(&self, elapsed: Duration) -> f64 {
        let unit = self.time_unit.as_secs_f64();
        let mut total = 0.0;
        let mut stage_start = Duration::ZERO;
        let mut from = self.ramp.start() as f64 / unit;
        for stage in self.ramp.stages() {
            let secs = stage.duration.as_secs_f64();
            let to = stage.target as f64 / unit;
            let into = elapsed.saturating_sub(stage_start).as_secs_f64().min(secs);
            total += from * into + (to - from) * into * into / (2.0 * secs);
            if elapsed < stage_start + stage.duration {
                break;
            }
            stage_start += stage.duration;
            from = to;
        }
        total
    }

    /// Number of starts scheduled over the whole schedule.
    pub fn total_starts(&self) -> u64 {
        let area = self.expected_starts(self.total_duration());
        (area - EPSILON).ceil().max(0.0) as u64
    }

    /// Offset at which start `n` (zero-based) is due, or `None` if the
    /// schedule ends before it.
    pub fn start_offset(&self, n: u64) -> Option<Duration> {
        let n = n as f64;
        let unit = self.time_unit.as_secs_f64();
        let mut cumulative = 0.0;
        let mut stage_start = Duration::ZERO;
        let mut from = self.ramp.start() as f64 / unit;
        let area_total = self.expected_starts(self.total_duration());
        if n >= area_total - EPSILON {
            return None;
        }

        for stage in self.ramp.stages() {
            let secs = stage.duration.as_secs_f64();
            let to = stage.target as f64 / unit;
            let area = (from + to) / 2.0 * secs;
            if area > 0.0 && n < cumulative + area {
                let tau = solve_offset(from, to, secs, n - cumulative);
                let tau = tau.clamp(0.0, secs);
                let within = Duration::from_secs_f64(tau).min(
                    stage
                        .duration
                        .saturating_sub(Duration::from_nanos(1)),
                );
                return Some(stage_start + within);
            }
            cumulative += area;
            stage_start += stage.duration;
            from = to;
        }
        None
    }
}

/// Time `tau` into a stage at which `from*tau + (to-from)*tau^2/(2*secs)`
/// reaches `x`.
fn solve_offset(from: f64, to: f64, secs: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    let slope = (to - from) / secs;
    if slope.abs() < EPSILON {
        return x / from;
    }
    let disc = (from * from + 2.0 * slope * x).max(0.0);
    // Rearranged quadratic root; stable when `from` is zero.
    2.0 * x / (from + disc.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_ramp_up_interpolates_linearly() {
        let ramp = Ramp::new(0, vec![Stage::new(secs(10), 4)]);
        assert_eq!(ramp.vus_at(Duration::ZERO), 0);
        assert_eq!(ramp.vus_at(secs(5)), 2);
        assert_eq!(ramp.vus_at(Duration::from_millis(9_999)), 3);
        assert_eq!(ramp.vus_at(secs(10)), 4);
        assert!((ramp.target_at(secs(5)) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_ramp_down_rounds_up() {
        let ramp = Ramp::new(10, vec![Stage::new(secs(10), 0)]);
        assert_eq!(ramp.vus_at(Duration::ZERO), 10);
        assert_eq!(ramp.vus_at(Duration::from_millis(500)), 10);
        assert_eq!(ramp.vus_at(Duration::from_millis(9_999)), 1);
        assert_eq!(ramp.vus_at(secs(10)), 0);
    }

    #[test]
    fn test_stage_boundary_hits_target_exactly() {
        // The load-script profile: 40s -> 4, 1m20s -> 10, 20s -> 0.
        let ramp = Ramp::new(
            0,
            vec![
                Stage::new(secs(40), 4),
                Stage::new(secs(80), 10),
                Stage::new(secs(20), 0),
            ],
        );
        assert_eq!(ramp.vus_at(secs(40)), 4);
        assert_eq!(ramp.vus_at(secs(120)), 10);
        assert_eq!(ramp.vus_at(secs(140)), 0);
        assert_eq!(ramp.total_duration(), secs(140));
        assert_eq!(ramp.peak(), 10);
    }

    #[test]
    fn test_flat_hold() {
        let ramp = Ramp::new(3, vec![Stage::new(secs(5), 3)]);
        for t in 0..5 {
            assert_eq!(ramp.vus_at(secs(t)), 3);
        }
    }

    #[test]
    fn test_position_reports_stage_index() {
        let ramp = Ramp::new(0, vec![Stage::new(secs(2), 2), Stage::new(secs(3), 5)]);
        let p = ramp.position(secs(3)).unwrap();
        assert_eq!(p.index, 1);
        assert_eq!(p.stage_start, secs(2));
        assert_eq!((p.from, p.to), (2, 5));
        assert!(ramp.position(secs(5)).is_none());
    }

    #[test]
    fn test_constant_arrival_starts_evenly_spaced() {
        let schedule = ArrivalSchedule::constant(10, secs(1), secs(1));
        assert_eq!(schedule.total_starts(), 10);
        assert_eq!(schedule.start_offset(0), Some(Duration::ZERO));
        let third = schedule.start_offset(3).unwrap();
        assert!((third.as_secs_f64() - 0.3).abs() < 1e-6);
        assert!(schedule.start_offset(9).is_some());
        assert!(schedule.start_offset(10).is_none());
    }

    #[test]
    fn test_time_unit_scales_rate() {
        let schedule = ArrivalSchedule::constant(30, secs(60), secs(60));
        assert_eq!(schedule.total_starts(), 30);
        let second = schedule.start_offset(1).unwrap();
        assert!((second.as_secs_f64() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_ramping_arrival_integrates_rate() {
        // 0 -> 10/s over 10s schedules 50 starts, front-loaded towards the end.
        let schedule = ArrivalSchedule::new(0, vec![Stage::new(secs(10), 10)], secs(1));
        assert_eq!(schedule.total_starts(), 50);
        assert!((schedule.expected_starts(secs(5)) - 12.5).abs() < 1e-9);
        let mut last = Duration::ZERO;
        for n in 0..50 {
            let at = schedule.start_offset(n).unwrap();
            assert!(at >= last);
            assert!(at < secs(10));
            last = at;
        }
        assert!(schedule.start_offset(50).is_none());
    }

    #[test]
    fn test_zero_rate_stage_schedules_nothing() {
        let schedule = ArrivalSchedule::new(
            0,
            vec![Stage::new(secs(5), 0), Stage::new(secs(1), 2)],
            secs(1),
        );
        let first = schedule.start_offset(0).unwrap();
        assert_eq!(first, secs(5));
        assert_eq!(schedule.total_starts(), 1);
    }
}
