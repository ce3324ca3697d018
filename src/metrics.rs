//! Running per-scenario statistics.

use crate::config::MetricsConfig;
use crate::math::RunningMean;
use crate::sample::timestamp_format;
use crate::simulation::Frame;
use crate::state::TrafficSnapshot;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Speeds at or below this are a standstill, in km/h.
const STANDSTILL_SPEED: f64 = 1e-6;

/// One of the two simulated scenarios.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// Replays the observed traffic.
    Real,
    /// Applies the speed policy.
    Optimized,
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scenario::Real => f.pad("real"),
            Scenario::Optimized => f.pad("optimized"),
        }
    }
}

/// Aggregate statistics of one scenario up to a point in simulated time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(with = "timestamp_format")]
    pub simulation_time: NaiveDateTime,
    pub scenario: Scenario,
    /// Running mean of the mean cell speed, in km/h.
    pub mean_speed: f64,
    /// Running mean of the travel time, in minutes.
    pub mean_travel_time: f64,
    /// Vehicles leaving the segment per hour, since the start.
    pub throughput: f64,
    /// Mean cell speed at this tick, in km/h.
    pub current_speed: f64,
    /// Travel time at this tick, in minutes.
    pub current_travel_time: f64,
}

#[derive(Clone, Debug, Default)]
struct Accumulator {
    speed: RunningMean,
    travel_time: RunningMean,
    exited: f64,
    hours: f64,
    history: Vec<MetricsSnapshot>,
}

/// Consumes frames and keeps a running history of [MetricsSnapshot]s per scenario.
#[derive(Clone, Debug)]
pub struct MetricsAggregator {
    /// In km.
    length: f64,
    /// In minutes.
    max_travel_time: f64,
    real: Accumulator,
    optimized: Accumulator,
}

impl MetricsAggregator {
    /// # Parameters
    /// * `length` - Length of the segment in km.
    pub fn new(config: &MetricsConfig, length: f64) -> Self {
        Self {
            length,
            max_travel_time: config.max_travel_time_minutes,
            real: Default::default(),
            optimized: Default::default(),
        }
    }

    /// Time to traverse the segment at `speed`, in minutes, capped at the sentinel.
    pub fn travel_time(&self, speed: f64) -> f64 {
        if !speed.is_finite() || speed <= STANDSTILL_SPEED {
            return self.max_travel_time;
        }
        f64::min(60.0 * self.length / speed, self.max_travel_time)
    }

    /// Records both scenarios of a frame, returning their snapshots as `[real, optimized]`.
    pub fn record(&mut self, frame: &Frame) -> [MetricsSnapshot; 2] {
        [
            self.record_one(&frame.real, frame.interval_hours),
            self.record_one(&frame.optimized, frame.interval_hours),
        ]
    }

    fn record_one(&mut self, snapshot: &TrafficSnapshot, hours: f64) -> MetricsSnapshot {
        let current_travel_time = self.travel_time(snapshot.mean_speed);
        let acc = self.accumulator_mut(snapshot.scenario);
        acc.speed.push(snapshot.mean_speed);
        acc.travel_time.push(current_travel_time);
        acc.exited += snapshot.throughput * hours;
        acc.hours += hours;

        let metrics = MetricsSnapshot {
            simulation_time: snapshot.timestamp,
            scenario: snapshot.scenario,
            mean_speed: acc.speed.mean(),
            mean_travel_time: acc.travel_time.mean(),
            throughput: if acc.hours > 0.0 { acc.exited / acc.hours } else { 0.0 },
            current_speed: snapshot.mean_speed,
            current_travel_time,
        };
        acc.history.push(metrics.clone());
        metrics
    }

    fn accumulator(&self, scenario: Scenario) -> &Accumulator {
        match scenario {
            Scenario::Real => &self.real,
            Scenario::Optimized => &self.optimized,
        }
    }

    fn accumulator_mut(&mut self, scenario: Scenario) -> &mut Accumulator {
        match scenario {
            Scenario::Real => &mut self.real,
            Scenario::Optimized => &mut self.optimized,
        }
    }

    /// Every snapshot recorded for a scenario, oldest first.
    pub fn history(&self, scenario: Scenario) -> &[MetricsSnapshot] {
        &self.accumulator(scenario).history
    }

    pub fn latest(&self, scenario: Scenario) -> Option<&MetricsSnapshot> {
        self.accumulator(scenario).history.last()
    }

    /// Forgets everything recorded so far.
    pub fn reset(&mut self) {
        self.real = Default::default();
        self.optimized = Default::default();
    }
}

/// How the speed policy changed traffic on one segment while it was active.
///
/// The policy counts as active whenever the optimized scenario runs under a limit below
/// the segment's base limit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImprovementReport {
    pub segment_id: String,
    pub critical_density: f64,
    /// The posted limit without intervention, in km/h.
    pub base_limit: f64,
    pub ticks: usize,
    #[serde(rename = "n_active_intervals")]
    pub active_intervals: usize,
    /// Share of ticks under restriction, in percent.
    pub pct_restricted: f64,
    /// Mean observed speed while restricted, in km/h.
    pub observed_speed: f64,
    /// Mean simulated speed while restricted, in km/h.
    pub simulated_speed: f64,
    /// In km/h.
    pub speed_gain: f64,
    /// Relative to the observed speed, in percent.
    pub pct_speed_gain: f64,
}

impl ImprovementReport {
    /// Builds a report from a run's frames.
    pub fn from_frames<'a>(
        segment_id: &str,
        critical_density: f64,
        base_limit: f64,
        frames: impl IntoIterator<Item = &'a Frame>,
    ) -> Self {
        let mut ticks = 0;
        let mut observed = RunningMean::default();
        let mut simulated = RunningMean::default();
        for frame in frames {
            ticks += 1;
            if frame.optimized.speed_limit < base_limit {
                observed.push(frame.real.mean_speed);
                simulated.push(frame.optimized.mean_speed);
            }
        }

        let active_intervals = observed.count();
        let speed_gain = simulated.mean() - observed.mean();
        Self {
            segment_id: segment_id.to_string(),
            critical_density,
            base_limit,
            ticks,
            active_intervals,
            pct_restricted: if ticks > 0 {
                100.0 * active_intervals as f64 / ticks as f64
            } else {
                0.0
            },
            observed_speed: observed.mean(),
            simulated_speed: simulated.mean(),
            speed_gain,
            pct_speed_gain: if observed.mean() > 0.0 {
                100.0 * speed_gain / observed.mean()
            } else {
                0.0
            },
        }
    }
}

/// Orders reports by relative speed gain, best first. Segments restricted for less than
/// `min_pct_restricted` percent of the time are left out.
pub fn rank(reports: &[ImprovementReport], min_pct_restricted: f64) -> Vec<&ImprovementReport> {
    let mut ranked: Vec<_> = reports
        .iter()
        .filter(|r| r.pct_restricted > min_pct_restricted)
        .collect();
    ranked.sort_by(|a, b| b.pct_speed_gain.total_cmp(&a.pct_speed_gain));
    ranked
}
