use crate::config::Config;
use crate::error::{Error, Result};
use crate::flow::{CriticalDensity, FlowModel, FundamentalDiagram, ThresholdSource};
use crate::live::{Command, LiveFeed, LiveView, SimulationControl};
use crate::metrics::{ImprovementReport, MetricsAggregator, MetricsSnapshot, Scenario};
use crate::policy::{PolicyAction, SpeedPolicy};
use crate::predictor::{DensityForecast, FeatureWindow, Inference};
use crate::sample::{timestamp_format, SensorSample};
use crate::state::{Boundary, TrafficSnapshot, TrafficState};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The paired state of both scenarios after one tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub tick: usize,
    #[serde(with = "timestamp_format")]
    pub timestamp: NaiveDateTime,
    /// Length of the tick in hours.
    pub interval_hours: f64,
    pub real: TrafficSnapshot,
    pub optimized: TrafficSnapshot,
    /// The action in force in the optimized scenario during this tick.
    pub action: PolicyAction,
    /// The forecast behind the action, if one was available.
    pub forecast: Option<DensityForecast>,
}

/// One row of the output dataset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    #[serde(with = "timestamp_format")]
    pub timestamp: NaiveDateTime,
    pub segment_id: String,
    /// In km/h.
    pub observed_speed: f64,
    /// The posted speed limit, in km/h.
    pub optimal_speed: f64,
}

/// What happened during a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub ticks: usize,
    pub restricted_ticks: usize,
    pub prediction_failures: usize,
    pub deadline_misses: usize,
    /// Whether the run ended on a stop request rather than at the end of the data.
    pub stopped: bool,
    pub critical_density: CriticalDensity,
    pub real: Option<MetricsSnapshot>,
    pub optimized: Option<MetricsSnapshot>,
    pub improvement: ImprovementReport,
}

/// The calibrated diagram of a segment and the threshold derived from it.
#[derive(Clone, Debug)]
pub struct Calibration {
    pub diagram: Arc<FundamentalDiagram>,
    pub threshold: CriticalDensity,
}

/// Fits a diagram to a segment's history.
///
/// Without enough data to fit, a Greenshields diagram with the normal speed limit as
/// free-flow speed stands in, and the default critical density is used. A fitted curve
/// on which speed rises with density is replaced by a Greenshields diagram with the
/// fitted free-flow speed.
pub fn calibrate(config: &Config, samples: &[SensorSample]) -> Calibration {
    let default = config.fit.default_critical_density;
    match FlowModel::new(config.fit.clone(), config.segment.jam_density).fit(samples) {
        Ok(diagram) if diagram.is_physical() => Calibration {
            threshold: diagram.threshold(default),
            diagram: Arc::new(diagram),
        },
        Ok(diagram) => {
            let free_flow_speed = Some(diagram.free_flow_speed())
                .filter(|v| v.is_finite() && *v > 0.0)
                .unwrap_or(config.policy.normal_limit);
            log::warn!(
                "Fitted diagram lets speed rise with density; simulating a Greenshields diagram at {:.1} km/h",
                free_flow_speed
            );
            Calibration {
                threshold: diagram.threshold(default),
                diagram: Arc::new(FundamentalDiagram::greenshields(
                    free_flow_speed,
                    config.segment.jam_density,
                )),
            }
        }
        Err(err) => {
            log::warn!("{}; using a default diagram", err);
            Calibration {
                diagram: Arc::new(FundamentalDiagram::greenshields(
                    config.policy.normal_limit,
                    config.segment.jam_density,
                )),
                threshold: CriticalDensity {
                    value: default,
                    source: ThresholdSource::Default,
                },
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Counters {
    restricted_ticks: usize,
    prediction_failures: usize,
    deadline_misses: usize,
}

/// Replays a segment's history next to a simulation of the same traffic under the
/// speed policy.
///
/// Both scenarios advance on the same clock, one tick per ground truth sample.
pub struct DualSimulator {
    segment_id: String,
    /// Ground truth, in time order.
    samples: Vec<SensorSample>,
    /// Index of the next sample to simulate.
    cursor: usize,
    /// Tick length in s.
    dt: f64,
    real: TrafficState,
    optimized: TrafficState,
    inference: Inference,
    policy: SpeedPolicy,
    threshold: CriticalDensity,
    /// The action currently in force.
    action: PolicyAction,
    metrics: MetricsAggregator,
    frames: Vec<Frame>,
    outputs: Vec<OutputRecord>,
    counters: Counters,
    feed: Option<LiveFeed>,
    control: SimulationControl,
    stopped: bool,
    halted: bool,
}

impl DualSimulator {
    /// Creates a simulator over the samples of one segment.
    pub fn new(
        config: &Config,
        samples: Vec<SensorSample>,
        calibration: Calibration,
        inference: Inference,
    ) -> Result<Self> {
        let first = samples.first().ok_or(Error::EmptyDataset)?;
        let segment_id = first.segment_id.clone();
        let initial_density = first.density;
        if samples.iter().any(|s| s.segment_id != segment_id) {
            return Err(Error::InvalidConfig(format!(
                "samples of segment {} mixed with other segments",
                segment_id
            )));
        }

        let Calibration { diagram, threshold } = calibration;
        let policy = SpeedPolicy::new(&config.policy, threshold.value);
        let normal_limit = policy.speed_limit(PolicyAction::Normal);
        let state = |scenario| {
            TrafficState::new(
                scenario,
                diagram.clone(),
                &config.segment,
                threshold.value,
                normal_limit,
                initial_density,
                config.simulation.divergence_tolerance,
            )
        };
        let real = state(Scenario::Real);
        let optimized = state(Scenario::Optimized);
        let metrics = MetricsAggregator::new(&config.metrics, real.length());

        log::info!(
            "Simulating segment {} over {} ticks, critical density {:.1} veh/km ({:?})",
            segment_id,
            samples.len(),
            threshold.value,
            threshold.source
        );
        Ok(Self {
            segment_id,
            samples,
            cursor: 0,
            dt: config.tick_seconds(),
            real,
            optimized,
            inference,
            policy,
            threshold,
            action: PolicyAction::Normal,
            metrics,
            frames: vec![],
            outputs: vec![],
            counters: Default::default(),
            feed: None,
            control: SimulationControl::new(),
            stopped: false,
            halted: false,
        })
    }

    /// Publishes every frame to the given feed.
    pub fn with_feed(mut self, feed: LiveFeed) -> Self {
        self.feed = Some(feed);
        self
    }

    /// A handle for requesting a stop or reset from another thread.
    pub fn control(&self) -> SimulationControl {
        self.control.clone()
    }

    pub fn segment_id(&self) -> &str {
        &self.segment_id
    }

    pub fn action(&self) -> PolicyAction {
        self.action
    }

    pub fn real(&self) -> &TrafficState {
        &self.real
    }

    pub fn optimized(&self) -> &TrafficState {
        &self.optimized
    }

    pub fn metrics(&self) -> &MetricsAggregator {
        &self.metrics
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// The output dataset so far, one record per tick.
    pub fn outputs(&self) -> &[OutputRecord] {
        &self.outputs
    }

    /// Whether every sample has been simulated.
    pub fn is_finished(&self) -> bool {
        self.cursor >= self.samples.len()
    }

    /// Returns both scenarios to their initial state and rewinds the clock.
    pub fn reset(&mut self) {
        log::info!("Resetting simulation of segment {}", self.segment_id);
        self.real.reset();
        self.optimized.reset();
        self.cursor = 0;
        self.action = PolicyAction::Normal;
        self.metrics.reset();
        self.frames.clear();
        self.outputs.clear();
        self.counters = Default::default();
        self.stopped = false;
        self.halted = false;
        if let Some(feed) = &self.feed {
            feed.clear();
        }
    }

    /// Advances both scenarios by one tick.
    ///
    /// Returns `Ok(None)` once the data is exhausted or a stop was requested. After a
    /// divergence every call fails with [`Error::Halted`] until the simulator is reset.
    pub fn tick(&mut self) -> Result<Option<Frame>> {
        match self.control.take() {
            Some(Command::Stop) => {
                log::info!("Stopping simulation of segment {}", self.segment_id);
                self.stopped = true;
            }
            Some(Command::Reset) => self.reset(),
            None => {}
        }
        if self.halted {
            return Err(Error::Halted);
        }
        if self.stopped || self.is_finished() {
            return Ok(None);
        }

        let sample = &self.samples[self.cursor];
        let timestamp = sample.timestamp;
        let hours = self.dt / 3600.0;

        self.real.replay(sample, self.dt);

        let history = &self.samples[..=self.cursor];
        let forecast = match FeatureWindow::from_history(history, self.inference.window_len()) {
            Some(window) => match self.inference.predict(&window) {
                Ok(forecast) => Some(forecast),
                Err(err) => {
                    self.counters.prediction_failures += 1;
                    if matches!(err, Error::InferenceTimeout(_)) {
                        self.counters.deadline_misses += 1;
                    }
                    log::warn!("{} at {}; holding {:?}", err, timestamp, self.action);
                    None
                }
            },
            None => None,
        };
        if let Some(forecast) = &forecast {
            let action = self.policy.decide(forecast, self.action);
            if action != self.action {
                log::debug!(
                    "{}: forecast {:.1} veh/km, {:?} -> {:?}",
                    timestamp,
                    forecast.predicted_density,
                    self.action,
                    action
                );
            }
            self.action = action;
        }

        let sample = &self.samples[self.cursor];
        let boundary = Boundary {
            at: timestamp,
            inflow_vehicles: sample.vehicles_over(hours),
            downstream_density: Some(sample.density),
        };
        let speed_limit = self.policy.speed_limit(self.action);
        if let Err(err) = self.optimized.step(self.dt, speed_limit, &boundary) {
            log::error!("{}", err);
            self.halted = true;
            return Err(err);
        }

        let frame = Frame {
            tick: self.cursor,
            timestamp,
            interval_hours: hours,
            real: self.real.snapshot(timestamp),
            optimized: self.optimized.snapshot(timestamp),
            action: self.action,
            forecast,
        };
        let [real, optimized] = self.metrics.record(&frame);
        log::debug!(
            "{}: real {:.1} km/h, optimized {:.1} km/h under {:.0} km/h",
            timestamp,
            real.current_speed,
            optimized.current_speed,
            speed_limit
        );
        if let Some(feed) = &self.feed {
            feed.publish(LiveView {
                frame: frame.clone(),
                real,
                optimized,
            });
        }

        self.outputs.push(OutputRecord {
            timestamp,
            segment_id: self.segment_id.clone(),
            observed_speed: sample.speed,
            optimal_speed: speed_limit,
        });
        if self.action == PolicyAction::Restricted {
            self.counters.restricted_ticks += 1;
        }
        self.frames.push(frame.clone());
        self.cursor += 1;
        Ok(Some(frame))
    }

    /// Ticks until the data is exhausted or a stop is requested.
    pub fn run(&mut self) -> Result<RunSummary> {
        while self.tick()?.is_some() {}
        let summary = self.summary();
        log::info!(
            "Segment {}: {} ticks, {} restricted, {} prediction failures ({} deadline misses)",
            self.segment_id,
            summary.ticks,
            summary.restricted_ticks,
            summary.prediction_failures,
            summary.deadline_misses
        );
        Ok(summary)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            ticks: self.frames.len(),
            restricted_ticks: self.counters.restricted_ticks,
            prediction_failures: self.counters.prediction_failures,
            deadline_misses: self.counters.deadline_misses,
            stopped: self.stopped,
            critical_density: self.threshold,
            real: self.metrics.latest(Scenario::Real).cloned(),
            optimized: self.metrics.latest(Scenario::Optimized).cloned(),
            improvement: ImprovementReport::from_frames(
                &self.segment_id,
                self.threshold.value,
                self.policy.speed_limit(PolicyAction::Normal),
                &self.frames,
            ),
        }
    }
}

impl std::fmt::Debug for DualSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualSimulator")
            .field("segment_id", &self.segment_id)
            .field("cursor", &self.cursor)
            .field("ticks", &self.samples.len())
            .field("action", &self.action)
            .field("halted", &self.halted)
            .finish()
    }
}
