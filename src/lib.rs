//! A variable speed limit engine for a congestion-prone highway segment.
//!
//! Fits a fundamental diagram to historical sensor data, forecasts density, decides a
//! speed limit and simulates the segment with and without that limit side by side.

pub use config::Config;
pub use error::{Error, Rejection, Result};
pub use flow::{CriticalDensity, FlowModel, FundamentalDiagram, ModelFamily, ThresholdSource};
pub use live::{LiveFeed, LiveView, SimulationControl};
pub use metrics::{ImprovementReport, MetricsAggregator, MetricsSnapshot, Scenario};
pub use policy::{PolicyAction, SpeedPolicy};
pub use predictor::{DensityForecast, DensityPredictor, FeatureWindow, Forecaster, Inference};
pub use sample::{Cleaned, RawSample, SensorSample};
pub use simulation::{calibrate, Calibration, DualSimulator, Frame, OutputRecord, RunSummary};
pub use state::{Boundary, Cell, StepReport, TrafficSnapshot, TrafficState};
pub use util::Interval;

pub mod config;
pub mod dataset;
mod error;
pub mod flow;
pub mod live;
pub mod math;
pub mod metrics;
pub mod policy;
pub mod predictor;
pub mod sample;
mod simulation;
pub mod state;
pub mod synthetic;
mod util;
