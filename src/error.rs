use crate::metrics::Scenario;
use crate::util::Interval;
use chrono::NaiveDateTime;
use std::time::Duration;

/// Errors raised by the engine.
///
/// Fit-time (`InsufficientData`, `NoCollapsePoint`) and prediction-time
/// (`ModelUnavailable`, `PredictionOutOfRange`, `InferenceTimeout`) errors have
/// documented fallbacks. `SimulationDivergence` is fatal for the run.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Insufficient data: {valid} valid samples spanning {span:.1} veh/km, need {min_samples} spanning {min_span:.1} veh/km")]
    InsufficientData {
        valid: usize,
        span: f64,
        min_samples: usize,
        min_span: f64,
    },
    #[error("No collapse point: fitted curve has no interior maximum within {range:?}")]
    NoCollapsePoint { range: Interval<f64> },
    #[error("No forecasting model loaded")]
    ModelUnavailable,
    #[error("Model expects a window of {expected} densities but the engine provides {actual}")]
    IncompatibleModel { expected: usize, actual: usize },
    #[error("Predicted density {density:.2} veh/km outside [0, {ceiling:.2}]")]
    PredictionOutOfRange { density: f64, ceiling: f64 },
    #[error("Inference missed its {0:?} deadline")]
    InferenceTimeout(Duration),
    #[error("Forecasting worker is gone")]
    WorkerDisconnected,
    #[error("Malformed sample at record {record}: {reason}")]
    MalformedSample { record: usize, reason: Rejection },
    #[error("Dataset contains no usable samples")]
    EmptyDataset,
    #[error("Vehicle count diverged by {drift:.6} vehicles in the {scenario} scenario at {timestamp}")]
    SimulationDivergence {
        scenario: Scenario,
        timestamp: NaiveDateTime,
        drift: f64,
    },
    #[error("Simulation halted after a fatal error; reset it to continue")]
    Halted,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("TOML deserialization error: {0}")]
    TomlDeError(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerError(#[from] toml::ser::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Why an ingested record was rejected.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Rejection {
    #[error("record could not be parsed: {0}")]
    Unparseable(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("unrecognised timestamp `{0}`")]
    BadTimestamp(String),
    #[error("`{field}` = {value} outside [{min}, {max}]")]
    OutOfBounds {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("zero speed reported with intensity {0}")]
    StoppedWithFlow(f64),
    #[error("duplicate timestamp for segment")]
    Duplicate,
}

impl Rejection {
    /// A short, stable label used to count rejections by cause.
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::Unparseable(_) => "unparseable",
            Rejection::MissingField(_) => "missing_field",
            Rejection::BadTimestamp(_) => "bad_timestamp",
            Rejection::OutOfBounds { .. } => "out_of_bounds",
            Rejection::StoppedWithFlow(_) => "stopped_with_flow",
            Rejection::Duplicate => "duplicate",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
