//! Density forecasting behind a fixed feature-window contract.

pub use worker::{Inference, PredictorWorker};

use crate::config::PredictorConfig;
use crate::error::{Error, Result};
use crate::sample::SensorSample;
use chrono::{NaiveDateTime, Weekday};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::path::Path;

mod worker;

/// Recent history and calendar context handed to a forecaster.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureWindow {
    /// Timestamp of the most recent sample in the window.
    pub made_at: NaiveDateTime,
    /// Densities in veh/km, oldest first.
    pub lags: SmallVec<[f64; 8]>,
    pub weekday: Weekday,
    pub is_holiday: bool,
    pub is_raining: bool,
    pub is_rush_hour: bool,
}

impl FeatureWindow {
    /// Builds a window from the last `len` samples of `history`.
    ///
    /// A history shorter than the window is padded with its oldest density. Returns
    /// `None` if the history or the window is empty.
    pub fn from_history(history: &[SensorSample], len: usize) -> Option<Self> {
        let latest = history.last()?;
        let recent = &history[history.len().saturating_sub(len)..];
        let oldest = recent.first()?.density;
        let mut lags: SmallVec<[f64; 8]> = SmallVec::with_capacity(len);
        lags.extend(std::iter::repeat(oldest).take(len - recent.len()));
        lags.extend(recent.iter().map(|s| s.density));
        Some(Self {
            made_at: latest.timestamp,
            lags,
            weekday: latest.weekday(),
            is_holiday: latest.is_holiday,
            is_raining: latest.is_raining,
            is_rush_hour: latest.is_rush_hour(),
        })
    }

    /// The most recent density in the window.
    pub fn latest(&self) -> f64 {
        self.lags.last().copied().unwrap_or(0.0)
    }
}

/// A density forecast for one horizon.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DensityForecast {
    #[serde(with = "crate::sample::timestamp_format")]
    pub made_at: NaiveDateTime,
    pub horizon_minutes: u32,
    /// In veh/km.
    pub predicted_density: f64,
}

/// A trained forecasting model. The engine only relies on its window length.
pub trait Forecaster: Send {
    /// The number of density lags the model expects.
    fn window_len(&self) -> usize;

    /// Predicts the density one horizon after the end of the window, in veh/km.
    fn forecast(&self, window: &FeatureWindow) -> f64;
}

/// A linear model over lags and calendar flags.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub intercept: f64,
    /// One weight per lag, oldest first.
    pub lag_weights: Vec<f64>,
    /// Offsets from Monday to Sunday.
    #[serde(default)]
    pub weekday_weights: [f64; 7],
    #[serde(default)]
    pub holiday_weight: f64,
    #[serde(default)]
    pub rain_weight: f64,
    #[serde(default)]
    pub rush_hour_weight: f64,
}

impl Forecaster for LinearModel {
    fn window_len(&self) -> usize {
        self.lag_weights.len()
    }

    fn forecast(&self, window: &FeatureWindow) -> f64 {
        let flag = |set: bool, weight: f64| if set { weight } else { 0.0 };
        let lags: f64 = self
            .lag_weights
            .iter()
            .zip(&window.lags)
            .map(|(w, k)| w * k)
            .sum();
        self.intercept
            + lags
            + self.weekday_weights[window.weekday.num_days_from_monday() as usize]
            + flag(window.is_holiday, self.holiday_weight)
            + flag(window.is_raining, self.rain_weight)
            + flag(window.is_rush_hour, self.rush_hour_weight)
    }
}

/// Predicts that the latest density persists.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistenceModel {
    pub window: usize,
}

impl Forecaster for PersistenceModel {
    fn window_len(&self) -> usize {
        self.window
    }

    fn forecast(&self, window: &FeatureWindow) -> f64 {
        window.latest()
    }
}

/// A serialized model as produced by the training pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelArtifact {
    Linear(LinearModel),
    Persistence(PersistenceModel),
}

impl ModelArtifact {
    pub fn load(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        Self::load(&std::fs::read_to_string(path)?)
    }

    pub fn into_forecaster(self) -> Box<dyn Forecaster> {
        match self {
            ModelArtifact::Linear(model) => Box::new(model),
            ModelArtifact::Persistence(model) => Box::new(model),
        }
    }
}

/// Wraps a forecaster and rejects physically impossible forecasts.
pub struct DensityPredictor {
    model: Option<Box<dyn Forecaster>>,
    window_len: usize,
    horizon_minutes: u32,
    /// Largest plausible forecast, in veh/km.
    ceiling: f64,
}

impl DensityPredictor {
    /// Creates a predictor with no model loaded.
    ///
    /// # Parameters
    /// * `historical_max_density` - The largest density seen in calibration data, in veh/km.
    pub fn new(config: &PredictorConfig, historical_max_density: f64) -> Self {
        Self {
            model: None,
            window_len: config.window,
            horizon_minutes: config.horizon_minutes,
            ceiling: config.ceiling_factor * historical_max_density,
        }
    }

    /// Loads a model, replacing any current one. Fails if the model expects a different
    /// window length than the engine provides.
    pub fn load(&mut self, model: Box<dyn Forecaster>) -> Result<()> {
        if model.window_len() != self.window_len {
            return Err(Error::IncompatibleModel {
                expected: model.window_len(),
                actual: self.window_len,
            });
        }
        self.model = Some(model);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }

    pub fn predict(&self, window: &FeatureWindow) -> Result<DensityForecast> {
        let model = self.model.as_ref().ok_or(Error::ModelUnavailable)?;
        if window.lags.len() != self.window_len {
            return Err(Error::IncompatibleModel {
                expected: self.window_len,
                actual: window.lags.len(),
            });
        }
        let density = model.forecast(window);
        if !(0.0..=self.ceiling).contains(&density) {
            return Err(Error::PredictionOutOfRange {
                density,
                ceiling: self.ceiling,
            });
        }
        Ok(DensityForecast {
            made_at: window.made_at,
            horizon_minutes: self.horizon_minutes,
            predicted_density: density,
        })
    }
}

impl std::fmt::Debug for DensityPredictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DensityPredictor")
            .field("loaded", &self.is_loaded())
            .field("window_len", &self.window_len)
            .field("horizon_minutes", &self.horizon_minutes)
            .field("ceiling", &self.ceiling)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use chrono::NaiveDate;

    pub(super) fn window(lags: &[f64]) -> FeatureWindow {
        FeatureWindow {
            made_at: NaiveDate::from_ymd_opt(2019, 1, 16)
                .and_then(|d| d.and_hms_opt(8, 0, 0))
                .unwrap(),
            lags: lags.iter().copied().collect(),
            weekday: Weekday::Wed,
            is_holiday: false,
            is_raining: true,
            is_rush_hour: true,
        }
    }

    fn predictor() -> DensityPredictor {
        DensityPredictor::new(&PredictorConfig::default(), 100.0)
    }

    #[test]
    fn no_model_loaded() {
        let err = predictor().predict(&window(&[1.0, 2.0, 3.0, 4.0])).unwrap_err();
        assert!(matches!(err, Error::ModelUnavailable));
    }

    #[test]
    fn rejects_mismatched_window() {
        let mut predictor = predictor();
        let err = predictor
            .load(Box::new(PersistenceModel { window: 6 }))
            .unwrap_err();
        assert!(matches!(err, Error::IncompatibleModel { expected: 6, actual: 4 }));
        assert!(!predictor.is_loaded());
    }

    #[test]
    fn rejects_impossible_forecasts() {
        let mut predictor = predictor();
        predictor.load(Box::new(PersistenceModel { window: 4 })).unwrap();

        let err = predictor.predict(&window(&[1.0, 2.0, 3.0, 301.0])).unwrap_err();
        assert!(matches!(err, Error::PredictionOutOfRange { .. }));
        let err = predictor.predict(&window(&[1.0, 2.0, 3.0, -1.0])).unwrap_err();
        assert!(matches!(err, Error::PredictionOutOfRange { .. }));
        let err = predictor.predict(&window(&[1.0, 2.0, 3.0, f64::NAN])).unwrap_err();
        assert!(matches!(err, Error::PredictionOutOfRange { .. }));

        let forecast = predictor.predict(&window(&[1.0, 2.0, 3.0, 40.0])).unwrap();
        assert_eq!(forecast.predicted_density, 40.0);
        assert_eq!(forecast.horizon_minutes, 15);
    }

    #[test]
    fn linear_model_from_json() {
        let artifact = ModelArtifact::load(
            r#"{
                "kind": "linear",
                "intercept": 2.0,
                "lag_weights": [0.1, 0.2, 0.3, 0.4],
                "weekday_weights": [0, 0, 1.5, 0, 0, -3, -4],
                "rain_weight": 0.5,
                "rush_hour_weight": 1.0
            }"#,
        )
        .unwrap();
        let model = artifact.into_forecaster();
        assert_eq!(model.window_len(), 4);
        // 2 + (1 + 4 + 9 + 16) / 10 + 1.5 + 0.5 + 1
        assert_approx_eq!(model.forecast(&window(&[10.0, 20.0, 30.0, 40.0])), 35.0);
    }

    #[test]
    fn window_pads_short_history() {
        let start = NaiveDate::from_ymd_opt(2019, 1, 19)
            .and_then(|d| d.and_hms_opt(8, 0, 0))
            .unwrap();
        let history: Vec<_> = [12.0, 18.0]
            .iter()
            .enumerate()
            .map(|(i, k)| SensorSample {
                timestamp: start + chrono::Duration::minutes(15 * i as i64),
                segment_id: "a".to_string(),
                intensity: k * 80.0,
                density: *k,
                speed: 80.0,
                is_holiday: true,
                is_raining: false,
            })
            .collect();

        let window = FeatureWindow::from_history(&history, 4).unwrap();
        assert_eq!(window.lags.as_slice(), &[12.0, 12.0, 12.0, 18.0]);
        assert_eq!(window.made_at, history[1].timestamp);
        assert_eq!(window.weekday, Weekday::Sat);
        assert!(window.is_holiday);
        assert!(!window.is_rush_hour);

        let window = FeatureWindow::from_history(&history, 1).unwrap();
        assert_eq!(window.lags.as_slice(), &[18.0]);
        assert!(FeatureWindow::from_history(&[], 4).is_none());
    }
}
