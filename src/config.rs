//! Engine configuration, loaded from TOML. Every section and field has a default, so a
//! configuration file only needs to name what it changes.

use crate::error::{Error, Result};
use crate::flow::ModelFamily;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub segment: SegmentConfig,
    pub cleaning: CleaningConfig,
    pub fit: FitConfig,
    pub predictor: PredictorConfig,
    pub policy: PolicyConfig,
    pub simulation: SimulationConfig,
    pub metrics: MetricsConfig,
}

/// Geometry and physics of the simulated segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Length of the segment in km.
    pub length_km: f64,
    /// Number of cells the segment is divided into.
    pub cells: usize,
    /// Density at which traffic stands still, in veh/km (all lanes).
    pub jam_density: f64,
    /// Fraction of capacity lost by a cell discharging from congestion.
    pub capacity_drop: f64,
}

/// Validation bounds applied when ingesting sensor records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningConfig {
    /// Maximum plausible speed in km/h.
    pub max_speed: f64,
    /// Maximum plausible intensity in veh/h.
    pub max_intensity: f64,
    /// Derived densities are capped at this value, in veh/km.
    pub max_density: f64,
    /// Below this speed (km/h) density is derived from occupancy rather than q / v.
    pub low_speed_threshold: f64,
    /// Converts an occupancy percentage into veh/km.
    pub occupancy_factor: f64,
    /// Field delimiter of the input CSV.
    pub delimiter: char,
}

/// Fundamental diagram calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Minimum number of valid samples required to fit.
    pub min_samples: usize,
    /// Minimum spread of observed densities in veh/km.
    pub min_density_span: f64,
    /// Threshold used when the fitted curve has no collapse point, in veh/km.
    pub default_critical_density: f64,
    /// Curve family; kept last so it serializes as a trailing table.
    pub family: ModelFamily,
}

/// Density forecasting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Number of past densities in a feature window.
    pub window: usize,
    /// How far ahead a forecast looks, in minutes.
    pub horizon_minutes: u32,
    /// Forecasts above this multiple of the historical maximum density are rejected.
    pub ceiling_factor: f64,
    /// Run inference on a worker thread.
    pub offload: bool,
    /// How long a tick waits for the worker, in ms.
    pub deadline_ms: u64,
}

/// Speed limit decision rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Once restricted, the forecast must fall below `critical × release_margin` to release.
    pub release_margin: f64,
    /// Posted limit without intervention, in km/h.
    pub normal_limit: f64,
    /// Posted limit while restricted, in km/h.
    pub restricted_limit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Spacing of the ground truth samples, in minutes.
    pub interval_minutes: u32,
    /// Largest tolerated vehicle count drift per step.
    pub divergence_tolerance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Travel times are capped at this value, which is also reported for standstill, in minutes.
    pub max_travel_time_minutes: f64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            length_km: 2.0,
            cells: 10,
            jam_density: 180.0,
            capacity_drop: 0.1,
        }
    }
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            max_speed: 150.0,
            max_intensity: 12_000.0,
            max_density: 500.0,
            low_speed_threshold: 10.0,
            occupancy_factor: 3.5,
            delimiter: ';',
        }
    }
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            min_samples: 50,
            min_density_span: 20.0,
            default_critical_density: 45.0,
            family: ModelFamily::Greenshields,
        }
    }
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            window: 4,
            horizon_minutes: 15,
            ceiling_factor: 3.0,
            offload: false,
            deadline_ms: 250,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            release_margin: 0.9,
            normal_limit: 90.0,
            restricted_limit: 70.0,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 15,
            divergence_tolerance: 1e-6,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_travel_time_minutes: 60.0,
        }
    }
}

impl PolicyConfig {
    /// The same policy on a road whose posted limit without intervention is `base_limit`.
    /// The restricted limit never exceeds the base limit.
    pub fn with_base_limit(&self, base_limit: f64) -> Self {
        Self {
            normal_limit: base_limit,
            restricted_limit: self.restricted_limit.min(base_limit),
            ..self.clone()
        }
    }
}

impl Config {
    pub fn load(data: &str) -> Result<Self> {
        let config: Self = toml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_file(path: &std::path::Path) -> Result<Self> {
        Self::load(&std::fs::read_to_string(path)?)
    }

    pub fn dump(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    pub fn dump_file(&self, path: &std::path::Path) -> Result<()> {
        Ok(std::fs::write(path, self.dump()?)?)
    }

    /// Length of one simulation tick in seconds.
    pub fn tick_seconds(&self) -> f64 {
        self.simulation.interval_minutes as f64 * 60.0
    }

    /// Rejects values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        let check = |ok: bool, msg: &str| {
            if ok {
                Ok(())
            } else {
                Err(Error::InvalidConfig(msg.to_string()))
            }
        };
        check(self.segment.length_km > 0.0, "segment.length_km must be positive")?;
        check(self.segment.cells > 0, "segment.cells must be at least 1")?;
        check(self.segment.jam_density > 0.0, "segment.jam_density must be positive")?;
        check(
            (0.0..1.0).contains(&self.segment.capacity_drop),
            "segment.capacity_drop must be in [0, 1)",
        )?;
        check(
            self.cleaning.delimiter.is_ascii(),
            "cleaning.delimiter must be an ASCII character",
        )?;
        if let ModelFamily::BinnedPeak { bin_width } = self.fit.family {
            check(
                bin_width.is_finite() && bin_width > 0.0,
                "fit.family.bin_width must be a positive number",
            )?;
        }
        check(self.predictor.window > 0, "predictor.window must be at least 1")?;
        check(
            self.predictor.ceiling_factor > 0.0,
            "predictor.ceiling_factor must be positive",
        )?;
        check(
            self.policy.release_margin > 0.0 && self.policy.release_margin <= 1.0,
            "policy.release_margin must be in (0, 1]",
        )?;
        check(
            self.policy.restricted_limit > 0.0
                && self.policy.restricted_limit <= self.policy.normal_limit,
            "policy.restricted_limit must be positive and not above policy.normal_limit",
        )?;
        check(
            self.simulation.interval_minutes > 0,
            "simulation.interval_minutes must be at least 1",
        )?;
        check(
            self.metrics.max_travel_time_minutes > 0.0,
            "metrics.max_travel_time_minutes must be positive",
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::load(
            r#"
            [policy]
            release_margin = 0.85

            [fit.family]
            kind = "binned_peak"
            bin_width = 5.0
            "#,
        )
        .unwrap();

        assert_eq!(config.policy.release_margin, 0.85);
        assert_eq!(config.policy.normal_limit, 90.0);
        assert_eq!(config.fit.family, ModelFamily::BinnedPeak { bin_width: 5.0 });
        assert_eq!(config.segment, SegmentConfig::default());
    }

    #[test]
    fn dump_round_trips() {
        let config = Config::default();
        assert_eq!(Config::load(&config.dump().unwrap()).unwrap(), config);
    }

    #[test]
    fn rejects_inverted_limits() {
        let err = Config::load("[policy]\nrestricted_limit = 120.0").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn rejects_empty_bins() {
        for width in ["0.0", "-5.0"] {
            let err = Config::load(&format!(
                "[fit.family]\nkind = \"binned_peak\"\nbin_width = {}",
                width
            ))
            .unwrap_err();
            assert!(matches!(err, Error::InvalidConfig(_)), "bin_width = {}", width);
        }

        let mut config = Config::default();
        config.fit.family = ModelFamily::BinnedPeak { bin_width: f64::NAN };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
