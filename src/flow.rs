//! Fundamental diagram calibration.

use crate::config::FitConfig;
use crate::error::{Error, Result};
use crate::math::{fit_parabola_through_origin, percentile, Parabola};
use crate::sample::SensorSample;
use crate::util::Interval;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Densities below this are treated as an empty road, in veh/km.
const EMPTY_DENSITY: f64 = 1e-9;

/// Relative slack when checking that speed does not rise between knots.
const SPEED_TOLERANCE: f64 = 1e-9;

/// Quantile of observed intensity reported as the empirical capacity.
const CAPACITY_QUANTILE: f64 = 0.99;

/// The family of curve fitted to intensity–density observations.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelFamily {
    /// A parabola through the origin, `q = vf·k·(1 − k / kj)`.
    Greenshields,
    /// Mean intensity per density bin, joined by straight lines.
    BinnedPeak { bin_width: f64 },
}

/// The fitted intensity curve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Curve {
    Parabolic(Parabola),
    /// Knots `(density, intensity)` in ascending density, starting at the origin and
    /// ending at the jam density.
    Binned { knots: Vec<(f64, f64)>, peak: usize },
}

/// An immutable fitted intensity–density relationship for one segment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FundamentalDiagram {
    curve: Curve,
    /// Densities seen during calibration, in veh/km.
    observed: Interval<f64>,
    /// Density at which the curve returns to zero flow, in veh/km.
    jam_density: f64,
    /// The p99 of observed intensity, in veh/h.
    observed_capacity: f64,
}

/// Where a critical density came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdSource {
    Fitted,
    Default,
}

/// The density threshold handed to the speed policy.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CriticalDensity {
    pub value: f64,
    pub source: ThresholdSource,
}

/// Fits fundamental diagrams from historical samples.
#[derive(Clone, Debug)]
pub struct FlowModel {
    config: FitConfig,
    /// Used to close binned curves and as a fallback for monotonic parabolas, in veh/km.
    jam_density: f64,
}

impl FlowModel {
    pub fn new(config: FitConfig, jam_density: f64) -> Self {
        Self {
            config,
            jam_density,
        }
    }

    /// Fits a fundamental diagram to the samples of one segment.
    ///
    /// Samples with a non-finite or negative density or intensity are ignored. The fit is
    /// deterministic: the same samples and configuration always give the same curve.
    pub fn fit(&self, samples: &[SensorSample]) -> Result<FundamentalDiagram> {
        let points: Vec<(f64, f64)> = samples
            .iter()
            .map(|s| (s.density, s.intensity))
            .filter(|(k, q)| k.is_finite() && q.is_finite() && *k >= 0.0 && *q >= 0.0)
            .collect();

        let observed = Interval::spanning(points.iter().map(|(k, _)| *k));
        let span = observed.map_or(0.0, |range| range.length());
        if points.len() < self.config.min_samples || span < self.config.min_density_span {
            return Err(self.insufficient(points.len(), span));
        }
        let observed = observed.ok_or_else(|| self.insufficient(points.len(), span))?;
        let observed_capacity =
            percentile(points.iter().map(|(_, q)| *q), CAPACITY_QUANTILE).unwrap_or(0.0);

        let (curve, jam_density) = match self.config.family {
            ModelFamily::Greenshields => {
                let parabola = fit_parabola_through_origin(points.iter().copied())
                    .ok_or_else(|| self.insufficient(points.len(), span))?;
                let jam_density = parabola
                    .root()
                    .filter(|root| *root > 0.0 && parabola.b < 0.0)
                    .unwrap_or(self.jam_density);
                (Curve::Parabolic(parabola), jam_density)
            }
            ModelFamily::BinnedPeak { bin_width } => {
                if !(bin_width.is_finite() && bin_width > 0.0) {
                    return Err(Error::InvalidConfig(format!(
                        "bin width must be a positive number, got {}",
                        bin_width
                    )));
                }
                let jam_density = f64::max(self.jam_density, observed.max + bin_width);
                (binned_curve(&points, bin_width, jam_density), jam_density)
            }
        };

        let diagram = FundamentalDiagram {
            curve,
            observed,
            jam_density,
            observed_capacity,
        };
        match diagram.critical_density() {
            Ok(kc) => log::info!(
                "Fitted {:?} diagram to {} samples: critical density {:.1} veh/km, capacity {:.0} veh/h",
                self.config.family,
                points.len(),
                kc,
                diagram.capacity()
            ),
            Err(err) => log::warn!("Fitted {:?} diagram to {} samples: {}", self.config.family, points.len(), err),
        }
        Ok(diagram)
    }

    fn insufficient(&self, valid: usize, span: f64) -> Error {
        Error::InsufficientData {
            valid,
            span,
            min_samples: self.config.min_samples,
            min_span: self.config.min_density_span,
        }
    }
}

/// Averages density and intensity per bin and closes the curve at the origin and jam density.
fn binned_curve(points: &[(f64, f64)], bin_width: f64, jam_density: f64) -> Curve {
    let mut bins: BTreeMap<u64, (f64, f64, usize)> = BTreeMap::new();
    for (k, q) in points {
        let bin = bins.entry((k / bin_width).floor() as u64).or_insert((0.0, 0.0, 0));
        bin.0 += k;
        bin.1 += q;
        bin.2 += 1;
    }

    let mut knots = vec![(0.0, 0.0)];
    let mut peak = 0;
    for (sum_k, sum_q, count) in bins.into_values() {
        let knot = (sum_k / count as f64, sum_q / count as f64);
        if knot.0 <= knots[knots.len() - 1].0 {
            continue;
        }
        if knot.1 > knots[peak].1 {
            peak = knots.len();
        }
        knots.push(knot);
    }
    knots.push((jam_density, 0.0));
    Curve::Binned { knots, peak }
}

impl FundamentalDiagram {
    /// A Greenshields diagram with the given free-flow speed (km/h) and jam density (veh/km).
    pub fn greenshields(free_flow_speed: f64, jam_density: f64) -> Self {
        let parabola = Parabola {
            a: free_flow_speed,
            b: -free_flow_speed / jam_density,
        };
        Self {
            curve: Curve::Parabolic(parabola),
            observed: Interval::new(0.0, jam_density),
            jam_density,
            observed_capacity: parabola.y(0.5 * jam_density),
        }
    }

    pub fn curve(&self) -> &Curve {
        &self.curve
    }

    /// The range of densities seen during calibration.
    pub fn observed_range(&self) -> Interval<f64> {
        self.observed
    }

    pub fn jam_density(&self) -> f64 {
        self.jam_density
    }

    /// The p99 of observed intensity, in veh/h.
    pub fn observed_capacity(&self) -> f64 {
        self.observed_capacity
    }

    /// Intensity (veh/h) at the given density (veh/km). Never negative.
    pub fn intensity(&self, density: f64) -> f64 {
        let q = match &self.curve {
            Curve::Parabolic(parabola) => parabola.y(density),
            Curve::Binned { knots, .. } => interpolate(knots, density),
        };
        q.max(0.0)
    }

    /// Mean speed (km/h) at the given density (veh/km).
    pub fn speed(&self, density: f64) -> f64 {
        if density <= EMPTY_DENSITY {
            self.free_flow_speed()
        } else {
            self.intensity(density) / density
        }
    }

    /// Speed on an empty road, in km/h.
    pub fn free_flow_speed(&self) -> f64 {
        match &self.curve {
            Curve::Parabolic(parabola) => parabola.dy(0.0).max(0.0),
            Curve::Binned { knots, .. } => {
                let (k, q) = knots[1];
                if k > 0.0 {
                    q / k
                } else {
                    0.0
                }
            }
        }
    }

    /// The density maximizing the fitted curve, in veh/km.
    ///
    /// Fails with [`Error::NoCollapsePoint`] if the curve has no maximum strictly inside
    /// the observed density range, e.g. because the data never reached congestion.
    pub fn critical_density(&self) -> Result<f64> {
        let kc = match &self.curve {
            Curve::Parabolic(parabola) => parabola.vertex().filter(|_| parabola.a > 0.0),
            Curve::Binned { knots, peak } => {
                let interior = *peak > 1 && *peak + 2 < knots.len();
                interior.then(|| knots[*peak].0)
            }
        };
        kc.filter(|kc| self.observed.contains_strictly(*kc))
            .ok_or(Error::NoCollapsePoint {
                range: self.observed,
            })
    }

    /// Resolves the critical density, falling back to `default` when there is no collapse point.
    pub fn threshold(&self, default: f64) -> CriticalDensity {
        match self.critical_density() {
            Ok(value) => CriticalDensity {
                value,
                source: ThresholdSource::Fitted,
            },
            Err(err) => {
                log::warn!("{}; using default critical density {:.1} veh/km", err, default);
                CriticalDensity {
                    value: default,
                    source: ThresholdSource::Default,
                }
            }
        }
    }

    /// Whether speed never rises with density and flow vanishes at the jam density.
    ///
    /// Least squares can produce curves that only make sense inside the observed range,
    /// e.g. an upward-opening parabola fitted to free-flow data. Those must not drive a
    /// simulation.
    pub fn is_physical(&self) -> bool {
        match &self.curve {
            Curve::Parabolic(parabola) => parabola.a > 0.0 && parabola.b < 0.0,
            Curve::Binned { knots, .. } => {
                self.free_flow_speed() > 0.0
                    && knots[1..].windows(2).all(|pair| {
                        let ((k0, q0), (k1, q1)) = (pair[0], pair[1]);
                        q1 * k0 <= q0 * k1 * (1.0 + SPEED_TOLERANCE)
                    })
            }
        }
    }

    /// The largest intensity on the curve, in veh/h.
    pub fn capacity(&self) -> f64 {
        match &self.curve {
            Curve::Parabolic(parabola) => match parabola.vertex() {
                Some(kc) if kc > 0.0 => parabola.y(kc),
                _ => self.intensity(self.observed.max),
            },
            Curve::Binned { knots, peak } => knots[*peak].1,
        }
    }
}

/// Piecewise-linear interpolation through knots sorted by x; zero outside them.
fn interpolate(knots: &[(f64, f64)], x: f64) -> f64 {
    let idx = knots.partition_point(|(kx, _)| *kx <= x);
    if idx == 0 || idx == knots.len() {
        return 0.0;
    }
    let (x0, y0) = knots[idx - 1];
    let (x1, y1) = knots[idx];
    y0 + (x - x0) / (x1 - x0) * (y1 - y0)
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use chrono::NaiveDate;

    fn samples(points: impl IntoIterator<Item = (f64, f64)>) -> Vec<SensorSample> {
        let start = NaiveDate::from_ymd_opt(2019, 1, 16)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap();
        points
            .into_iter()
            .enumerate()
            .map(|(i, (k, q))| SensorSample {
                timestamp: start + chrono::Duration::minutes(15 * i as i64),
                segment_id: "test".to_string(),
                intensity: q,
                density: k,
                speed: if k > 0.0 { q / k } else { 90.0 },
                is_holiday: false,
                is_raining: false,
            })
            .collect()
    }

    fn config(family: ModelFamily) -> FitConfig {
        FitConfig {
            family,
            min_samples: 10,
            min_density_span: 20.0,
            ..Default::default()
        }
    }

    #[test]
    fn greenshields_recovers_capacity_point() {
        let data = samples((1..=60).map(|i| {
            let k = i as f64 * 2.0;
            (k, 90.0 * k * (1.0 - k / 150.0))
        }));
        let diagram = FlowModel::new(config(ModelFamily::Greenshields), 180.0)
            .fit(&data)
            .unwrap();

        assert_approx_eq!(diagram.critical_density().unwrap(), 75.0, 1e-6);
        assert_approx_eq!(diagram.jam_density(), 150.0, 1e-6);
        assert_approx_eq!(diagram.free_flow_speed(), 90.0, 1e-6);
        assert_approx_eq!(diagram.capacity(), 90.0 * 75.0 * 0.5, 1e-3);
        assert!(diagram.speed(100.0) < diagram.speed(50.0));
    }

    #[test]
    fn free_flow_only_has_no_collapse_point() {
        let data = samples((1..=30).map(|i| {
            let k = i as f64;
            (k, 90.0 * k * (1.0 - k / 150.0))
        }));
        let diagram = FlowModel::new(config(ModelFamily::Greenshields), 180.0)
            .fit(&data)
            .unwrap();

        assert!(matches!(
            diagram.critical_density(),
            Err(Error::NoCollapsePoint { .. })
        ));
        let threshold = diagram.threshold(45.0);
        assert_eq!(threshold.source, ThresholdSource::Default);
        assert_eq!(threshold.value, 45.0);
    }

    #[test]
    fn too_few_samples() {
        let data = samples((1..=5).map(|i| (i as f64 * 20.0, 1000.0)));
        let err = FlowModel::new(config(ModelFamily::Greenshields), 180.0)
            .fit(&data)
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientData { valid: 5, .. }));
    }

    #[test]
    fn too_narrow_a_density_range() {
        let data = samples((0..40).map(|i| (30.0 + i as f64 * 0.1, 2000.0)));
        let err = FlowModel::new(config(ModelFamily::Greenshields), 180.0)
            .fit(&data)
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientData { valid: 40, .. }));
    }

    #[test]
    fn binned_peak_picks_the_busiest_bin() {
        let data = samples((0..100).map(|i| {
            let k = 1.0 + i as f64;
            (k, 90.0 * k * (1.0 - k / 100.0))
        }));
        let diagram = FlowModel::new(config(ModelFamily::BinnedPeak { bin_width: 5.0 }), 180.0)
            .fit(&data)
            .unwrap();

        // Bin [50, 55) holds the true maximum at k = 50.
        assert_approx_eq!(diagram.critical_density().unwrap(), 52.0);
        assert!(diagram.is_physical());
        assert_approx_eq!(diagram.intensity(0.0), 0.0);
        assert!(diagram.intensity(diagram.jam_density()) < 1e-9);
        assert!(diagram.capacity() > 2200.0);
    }

    #[test]
    fn binned_monotonic_data_has_no_collapse_point() {
        let data = samples((0..50).map(|i| (1.0 + i as f64, 60.0 * (1.0 + i as f64))));
        let diagram = FlowModel::new(config(ModelFamily::BinnedPeak { bin_width: 5.0 }), 180.0)
            .fit(&data)
            .unwrap();
        assert!(diagram.critical_density().is_err());
        assert!(diagram.is_physical());
    }

    #[test]
    fn rising_speed_is_not_physical() {
        let data = samples((0..60).map(|i| {
            let k = 5.0 + i as f64 * 35.0 / 59.0;
            (k, 80.0 * k + 0.05 * k * k)
        }));
        let diagram = FlowModel::new(config(ModelFamily::Greenshields), 180.0)
            .fit(&data)
            .unwrap();
        assert!(diagram.critical_density().is_err());
        assert!(!diagram.is_physical());

        let data = samples((0..50).map(|i| {
            let k = 1.0 + i as f64;
            (k, 40.0 * k + k * k)
        }));
        let diagram = FlowModel::new(config(ModelFamily::BinnedPeak { bin_width: 5.0 }), 180.0)
            .fit(&data)
            .unwrap();
        assert!(!diagram.is_physical());
    }

    #[test]
    fn rejects_empty_bins() {
        let data = samples((1..=60).map(|i| (i as f64, 80.0 * i as f64)));
        let err = FlowModel::new(config(ModelFamily::BinnedPeak { bin_width: 0.0 }), 180.0)
            .fit(&data)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    proptest::proptest! {
        #[test]
        fn critical_density_is_the_interior_maximum(
            free_flow_speed in 40.0f64..130.0,
            jam_density in 100.0f64..250.0,
            count in 50usize..200,
        ) {
            let step = (jam_density - 2.0) / count as f64;
            let data = samples((0..=count).map(|i| {
                let k = 1.0 + i as f64 * step;
                (k, free_flow_speed * k * (1.0 - k / jam_density))
            }));
            let diagram = FlowModel::new(config(ModelFamily::Greenshields), 180.0)
                .fit(&data)
                .unwrap();

            let kc = diagram.critical_density().unwrap();
            proptest::prop_assert!(diagram.observed_range().contains_strictly(kc));
            proptest::prop_assert!((kc - jam_density / 2.0).abs() < 1e-6 * jam_density);
            for offset in [-10.0, -1.0, 1.0, 10.0] {
                proptest::prop_assert!(diagram.intensity(kc + offset) < diagram.intensity(kc));
            }
        }
    }
}
