//! Deterministic synthetic sensor data for demos and tests.

use crate::sample::SensorSample;
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// A segment whose traffic follows a Greenshields diagram, with morning and evening peaks.
#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticSegment {
    pub segment_id: String,
    pub start: NaiveDateTime,
    pub interval_minutes: u32,
    /// In km/h.
    pub free_flow_speed: f64,
    /// In veh/km.
    pub jam_density: f64,
    /// Night-time density, in veh/km.
    pub base_density: f64,
    /// Density at the height of a peak, in veh/km.
    pub peak_density: f64,
    /// Standard deviation of the intensity noise, relative to the intensity.
    pub noise: f64,
    pub seed: u64,
}

impl Default for SyntheticSegment {
    fn default() -> Self {
        Self {
            segment_id: "synthetic".to_string(),
            // A Monday.
            start: NaiveDate::from_ymd_opt(2019, 1, 14)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .unwrap_or_default(),
            interval_minutes: 15,
            free_flow_speed: 95.0,
            jam_density: 180.0,
            base_density: 12.0,
            peak_density: 120.0,
            noise: 0.05,
            seed: 0x5eed,
        }
    }
}

impl SyntheticSegment {
    /// Density at a time of day, in veh/km. Peaks at 08:30 and 18:30.
    pub fn density_at(&self, time: NaiveDateTime) -> f64 {
        let hour = time.hour() as f64 + time.minute() as f64 / 60.0;
        let peak = |centre: f64| (-(hour - centre).powi(2) / (2.0 * 1.2f64.powi(2))).exp();
        let rise = self.peak_density - self.base_density;
        self.base_density + rise * f64::max(peak(8.5), peak(18.5))
    }

    /// Generates `n` consecutive days of samples. The same seed always gives the same data.
    pub fn days(&self, n: usize) -> Vec<SensorSample> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(self.seed);
        let noise = Normal::new(0.0, self.noise.max(0.0)).ok();
        let per_day = 24 * 60 / self.interval_minutes.max(1) as usize;
        let interval = chrono::Duration::minutes(self.interval_minutes as i64);

        (0..n * per_day)
            .map(|i| {
                let timestamp = self.start + interval * i as i32;
                let density = self.density_at(timestamp);
                let ideal = self.free_flow_speed * density * (1.0 - density / self.jam_density);
                let factor = noise.map_or(1.0, |n| 1.0 + n.sample(&mut rng));
                let intensity = (ideal * factor).max(0.0);
                SensorSample {
                    timestamp,
                    segment_id: self.segment_id.clone(),
                    intensity,
                    density,
                    speed: intensity / density,
                    is_holiday: false,
                    is_raining: false,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::FitConfig;
    use crate::flow::FlowModel;

    #[test]
    fn reproducible() {
        let segment = SyntheticSegment::default();
        assert_eq!(segment.days(2), segment.days(2));
        let other = SyntheticSegment {
            seed: 7,
            ..Default::default()
        };
        assert_ne!(segment.days(1), other.days(1));
    }

    #[test]
    fn one_sample_per_interval() {
        let samples = SyntheticSegment::default().days(2);
        assert_eq!(samples.len(), 192);
        assert!(samples.windows(2).all(|w| (w[1].timestamp - w[0].timestamp).num_minutes() == 15));
        assert!(samples.iter().all(|s| s.intensity >= 0.0 && s.density > 0.0));
    }

    #[test]
    fn fits_back_to_the_generating_diagram() {
        let samples = SyntheticSegment::default().days(7);
        let diagram = FlowModel::new(FitConfig::default(), 180.0).fit(&samples).unwrap();
        let kc = diagram.critical_density().unwrap();
        assert!((kc - 90.0).abs() < 10.0, "critical density {}", kc);
    }
}
