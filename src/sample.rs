//! Sensor samples and their validation.

use crate::config::CleaningConfig;
use crate::error::Rejection;
use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Formats accepted for timestamps, tried in order.
const TIMESTAMP_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Speeds above this are free flowing, in km/h.
const FREE_FLOW_SPEED: f64 = 70.0;

/// Speeds at or below this are congested, in km/h.
const CONGESTED_SPEED: f64 = 40.0;

/// One cleaned, fixed-interval reading of a segment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    #[serde(with = "timestamp_format")]
    pub timestamp: NaiveDateTime,
    pub segment_id: String,
    /// Traffic intensity in veh/h.
    pub intensity: f64,
    /// Density in veh/km.
    pub density: f64,
    /// Mean speed in km/h.
    pub speed: f64,
    pub is_holiday: bool,
    pub is_raining: bool,
}

/// An unvalidated record as it appears in a sensor export.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    #[serde(alias = "fecha")]
    pub timestamp: Option<String>,
    #[serde(alias = "id")]
    pub segment_id: Option<String>,
    #[serde(alias = "intensidad")]
    pub intensity: Option<f64>,
    pub density: Option<f64>,
    #[serde(alias = "vmed")]
    pub speed: Option<f64>,
    #[serde(alias = "ocupacion")]
    pub occupancy: Option<f64>,
    pub is_holiday: Option<bool>,
    pub is_raining: Option<bool>,
}

/// Level of service of a speed reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelOfService {
    Free,
    Dense,
    Congested,
}

impl LevelOfService {
    pub fn from_speed(speed: f64) -> Self {
        if speed > FREE_FLOW_SPEED {
            LevelOfService::Free
        } else if speed > CONGESTED_SPEED {
            LevelOfService::Dense
        } else {
            LevelOfService::Congested
        }
    }
}

impl SensorSample {
    pub fn weekday(&self) -> Weekday {
        self.timestamp.weekday()
    }

    /// Whether the sample falls in a weekday rush hour (07:00–10:00 or 17:00–20:00).
    pub fn is_rush_hour(&self) -> bool {
        let workday = self.weekday().num_days_from_monday() < 5;
        let hour = self.timestamp.hour();
        workday && ((7..10).contains(&hour) || (17..20).contains(&hour))
    }

    pub fn level_of_service(&self) -> LevelOfService {
        LevelOfService::from_speed(self.speed)
    }

    /// Number of vehicles passing during an interval of the given length.
    pub fn vehicles_over(&self, hours: f64) -> f64 {
        self.intensity * hours
    }
}

/// The outcome of cleaning a batch of records.
#[derive(Clone, Debug, Default)]
pub struct Cleaned {
    /// Valid samples, ordered by segment then timestamp.
    pub samples: Vec<SensorSample>,
    /// Rejected records by their position in the input.
    pub rejections: Vec<(usize, Rejection)>,
}

impl Cleaned {
    pub fn rejected(&self) -> usize {
        self.rejections.len()
    }

    /// Number of rejections per cause.
    pub fn reasons(&self) -> BTreeMap<&'static str, usize> {
        let mut reasons = BTreeMap::new();
        for (_, rejection) in &self.rejections {
            *reasons.entry(rejection.label()).or_insert(0) += 1;
        }
        reasons
    }

    /// The valid samples, or the first rejection as an error.
    pub fn strict(self) -> Result<Vec<SensorSample>, crate::error::Error> {
        match self.rejections.into_iter().next() {
            Some((record, reason)) => Err(crate::error::Error::MalformedSample { record, reason }),
            None => Ok(self.samples),
        }
    }
}

/// Validates a batch of records. Invalid records are rejected and counted, never coerced.
pub fn clean(
    records: impl IntoIterator<Item = Result<RawSample, Rejection>>,
    config: &CleaningConfig,
) -> Cleaned {
    let mut rejections = vec![];
    let mut valid = vec![];

    for (idx, record) in records.into_iter().enumerate() {
        match record.and_then(|raw| validate(&raw, config)) {
            Ok(sample) => valid.push((idx, sample)),
            Err(reason) => {
                log::debug!("Rejected record {}: {}", idx, reason);
                rejections.push((idx, reason));
            }
        }
    }

    valid.sort_by(|(_, a), (_, b)| {
        (&a.segment_id, a.timestamp).cmp(&(&b.segment_id, b.timestamp))
    });

    let mut samples: Vec<SensorSample> = Vec::with_capacity(valid.len());
    for (idx, sample) in valid {
        let duplicate = samples.last().map_or(false, |last| {
            last.segment_id == sample.segment_id && last.timestamp == sample.timestamp
        });
        if duplicate {
            log::debug!("Rejected record {}: {}", idx, Rejection::Duplicate);
            rejections.push((idx, Rejection::Duplicate));
        } else {
            samples.push(sample);
        }
    }
    rejections.sort_by_key(|(idx, _)| *idx);

    let cleaned = Cleaned {
        samples,
        rejections,
    };
    if cleaned.rejected() > 0 {
        log::warn!(
            "Rejected {} of {} records: {:?}",
            cleaned.rejected(),
            cleaned.rejected() + cleaned.samples.len(),
            cleaned.reasons()
        );
    }
    cleaned
}

/// Validates a single record, deriving its density if the export does not carry one.
pub fn validate(raw: &RawSample, config: &CleaningConfig) -> Result<SensorSample, Rejection> {
    let timestamp = raw
        .timestamp
        .as_deref()
        .ok_or(Rejection::MissingField("timestamp"))?;
    let timestamp =
        parse_timestamp(timestamp).ok_or_else(|| Rejection::BadTimestamp(timestamp.to_string()))?;
    let segment_id = raw
        .segment_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(Rejection::MissingField("segment_id"))?;
    let intensity = raw.intensity.ok_or(Rejection::MissingField("intensity"))?;
    let speed = raw.speed.ok_or(Rejection::MissingField("speed"))?;

    check_bounds("intensity", intensity, config.max_intensity)?;
    check_bounds("speed", speed, config.max_speed)?;
    if speed == 0.0 && intensity > 0.0 {
        return Err(Rejection::StoppedWithFlow(intensity));
    }

    let density = match raw.density {
        Some(density) => {
            check_bounds("density", density, config.max_density)?;
            density
        }
        None => derive_density(intensity, speed, raw.occupancy, config),
    };

    Ok(SensorSample {
        timestamp,
        segment_id: segment_id.to_string(),
        intensity,
        density,
        speed,
        is_holiday: raw.is_holiday.unwrap_or(false),
        is_raining: raw.is_raining.unwrap_or(false),
    })
}

fn check_bounds(field: &'static str, value: f64, max: f64) -> Result<(), Rejection> {
    if value.is_finite() && (0.0..=max).contains(&value) {
        Ok(())
    } else {
        Err(Rejection::OutOfBounds {
            field,
            value,
            min: 0.0,
            max,
        })
    }
}

/// k = q / v in free flow; near standstill q / v is unreliable, so occupancy is used
/// when the export has it.
fn derive_density(intensity: f64, speed: f64, occupancy: Option<f64>, config: &CleaningConfig) -> f64 {
    let from_flow = intensity / f64::max(speed, config.low_speed_threshold);
    let density = match occupancy {
        Some(occupancy) if speed <= config.low_speed_threshold && occupancy.is_finite() => {
            occupancy.max(0.0) * config.occupancy_factor
        }
        _ => from_flow,
    };
    density.min(config.max_density)
}

pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
}

/// Splits samples into per-segment series, each ordered by timestamp.
pub fn split_by_segment(samples: &[SensorSample]) -> BTreeMap<String, Vec<SensorSample>> {
    let mut segments: BTreeMap<String, Vec<SensorSample>> = BTreeMap::new();
    for sample in samples {
        segments
            .entry(sample.segment_id.clone())
            .or_default()
            .push(sample.clone());
    }
    for series in segments.values_mut() {
        series.sort_by_key(|s| s.timestamp);
    }
    segments
}

/// Serde adapter writing timestamps as `%Y-%m-%d %H:%M:%S`.
pub mod timestamp_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&ts.format(super::TIMESTAMP_FORMATS[0]))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_timestamp(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("unrecognised timestamp `{}`", text)))
    }
}
