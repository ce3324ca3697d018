//! Reading sensor exports and writing result tables as CSV.

use crate::config::CleaningConfig;
use crate::error::{Error, Result, Rejection};
use crate::sample::{clean, Cleaned, RawSample, SensorSample};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

/// Reads and cleans a sensor export. Records that cannot be parsed are rejected like
/// any other invalid record. Fails with [`Error::EmptyDataset`] if nothing is left.
pub fn read_samples(reader: impl Read, config: &CleaningConfig) -> Result<Cleaned> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(config.delimiter as u8)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let records = reader
        .deserialize::<RawSample>()
        .map(|record| record.map_err(|err| Rejection::Unparseable(err.to_string())));
    let cleaned = clean(records, config);
    if cleaned.samples.is_empty() {
        return Err(Error::EmptyDataset);
    }
    log::info!(
        "Loaded {} samples ({} rejected)",
        cleaned.samples.len(),
        cleaned.rejected()
    );
    Ok(cleaned)
}

pub fn load_samples(path: &Path, config: &CleaningConfig) -> Result<Cleaned> {
    log::info!("Reading {}", path.display());
    read_samples(std::fs::File::open(path)?, config)
}

#[derive(Debug, Deserialize)]
struct BaseLimitRecord {
    #[serde(alias = "id")]
    segment_id: String,
    /// In km/h.
    #[serde(alias = "inferred_limit")]
    base_limit: f64,
}

/// Reads a comma separated table of per-segment base speed limits, with columns
/// `segment_id, base_limit` (or `id, inferred_limit`). Limits that are not positive
/// are skipped.
pub fn read_base_limits(reader: impl Read) -> Result<BTreeMap<String, f64>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut limits = BTreeMap::new();
    for record in reader.deserialize::<BaseLimitRecord>() {
        let record = record?;
        if record.base_limit.is_finite() && record.base_limit > 0.0 {
            limits.insert(record.segment_id, record.base_limit);
        } else {
            log::warn!(
                "Ignoring base limit {} of segment {}",
                record.base_limit,
                record.segment_id
            );
        }
    }
    Ok(limits)
}

pub fn load_base_limits(path: &Path) -> Result<BTreeMap<String, f64>> {
    let limits = read_base_limits(std::fs::File::open(path)?)?;
    log::info!("Loaded base limits of {} segments from {}", limits.len(), path.display());
    Ok(limits)
}

/// Writes rows with a header line, using the given field delimiter.
pub fn write_rows<T: Serialize>(writer: impl Write, rows: &[T], delimiter: u8) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(writer);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn save_rows<T: Serialize>(path: &Path, rows: &[T], delimiter: u8) -> Result<()> {
    write_rows(std::fs::File::create(path)?, rows, delimiter)?;
    log::info!("Wrote {} rows to {}", rows.len(), path.display());
    Ok(())
}

/// Writes samples in the format [read_samples] accepts.
pub fn save_samples(path: &Path, samples: &[SensorSample], config: &CleaningConfig) -> Result<()> {
    save_rows(path, samples, config.delimiter as u8)
}
