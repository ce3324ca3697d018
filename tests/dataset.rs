//! Tests that read and write CSV files.

use traffic_vsl::dataset::{load_samples, save_rows, save_samples};
use traffic_vsl::synthetic::SyntheticSegment;
use traffic_vsl::{Config, Error, OutputRecord};

/// Test that generated samples survive a trip through a CSV file.
#[test]
fn samples_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("samples.csv");
    let config = Config::default();
    let samples = SyntheticSegment::default().days(1);

    save_samples(&path, &samples, &config.cleaning).unwrap();
    let cleaned = load_samples(&path, &config.cleaning).unwrap();

    assert_eq!(cleaned.rejected(), 0);
    assert_eq!(cleaned.samples.len(), samples.len());
    for (read, written) in cleaned.samples.iter().zip(&samples) {
        assert_eq!(read.timestamp, written.timestamp);
        assert_eq!(read.segment_id, written.segment_id);
        assert!((read.density - written.density).abs() < 1e-9);
        assert!((read.speed - written.speed).abs() < 1e-9);
    }
}

/// Test the layout of the output dataset.
#[test]
fn output_dataset_columns() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.csv");
    let records = vec![OutputRecord {
        timestamp: SyntheticSegment::default().start,
        segment_id: "3455".to_string(),
        observed_speed: 62.5,
        optimal_speed: 70.0,
    }];

    save_rows(&path, &records, b',').unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("timestamp,segment_id,observed_speed,optimal_speed"));
    assert_eq!(lines.next(), Some("2019-01-14 00:00:00,3455,62.5,70.0"));
}

/// Test that a missing file is reported, not swallowed.
#[test]
fn missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_samples(&dir.path().join("absent.csv"), &Default::default()).unwrap_err();
    assert!(matches!(err, Error::IoError(_)));
}
