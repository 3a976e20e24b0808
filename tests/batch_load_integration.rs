//! Integration tests for batch loading
//!
//! These tests validate the stored-batch workflow end to end:
//! - Grouping listing from a directory of .jsonl files
//! - Catalog discovery and series registration
//! - Population, skipping of malformed records and progress reporting

mod common;

use common::builders::{write_groupings, RecordBuilder};
use datafeed_rs::batch::{BatchLoader, BatchSource, JsonLinesSource, LoadProgress};
use datafeed_rs::config::BatchConfig;
use datafeed_rs::store::SeriesStore;
use datafeed_rs::types::SamplePoint;
use datafeed_rs::DataFeedError;
use serde_json::json;
use tempfile::TempDir;

fn robot_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    let pose: Vec<_> = (0..5)
        .map(|i| {
            RecordBuilder::new(i as f64)
                .id(&format!("p{i}"))
                .field("pose/x", json!(i as f64 * 0.5))
                .field("pose/y", json!(1.0))
                .field("pose/frame", json!("map"))
                .build()
        })
        .collect();
    let battery: Vec<_> = (0..3)
        .map(|i| {
            RecordBuilder::new(10.0 + i as f64)
                .field("cells", json!([3.7, 3.8]))
                .build()
        })
        .collect();
    write_groupings(dir.path(), &[("pose", pose), ("battery", battery)]);
    dir
}

#[test]
fn test_groupings_listed_sorted() {
    let dir = robot_dir();
    let source = JsonLinesSource::open(dir.path()).unwrap();
    assert_eq!(source.groupings().unwrap(), vec!["battery", "pose"]);
    assert_eq!(source.record_count("pose").unwrap(), Some(5));
}

#[test]
fn test_load_all_groupings() {
    let dir = robot_dir();
    let source = JsonLinesSource::open(dir.path()).unwrap();
    let store = SeriesStore::new();
    let selection = source.groupings().unwrap();

    let report = BatchLoader::default()
        .load(&source, &selection, &store, None)
        .unwrap();

    assert_eq!(report.records_loaded, 8);
    assert_eq!(report.records_skipped, 0);
    // pose/{timestamp,x,y} + battery/{timestamp,cells.0,cells.1}
    assert_eq!(report.points_emitted, 5 * 3 + 3 * 3);
    assert!(store.contains("pose/pose/x"));
    assert!(store.contains("battery/cells.1"));
    // A scalar identifier is a plain (non-numeric) leaf
    assert_eq!(store.point_count("pose/_id"), Some(0));

    let x = store.snapshot("pose/pose/x").unwrap();
    assert_eq!(x.len(), 5);
    assert_eq!(x[4], SamplePoint::new(4.0, 2.0));

    // String leaves are cataloged but never get points
    assert!(report.catalog.iter().any(|e| e.name == "pose/pose/frame"));
    assert_eq!(store.point_count("pose/pose/frame"), Some(0));
}

#[test]
fn test_malformed_lines_are_skipped() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("g.jsonl"),
        "{\"timestamp\": 1, \"v\": 1}\nnot json\n{\"v\": 2}\n\n{\"timestamp\": 3, \"v\": 3}\n",
    )
    .unwrap();
    let source = JsonLinesSource::open(dir.path()).unwrap();
    let store = SeriesStore::new();

    let report = BatchLoader::default()
        .load(&source, &["g".to_string()], &store, None)
        .unwrap();

    assert_eq!(report.records_loaded, 2);
    assert_eq!(report.records_skipped, 2);
    let v = store.snapshot("g/v").unwrap();
    assert_eq!(v, vec![SamplePoint::new(1.0, 1.0), SamplePoint::new(3.0, 3.0)]);
}

#[test]
fn test_custom_conventions() {
    let dir = TempDir::new().unwrap();
    write_groupings(
        dir.path(),
        &[(
            "g",
            vec![json!({"t": 5.0, "key": {"a": 1}, "v": 7})],
        )],
    );
    let source = JsonLinesSource::open(dir.path()).unwrap();
    let store = SeriesStore::new();
    let config = BatchConfig {
        id_key: "key".into(),
        timestamp_field: "t".into(),
        ..BatchConfig::default()
    };

    BatchLoader::new(&config)
        .load(&source, &["g".to_string()], &store, None)
        .unwrap();

    assert!(!store.contains("g/key/a"));
    assert_eq!(store.snapshot("g/v").unwrap(), vec![SamplePoint::new(5.0, 7.0)]);
}

#[test]
fn test_progress_reaches_total() {
    let dir = robot_dir();
    let source = JsonLinesSource::open(dir.path()).unwrap();
    let store = SeriesStore::new();
    let mut last = None;
    let mut on_progress = |p: &LoadProgress| {
        last = Some(p.clone());
        true
    };
    let callback: &mut dyn FnMut(&LoadProgress) -> bool = &mut on_progress;

    BatchLoader::default()
        .load(&source, &["pose".to_string()], &store, Some(callback))
        .unwrap();

    let last = last.unwrap();
    assert_eq!(last.records_total, Some(5));
    assert_eq!(last.fraction(), Some(1.0));
}

#[test]
fn test_missing_grouping_is_error() {
    let dir = robot_dir();
    let source = JsonLinesSource::open(dir.path()).unwrap();
    let store = SeriesStore::new();
    let result = BatchLoader::default().load(&source, &["nope".to_string()], &store, None);
    assert!(result.is_err());
    assert!(store.is_empty());
}

#[test]
fn test_open_rejects_file() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("x.jsonl");
    std::fs::write(&file, "").unwrap();
    assert!(matches!(
        JsonLinesSource::open(&file),
        Err(DataFeedError::Source(_))
    ));
}

#[test]
fn test_csv_export() {
    let dir = robot_dir();
    let source = JsonLinesSource::open(dir.path()).unwrap();
    let store = SeriesStore::new();
    BatchLoader::default()
        .load(&source, &["battery".to_string()], &store, None)
        .unwrap();

    let mut out = Vec::new();
    let rows = store.write_csv(&mut out).unwrap();
    assert_eq!(rows, 9);
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("series,timestamp,value\n"));
    assert!(text.contains("battery/cells.0,10,3.7"));
}
