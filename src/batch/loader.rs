//! Batch loading into the series store
//!
//! Loading runs in two passes over the selected groupings:
//!
//! 1. **Discovery** - the first readable record of every grouping is
//!    flattened under the grouping name; the merged catalog is registered in
//!    the store before any point is written.
//! 2. **Population** - every record is flattened again and its numeric
//!    leaves are appended at the record's root timestamp.
//!
//! Unreadable records, records without a numeric timestamp and records whose
//! shape adds leaves the representative did not have are skipped and
//! counted; they never abort the batch.

use crate::config::BatchConfig;
use crate::error::{DataFeedError, Result};
use crate::flatten::Flattener;
use crate::store::SeriesStore;
use crate::types::CatalogEntry;
use serde_json::Value;
use std::collections::HashSet;

use super::source::BatchSource;

/// Progress of a running load
#[derive(Debug, Clone, PartialEq)]
pub struct LoadProgress {
    /// Grouping being read
    pub grouping: String,
    /// Records processed so far over all groupings
    pub records_done: usize,
    /// Total records over all groupings, if the source knows it
    pub records_total: Option<usize>,
}

impl LoadProgress {
    /// Completed fraction in `0.0..=1.0`, if the total is known
    pub fn fraction(&self) -> Option<f64> {
        match self.records_total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.records_done as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

/// Summary of a finished load
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Groupings loaded
    pub groupings: Vec<String>,
    /// Catalog entries discovered
    pub catalog: Vec<CatalogEntry>,
    /// Series newly created in the store
    pub series_created: usize,
    /// Records whose points were appended
    pub records_loaded: usize,
    /// Records skipped as malformed
    pub records_skipped: usize,
    /// Points appended
    pub points_emitted: usize,
}

/// Loads grouped batch records into a [`SeriesStore`]
#[derive(Debug, Clone)]
pub struct BatchLoader {
    flattener: Flattener,
    timestamp_field: String,
    progress_every: usize,
}

impl Default for BatchLoader {
    fn default() -> Self {
        Self::new(&BatchConfig::default())
    }
}

impl BatchLoader {
    /// Create a loader following the batch conventions in `config`
    pub fn new(config: &BatchConfig) -> Self {
        Self {
            flattener: Flattener::new(config.id_key.clone()),
            timestamp_field: config.timestamp_field.clone(),
            progress_every: config.progress_every.max(1),
        }
    }

    /// The flattener used for naming
    pub fn flattener(&self) -> &Flattener {
        &self.flattener
    }

    /// Discover the catalog of the selected groupings
    ///
    /// One representative record per grouping is flattened under the
    /// grouping name. Names repeated across groupings appear once.
    pub fn discover_catalog(
        &self,
        source: &dyn BatchSource,
        selection: &[String],
    ) -> Result<Vec<CatalogEntry>> {
        if selection.is_empty() {
            return Err(DataFeedError::EmptySelection);
        }

        let mut seen = HashSet::new();
        let mut catalog = Vec::new();
        for grouping in selection {
            let Some(record) = source.first_record(grouping)? else {
                tracing::warn!("Grouping '{}' has no readable records", grouping);
                continue;
            };
            for entry in self.flattener.discover_entries(&record, grouping) {
                if seen.insert(entry.name.clone()) {
                    catalog.push(entry);
                }
            }
        }

        tracing::debug!(
            "Discovered {} variables in {} groupings of '{}'",
            catalog.len(),
            selection.len(),
            source.name()
        );
        Ok(catalog)
    }

    /// Load the selected groupings into `store`
    ///
    /// `progress` is called every few records and once per grouping; return
    /// `false` from it to cancel the load with [`DataFeedError::Cancelled`].
    /// Points appended before cancellation stay in the store.
    pub fn load(
        &self,
        source: &dyn BatchSource,
        selection: &[String],
        store: &SeriesStore,
        mut progress: Option<&mut dyn FnMut(&LoadProgress) -> bool>,
    ) -> Result<LoadReport> {
        let catalog = self.discover_catalog(source, selection)?;
        let series_created = store.create_all(catalog.iter().map(|e| e.name.as_str()));

        let records_total = self.total_records(source, selection);
        let mut report = LoadReport {
            groupings: selection.to_vec(),
            catalog,
            series_created,
            ..Default::default()
        };

        let mut records_done = 0usize;
        for grouping in selection {
            for record in source.records(grouping)? {
                records_done += 1;
                match self.load_record(record, grouping, store) {
                    Some(points) => {
                        report.records_loaded += 1;
                        report.points_emitted += points;
                    }
                    None => report.records_skipped += 1,
                }

                if records_done % self.progress_every == 0 {
                    let update = LoadProgress {
                        grouping: grouping.clone(),
                        records_done,
                        records_total,
                    };
                    if !report_progress(&mut progress, &update) {
                        tracing::info!("Batch load cancelled after {} records", records_done);
                        return Err(DataFeedError::Cancelled);
                    }
                }
            }

            let update = LoadProgress {
                grouping: grouping.clone(),
                records_done,
                records_total,
            };
            if !report_progress(&mut progress, &update) {
                return Err(DataFeedError::Cancelled);
            }
        }

        tracing::info!(
            "Loaded {} records ({} skipped), {} points into {} series",
            report.records_loaded,
            report.records_skipped,
            report.points_emitted,
            store.len()
        );
        Ok(report)
    }

    /// Flatten one record into the store. `None` means it was skipped.
    fn load_record(
        &self,
        record: Result<Value>,
        grouping: &str,
        store: &SeriesStore,
    ) -> Option<usize> {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Skipping unreadable record in '{}': {}", grouping, e);
                return None;
            }
        };

        let Some(timestamp) = record.get(&self.timestamp_field).and_then(Value::as_f64) else {
            tracing::warn!(
                "Skipping record in '{}' without numeric '{}'",
                grouping,
                self.timestamp_field
            );
            return None;
        };

        let mut sink = store.clone();
        match self.flattener.emit(&record, grouping, timestamp, &mut sink) {
            Ok(points) => Some(points),
            Err(e) => {
                tracing::warn!("Skipping record in '{}' with unexpected shape: {}", grouping, e);
                None
            }
        }
    }

    fn total_records(&self, source: &dyn BatchSource, selection: &[String]) -> Option<usize> {
        let mut total = 0;
        for grouping in selection {
            total += source.record_count(grouping).ok()??;
        }
        Some(total)
    }
}

fn report_progress(
    progress: &mut Option<&mut dyn FnMut(&LoadProgress) -> bool>,
    update: &LoadProgress,
) -> bool {
    match progress {
        Some(callback) => (*callback)(update),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::MemorySource;
    use crate::types::{DataTypeTag, SamplePoint};
    use serde_json::json;

    fn robot_source() -> MemorySource {
        MemorySource::new()
            .with_records(
                "odom",
                vec![
                    json!({"_id": {"$oid": "1"}, "timestamp": 1.0, "pose": {"x": 0.5, "frame": "map"}}),
                    json!({"_id": {"$oid": "2"}, "timestamp": 2.0, "pose": {"x": 0.7, "frame": "map"}}),
                ],
            )
            .with_raw("odom", "{broken")
            .with_records(
                "battery",
                vec![json!({"timestamp": 1.5, "cells": [3.7, 3.8]})],
            )
    }

    fn selection(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_discover_catalog_merges_groupings() {
        let loader = BatchLoader::default();
        let catalog = loader
            .discover_catalog(&robot_source(), &selection(&["odom", "battery"]))
            .unwrap();

        let names: Vec<_> = catalog.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "odom/timestamp",
                "odom/pose/x",
                "odom/pose/frame",
                "battery/timestamp",
                "battery/cells.0",
                "battery/cells.1"
            ]
        );
        assert_eq!(catalog[2].data_type, DataTypeTag::Text);
    }

    #[test]
    fn test_discover_same_grouping_twice_no_duplicates() {
        let loader = BatchLoader::default();
        let catalog = loader
            .discover_catalog(&robot_source(), &selection(&["odom", "odom"]))
            .unwrap();
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn test_load_populates_store() {
        let store = SeriesStore::new();
        let report = BatchLoader::default()
            .load(&robot_source(), &selection(&["odom", "battery"]), &store, None)
            .unwrap();

        assert_eq!(report.series_created, 6);
        assert_eq!(report.records_loaded, 3);
        assert_eq!(report.records_skipped, 1);
        assert_eq!(
            store.snapshot("odom/pose/x").unwrap(),
            vec![SamplePoint::new(1.0, 0.5), SamplePoint::new(2.0, 0.7)]
        );
        assert_eq!(store.point_count("odom/pose/frame"), Some(0));
        assert_eq!(
            store.snapshot("battery/cells.1").unwrap(),
            vec![SamplePoint::new(1.5, 3.8)]
        );
    }

    #[test]
    fn test_record_without_timestamp_is_skipped() {
        let source = MemorySource::new().with_records(
            "g",
            vec![json!({"timestamp": 1.0, "v": 1}), json!({"v": 2})],
        );
        let store = SeriesStore::new();
        let report = BatchLoader::default()
            .load(&source, &selection(&["g"]), &store, None)
            .unwrap();
        assert_eq!(report.records_skipped, 1);
        assert_eq!(store.point_count("g/v"), Some(1));
    }

    #[test]
    fn test_record_with_new_leaves_is_skipped() {
        let source = MemorySource::new().with_records(
            "g",
            vec![
                json!({"timestamp": 1.0, "v": 1}),
                json!({"timestamp": 2.0, "v": 2, "extra": 3}),
            ],
        );
        let store = SeriesStore::new();
        let report = BatchLoader::default()
            .load(&source, &selection(&["g"]), &store, None)
            .unwrap();
        assert_eq!(report.records_skipped, 1);
        assert!(!store.contains("g/extra"));
        assert_eq!(store.point_count("g/v"), Some(1));
    }

    #[test]
    fn test_empty_selection() {
        let store = SeriesStore::new();
        let err = BatchLoader::default()
            .load(&robot_source(), &[], &store, None)
            .unwrap_err();
        assert!(matches!(err, DataFeedError::EmptySelection));
        assert!(store.is_empty());
    }

    #[test]
    fn test_progress_and_cancel() {
        let records: Vec<_> = (0..10).map(|i| json!({"timestamp": i, "v": i})).collect();
        let source = MemorySource::new().with_records("g", records);
        let config = BatchConfig {
            progress_every: 3,
            ..Default::default()
        };
        let loader = BatchLoader::new(&config);

        let mut updates = Vec::new();
        let mut track = |p: &LoadProgress| {
            updates.push(p.records_done);
            true
        };
        let store = SeriesStore::new();
        loader
            .load(&source, &selection(&["g"]), &store, Some(&mut track))
            .unwrap();
        assert_eq!(updates, vec![3, 6, 9, 10]);

        let mut cancel = |p: &LoadProgress| {
            assert_eq!(p.records_total, Some(10));
            false
        };
        let store = SeriesStore::new();
        let err = loader
            .load(&source, &selection(&["g"]), &store, Some(&mut cancel))
            .unwrap_err();
        assert!(matches!(err, DataFeedError::Cancelled));
        assert_eq!(store.point_count("g/v"), Some(3));
    }

    #[test]
    fn test_progress_fraction() {
        let p = LoadProgress {
            grouping: "g".into(),
            records_done: 5,
            records_total: Some(10),
        };
        assert_eq!(p.fraction(), Some(0.5));
        let unknown = LoadProgress {
            records_total: None,
            ..p
        };
        assert_eq!(unknown.fraction(), None);
    }
}
