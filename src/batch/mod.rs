//! Batch ingestion
//!
//! Reads grouped JSON documents from a [`BatchSource`], discovers their
//! variable catalog and loads every numeric leaf into the shared
//! [`SeriesStore`](crate::store::SeriesStore).
//!
//! ```
//! use datafeed_rs::batch::{BatchLoader, MemorySource};
//! use datafeed_rs::store::SeriesStore;
//! use serde_json::json;
//!
//! let source = MemorySource::new()
//!     .with_records("odom", vec![json!({"timestamp": 1.0, "pose": {"x": 0.5}})]);
//! let store = SeriesStore::new();
//! let report = BatchLoader::default()
//!     .load(&source, &["odom".to_string()], &store, None)
//!     .unwrap();
//! assert_eq!(report.records_loaded, 1);
//! assert_eq!(store.point_count("odom/pose/x"), Some(1));
//! ```

mod loader;
mod source;

pub use loader::{BatchLoader, LoadProgress, LoadReport};
pub use source::{BatchSource, JsonLinesSource, MemorySource, RecordIter, JSONL_EXTENSION};
