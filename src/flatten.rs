//! Document flattening
//!
//! Maps arbitrarily nested JSON records onto flat, slash-delimited series
//! names and extracts their numeric leaves as timestamped points.
//!
//! # Naming
//!
//! - object keys are joined with `/`: `{"a":{"b":1}}` rooted at `R` is `R/a/b`
//! - sequence elements append `.<index>`: `{"a":[{"x":1}]}` is `R/a.0/x`
//! - a sub-record stored under the reserved identifier key (`_id` by
//!   default) is skipped entirely; a scalar under that key is a normal leaf
//! - a scalar at the root is named by the root path itself
//!
//! Discovery and emission share one traversal ([`Flattener::walk`]) driven by
//! a [`LeafVisitor`], so the names produced while cataloging are exactly the
//! names used while emitting.
//!
//! # Example
//!
//! ```
//! use datafeed_rs::flatten::Flattener;
//! use serde_json::json;
//!
//! let flattener = Flattener::default();
//! let paths = flattener.discover_paths(&json!({"a": {"b": {"c": 5}}}), "R");
//! assert!(paths.contains("R/a/b/c"));
//! ```

use crate::config::DEFAULT_ID_KEY;
use crate::error::{DataFeedError, Result};
use crate::types::{CatalogEntry, DataTypeTag, SamplePoint};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Receives every scalar leaf found by a traversal
pub trait LeafVisitor {
    /// Called once per scalar leaf with its full series name
    fn visit_leaf(&mut self, path: &str, value: &Value);
}

impl<F: FnMut(&str, &Value)> LeafVisitor for F {
    fn visit_leaf(&mut self, path: &str, value: &Value) {
        self(path, value)
    }
}

/// Destination of emitted points
///
/// Emitting to a series that was not registered beforehand is a contract
/// violation and must be reported as [`DataFeedError::UnregisteredSeries`].
pub trait PointSink {
    /// Append one point to a registered series
    fn push_point(&mut self, series: &str, point: SamplePoint) -> Result<()>;

    /// Append several points; sinks may override to batch the work
    fn push_points(&mut self, points: Vec<(String, SamplePoint)>) -> Result<()> {
        for (series, point) in points {
            self.push_point(&series, point)?;
        }
        Ok(())
    }
}

impl PointSink for HashMap<String, Vec<SamplePoint>> {
    fn push_point(&mut self, series: &str, point: SamplePoint) -> Result<()> {
        self.get_mut(series)
            .ok_or_else(|| DataFeedError::UnregisteredSeries(series.to_string()))?
            .push(point);
        Ok(())
    }
}

/// Recursive record flattener
#[derive(Debug, Clone)]
pub struct Flattener {
    id_key: String,
}

impl Default for Flattener {
    fn default() -> Self {
        Self::new(DEFAULT_ID_KEY)
    }
}

impl Flattener {
    /// Create a flattener skipping sub-records under `id_key`
    pub fn new(id_key: impl Into<String>) -> Self {
        Self {
            id_key: id_key.into(),
        }
    }

    /// The reserved identifier key
    pub fn id_key(&self) -> &str {
        &self.id_key
    }

    /// Visit every scalar leaf of `record` rooted at `root`
    pub fn walk<V: LeafVisitor + ?Sized>(&self, record: &Value, root: &str, visitor: &mut V) {
        self.walk_value(record, root, visitor);
    }

    fn walk_value<V: LeafVisitor + ?Sized>(&self, value: &Value, path: &str, visitor: &mut V) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    if key == &self.id_key && child.is_object() {
                        continue;
                    }
                    let child_path = join(path, key);
                    self.walk_value(child, &child_path, visitor);
                }
            }
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    let item_path = format!("{}.{}", path, index);
                    self.walk_value(item, &item_path, visitor);
                }
            }
            scalar => visitor.visit_leaf(path, scalar),
        }
    }

    /// Collect the set of leaf paths of a record
    pub fn discover_paths(&self, record: &Value, root: &str) -> BTreeSet<String> {
        let mut paths = BTreeSet::new();
        self.walk(record, root, &mut |path: &str, _: &Value| {
            paths.insert(path.to_string());
        });
        paths
    }

    /// Collect leaf paths with their datatype, in document order
    pub fn discover_entries(&self, record: &Value, root: &str) -> Vec<CatalogEntry> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        self.walk(record, root, &mut |path: &str, value: &Value| {
            if seen.insert(path.to_string()) {
                entries.push(CatalogEntry::new(path, DataTypeTag::of(value)));
            }
        });
        entries
    }

    /// Collect the numeric leaves of a record as points at `timestamp`
    pub fn collect_points(
        &self,
        record: &Value,
        root: &str,
        timestamp: f64,
    ) -> Vec<(String, SamplePoint)> {
        let mut points = Vec::new();
        self.walk(record, root, &mut |path: &str, value: &Value| {
            if let Some(v) = numeric(value) {
                points.push((path.to_string(), SamplePoint::new(timestamp, v)));
            }
        });
        points
    }

    /// Emit the numeric leaves of a record into `sink`
    ///
    /// Returns the number of points emitted. Non-numeric leaves are skipped.
    pub fn emit<S: PointSink + ?Sized>(
        &self,
        record: &Value,
        root: &str,
        timestamp: f64,
        sink: &mut S,
    ) -> Result<usize> {
        let points = self.collect_points(record, root, timestamp);
        let count = points.len();
        if count > 0 {
            sink.push_points(points)?;
        }
        Ok(count)
    }
}

/// Numeric value of a leaf; booleans, strings and nulls never plot
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn join(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", parent, key)
    }
}
