//! Core data types for datafeed-rs
//!
//! This module contains the fundamental data structures shared by the
//! flattener, the store and the streaming synchronizer.
//!
//! # Main Types
//!
//! - [`SamplePoint`] - A single `(timestamp, value)` pair, timestamps in seconds
//! - [`DataTypeTag`] - Provisional datatype recorded during discovery
//! - [`CatalogEntry`] - A discovered, addressable variable
//! - [`Series`] - Append-only sequence of points with running statistics
//! - [`LatestSample`] - Last delivered sample of a live variable
//!
//! # Statistics
//!
//! The [`IncrementalStats`] type provides O(1) updates for running statistics
//! including min, max, and average values as data arrives.

use serde::{Deserialize, Serialize};

/// A single timestamped sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplePoint {
    /// Source timestamp in seconds
    pub timestamp: f64,
    /// Sample value
    pub value: f64,
}

impl SamplePoint {
    /// Create a new sample point
    pub fn new(timestamp: f64, value: f64) -> Self {
        Self { timestamp, value }
    }

    /// Get the point as a plot pair `[t, v]`
    pub fn as_pair(&self) -> [f64; 2] {
        [self.timestamp, self.value]
    }
}

impl From<(f64, f64)> for SamplePoint {
    fn from((timestamp, value): (f64, f64)) -> Self {
        Self { timestamp, value }
    }
}

/// Provisional datatype of a discovered variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DataTypeTag {
    /// JSON number; the only kind that produces points
    Numeric,
    /// String leaf
    Text,
    /// Boolean leaf
    Boolean,
    /// Explicit null leaf
    Null,
    /// No type information (live catalogs)
    #[default]
    Unknown,
}

impl DataTypeTag {
    /// Classify a JSON leaf value
    pub fn of(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Number(_) => DataTypeTag::Numeric,
            serde_json::Value::String(_) => DataTypeTag::Text,
            serde_json::Value::Bool(_) => DataTypeTag::Boolean,
            serde_json::Value::Null => DataTypeTag::Null,
            _ => DataTypeTag::Unknown,
        }
    }

    /// Whether leaves of this type are plotted
    pub fn is_plottable(&self) -> bool {
        matches!(self, DataTypeTag::Numeric)
    }
}

impl std::fmt::Display for DataTypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataTypeTag::Numeric => write!(f, "numeric"),
            DataTypeTag::Text => write!(f, "text"),
            DataTypeTag::Boolean => write!(f, "bool"),
            DataTypeTag::Null => write!(f, "null"),
            DataTypeTag::Unknown => write!(f, "unknown"),
        }
    }
}

/// A discovered, addressable variable
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Series name (slash-delimited path)
    pub name: String,
    /// Provisional datatype
    pub data_type: DataTypeTag,
}

impl CatalogEntry {
    /// Create a new catalog entry
    pub fn new(name: impl Into<String>, data_type: DataTypeTag) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }

    /// Create an entry without type information
    pub fn untyped(name: impl Into<String>) -> Self {
        Self::new(name, DataTypeTag::Unknown)
    }
}

/// Last delivered sample of a live variable
pub type LatestSample = SamplePoint;

/// Incremental statistics tracker
/// This allows O(1) updates for mean, min, and max without iterating all data
#[derive(Debug, Clone)]
pub struct IncrementalStats {
    /// Current count of values
    pub count: u64,
    /// Running sum for average calculation
    pub sum: f64,
    /// Current minimum value
    pub min: f64,
    /// Current maximum value
    pub max: f64,
}

impl Default for IncrementalStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IncrementalStats {
    /// Create a new empty stats tracker
    pub fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::MAX,
            max: f64::MIN,
        }
    }

    /// Add a new value to the statistics
    #[inline]
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Get the current average
    #[inline]
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Get statistics as (min, max, avg) tuple
    #[inline]
    pub fn as_tuple(&self) -> (f64, f64, f64) {
        if self.count == 0 {
            (0.0, 0.0, 0.0)
        } else {
            (self.min, self.max, self.average())
        }
    }

    /// Reset the statistics
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Time series storage for one named variable
///
/// Points are kept in append order, which is not necessarily timestamp
/// order for batch sources.
#[derive(Debug, Clone)]
pub struct Series {
    /// Series name
    pub name: String,
    /// Appended points
    pub points: Vec<SamplePoint>,
    /// Running statistics over the values
    pub stats: IncrementalStats,
}

impl Series {
    /// Create an empty series
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            points: Vec::new(),
            stats: IncrementalStats::new(),
        }
    }

    /// Append a point
    pub fn push(&mut self, point: SamplePoint) {
        self.stats.push(point.value);
        self.points.push(point);
    }

    /// Number of points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the series has no points
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Get the last appended point
    pub fn last(&self) -> Option<&SamplePoint> {
        self.points.last()
    }

    /// Get the time range of the data
    pub fn time_range(&self) -> Option<(f64, f64)> {
        let mut iter = self.points.iter().map(|p| p.timestamp);
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), t| (lo.min(t), hi.max(t))))
    }

    /// Get data points as plot points (time in seconds, value)
    pub fn as_plot_points(&self) -> Vec<[f64; 2]> {
        self.points.iter().map(SamplePoint::as_pair).collect()
    }

    /// Get statistics: (min, max, average)
    #[inline]
    pub fn statistics(&self) -> (f64, f64, f64) {
        self.stats.as_tuple()
    }

    /// Clear all points
    pub fn clear(&mut self) {
        self.points.clear();
        self.stats.reset();
    }
}
