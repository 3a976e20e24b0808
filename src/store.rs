//! Shared time-series store
//!
//! [`SeriesStore`] is the single place series data lives. It is a cheap
//! handle around one coarse `Mutex`: series creation, point appends and host
//! reads all take the same lock. There is no reader/writer split; the store
//! is sized for tens of variables, not millions.
//!
//! Producers append from their own threads while the host's render loop
//! reads through [`SeriesStore::with_series`] or the snapshot methods.

use crate::error::{DataFeedError, Result};
use crate::flatten::PointSink;
use crate::types::{SamplePoint, Series};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

/// Lock-guarded map of series name to series
#[derive(Debug, Clone, Default)]
pub struct SeriesStore {
    inner: Arc<Mutex<BTreeMap<String, Series>>>,
}

impl SeriesStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Series>> {
        // Appends are single push operations, so a panicked holder cannot
        // leave a series half-written.
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Series store lock was poisoned; recovering");
            poisoned.into_inner()
        })
    }

    /// Create a series if it does not exist. Returns true if it was created.
    pub fn create_series(&self, name: &str) -> bool {
        let mut map = self.lock();
        if map.contains_key(name) {
            return false;
        }
        map.insert(name.to_string(), Series::new(name));
        true
    }

    /// Create several series under one lock. Returns how many were new.
    pub fn create_all<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> usize {
        let mut map = self.lock();
        let mut created = 0;
        for name in names {
            if !map.contains_key(name) {
                map.insert(name.to_string(), Series::new(name));
                created += 1;
            }
        }
        created
    }

    /// Check whether a series exists
    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Append one point to an existing series
    pub fn append(&self, name: &str, point: SamplePoint) -> Result<()> {
        let mut map = self.lock();
        map.get_mut(name)
            .ok_or_else(|| DataFeedError::UnregisteredSeries(name.to_string()))?
            .push(point);
        Ok(())
    }

    /// Append points to several series under one lock
    ///
    /// Every target series is checked before anything is written, so a
    /// rejected batch leaves the store untouched.
    pub fn append_batch(&self, points: Vec<(String, SamplePoint)>) -> Result<()> {
        let mut map = self.lock();
        if let Some((missing, _)) = points.iter().find(|(name, _)| !map.contains_key(name)) {
            return Err(DataFeedError::UnregisteredSeries(missing.clone()));
        }
        for (name, point) in points {
            if let Some(series) = map.get_mut(&name) {
                series.push(point);
            }
        }
        Ok(())
    }

    /// Remove a series. Returns true if it existed.
    pub fn remove_series(&self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }

    /// Remove every series
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Names of all series, sorted
    pub fn series_names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Number of series
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if the store holds no series
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Total number of points over all series
    pub fn total_points(&self) -> usize {
        self.lock().values().map(Series::len).sum()
    }

    /// Number of points of one series
    pub fn point_count(&self, name: &str) -> Option<usize> {
        self.lock().get(name).map(Series::len)
    }

    /// Run `f` against a series while holding the lock
    ///
    /// Keep `f` short; every producer waits on the same lock.
    pub fn with_series<R>(&self, name: &str, f: impl FnOnce(&Series) -> R) -> Option<R> {
        self.lock().get(name).map(f)
    }

    /// Copy of one series' points
    pub fn snapshot(&self, name: &str) -> Option<Vec<SamplePoint>> {
        self.with_series(name, |s| s.points.clone())
    }

    /// Copy of every series
    pub fn snapshot_all(&self) -> BTreeMap<String, Vec<SamplePoint>> {
        self.lock()
            .iter()
            .map(|(name, series)| (name.clone(), series.points.clone()))
            .collect()
    }

    /// Statistics of one series: (min, max, average)
    pub fn stats(&self, name: &str) -> Option<(f64, f64, f64)> {
        self.with_series(name, Series::statistics)
    }

    /// Export every point in long layout: `series,timestamp,value`
    ///
    /// The lock is only held while copying; writing happens afterwards.
    pub fn write_csv<W: Write>(&self, mut writer: W) -> Result<u64> {
        let snapshot = self.snapshot_all();
        let mut rows = 0u64;
        writeln!(writer, "series,timestamp,value")?;
        for (name, points) in &snapshot {
            let name = csv_field(name);
            for p in points {
                writeln!(writer, "{},{},{}", name, p.timestamp, p.value)?;
                rows += 1;
            }
        }
        writer.flush()?;
        Ok(rows)
    }
}

impl PointSink for SeriesStore {
    fn push_point(&mut self, series: &str, point: SamplePoint) -> Result<()> {
        self.append(series, point)
    }

    fn push_points(&mut self, points: Vec<(String, SamplePoint)>) -> Result<()> {
        self.append_batch(points)
    }
}

fn csv_field(value: &str) -> std::borrow::Cow<'_, str> {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\"")).into()
    } else {
        value.into()
    }
}
