//! Batch record sources
//!
//! A [`BatchSource`] exposes named groupings (collections, files) and yields
//! the JSON records of each grouping in order.

use crate::error::{DataFeedError, Result, ResultExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Iterator over the records of one grouping
///
/// An `Err` item is a single unreadable record; iteration may continue.
pub type RecordIter<'a> = Box<dyn Iterator<Item = Result<Value>> + 'a>;

/// A source of grouped batch records
pub trait BatchSource {
    /// Display name of the source
    fn name(&self) -> &str;

    /// List the available groupings
    fn groupings(&self) -> Result<Vec<String>>;

    /// Iterate the records of a grouping
    fn records(&self, grouping: &str) -> Result<RecordIter<'_>>;

    /// Number of records in a grouping, if cheaply known
    fn record_count(&self, _grouping: &str) -> Result<Option<usize>> {
        Ok(None)
    }

    /// First readable record of a grouping, used as its representative
    fn first_record(&self, grouping: &str) -> Result<Option<Value>> {
        Ok(self.records(grouping)?.find_map(|r| r.ok()))
    }
}

// ==================== JSON Lines ====================

/// Directory of `*.jsonl` files, one grouping per file
///
/// The file stem is the grouping name; every non-empty line is one record.
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    dir: PathBuf,
    name: String,
}

/// Extension of grouping files
pub const JSONL_EXTENSION: &str = "jsonl";

impl JsonLinesSource {
    /// Open a directory of grouping files
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(DataFeedError::Source(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());
        Ok(Self { dir, name })
    }

    fn grouping_path(&self, grouping: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", grouping, JSONL_EXTENSION))
    }

    fn open_grouping(&self, grouping: &str) -> Result<BufReader<File>> {
        let path = self.grouping_path(grouping);
        if !path.is_file() {
            return Err(DataFeedError::Source(format!("Unknown grouping '{}'", grouping)));
        }
        let file = File::open(&path).with_context(|| format!("Opening {}", path.display()))?;
        Ok(BufReader::new(file))
    }
}

fn is_grouping_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(JSONL_EXTENSION))
}

impl BatchSource for JsonLinesSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn groupings(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Listing {}", self.dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if !is_grouping_file(&path) {
                continue;
            }
            if let Some(stem) = path.file_stem() {
                names.push(stem.to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn records(&self, grouping: &str) -> Result<RecordIter<'_>> {
        let reader = self.open_grouping(grouping)?;
        let iter = reader.lines().filter_map(|line| match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(serde_json::from_str::<Value>(&line).map_err(DataFeedError::from)),
            Err(e) => Some(Err(DataFeedError::Io(e))),
        });
        Ok(Box::new(iter))
    }

    fn record_count(&self, grouping: &str) -> Result<Option<usize>> {
        let reader = self.open_grouping(grouping)?;
        let mut count = 0;
        for line in reader.lines() {
            if !line?.trim().is_empty() {
                count += 1;
            }
        }
        Ok(Some(count))
    }
}

// ==================== In Memory ====================

#[derive(Debug, Clone)]
enum StoredRecord {
    Parsed(Value),
    Raw(String),
}

/// In-memory groupings, for embedding and tests
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    groupings: BTreeMap<String, Vec<StoredRecord>>,
}

impl MemorySource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Add parsed records to a grouping
    pub fn with_records(mut self, grouping: impl Into<String>, records: Vec<Value>) -> Self {
        self.groupings
            .entry(grouping.into())
            .or_default()
            .extend(records.into_iter().map(StoredRecord::Parsed));
        self
    }

    /// Add a raw JSON text record, parsed lazily on iteration
    pub fn with_raw(mut self, grouping: impl Into<String>, text: impl Into<String>) -> Self {
        self.groupings
            .entry(grouping.into())
            .or_default()
            .push(StoredRecord::Raw(text.into()));
        self
    }

    fn grouping(&self, grouping: &str) -> Result<&Vec<StoredRecord>> {
        self.groupings
            .get(grouping)
            .ok_or_else(|| DataFeedError::Source(format!("Unknown grouping '{}'", grouping)))
    }
}

impl BatchSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    fn groupings(&self) -> Result<Vec<String>> {
        Ok(self.groupings.keys().cloned().collect())
    }

    fn records(&self, grouping: &str) -> Result<RecordIter<'_>> {
        let iter = self.grouping(grouping)?.iter().map(|record| match record {
            StoredRecord::Parsed(value) => Ok(value.clone()),
            StoredRecord::Raw(text) => serde_json::from_str::<Value>(text).map_err(DataFeedError::from),
        });
        Ok(Box::new(iter))
    }

    fn record_count(&self, grouping: &str) -> Result<Option<usize>> {
        Ok(Some(self.grouping(grouping)?.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_memory_source() {
        let source = MemorySource::new()
            .with_raw("b", "{not json")
            .with_records("b", vec![json!({"x": 1})])
            .with_records("a", vec![json!({"y": 2})]);

        assert_eq!(source.groupings().unwrap(), vec!["a", "b"]);
        assert_eq!(source.record_count("b").unwrap(), Some(2));
        assert_eq!(source.first_record("b").unwrap(), Some(json!({"x": 1})));

        let results: Vec<_> = source.records("b").unwrap().collect();
        assert!(results[0].is_err());
        assert!(results[1].is_ok());

        assert!(matches!(source.records("zzz"), Err(DataFeedError::Source(_))));
    }

    #[test]
    fn test_json_lines_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join("odometry.jsonl")).unwrap();
        writeln!(file, "{{\"timestamp\": 1.0, \"x\": 1}}").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{{\"timestamp\": 2.0, \"x\": 2}}").unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();
        File::create(dir.path().join("battery.jsonl")).unwrap();

        let source = JsonLinesSource::open(dir.path()).unwrap();
        assert_eq!(source.groupings().unwrap(), vec!["battery", "odometry"]);
        assert_eq!(source.record_count("odometry").unwrap(), Some(2));
        assert_eq!(source.first_record("battery").unwrap(), None);

        let records: Vec<Value> = source
            .records("odometry")
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records[1]["x"], json!(2));
    }

    #[test]
    fn test_json_lines_rejects_missing() {
        assert!(JsonLinesSource::open("/nonexistent/datafeed").is_err());

        let dir = tempfile::tempdir().unwrap();
        let source = JsonLinesSource::open(dir.path()).unwrap();
        assert!(source.groupings().unwrap().is_empty());
        assert!(source.records("missing").is_err());
    }
}
