//! Test data builders for creating test objects

use datafeed_rs::config::AppConfig;
use serde_json::{json, Map, Value};
use std::path::Path;

/// Builder for nested telemetry records
///
/// Fields are given as slash paths and nested on build.
pub struct RecordBuilder {
    record: Map<String, Value>,
}

impl RecordBuilder {
    pub fn new(timestamp: f64) -> Self {
        let mut record = Map::new();
        record.insert("timestamp".into(), json!(timestamp));
        Self { record }
    }

    pub fn id(self, id: &str) -> Self {
        self.field("_id", json!(id))
    }

    pub fn field(mut self, path: &str, value: Value) -> Self {
        let mut segments: Vec<&str> = path.split('/').collect();
        let last = segments.pop().unwrap_or(path);
        let mut node = &mut self.record;
        for segment in segments {
            node = node
                .entry(segment)
                .or_insert_with(|| Value::Object(Map::new()))
                .as_object_mut()
                .expect("path segment is not an object");
        }
        node.insert(last.to_string(), value);
        self
    }

    pub fn build(self) -> Value {
        Value::Object(self.record)
    }
}

/// Write one `<grouping>.jsonl` file per grouping
pub fn write_groupings(dir: &Path, groupings: &[(&str, Vec<Value>)]) {
    for (name, records) in groupings {
        let lines: Vec<String> = records.iter().map(Value::to_string).collect();
        std::fs::write(dir.join(format!("{name}.jsonl")), lines.join("\n") + "\n")
            .expect("failed to write grouping");
    }
}

/// Config with short timeouts and intervals for live tests
pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.discovery.timeout_ms = 300;
    config.discovery.init_timeout_ms = 300;
    config.streaming.poll_interval_ms = 50;
    config.streaming.response_wait_ms = 200;
    config.streaming.combined_interval_ms = 50;
    config.streaming.stall_timeout_ms = 200;
    config.streaming.sleep_slice_ms = 5;
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder() {
        let record = RecordBuilder::new(1.5)
            .id("abc")
            .field("pose/x", json!(2.0))
            .field("pose/y", json!(3.0))
            .build();

        assert_eq!(record["timestamp"], json!(1.5));
        assert_eq!(record["pose"]["x"], json!(2.0));
        assert_eq!(record["pose"]["y"], json!(3.0));
        assert_eq!(record["_id"], json!("abc"));
    }
}
