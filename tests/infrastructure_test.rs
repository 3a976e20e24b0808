//! Test to verify test infrastructure works correctly

mod common;

use common::builders::{fast_config, RecordBuilder};
use serde_json::json;

#[test]
fn test_infrastructure_setup() {
    // Test that builders work
    let record = RecordBuilder::new(2.0).field("a/b", json!(1)).build();
    assert_eq!(record, json!({"timestamp": 2.0, "a": {"b": 1}}));

    let config = fast_config();
    assert!(config.validate().is_ok());
}

#[test]
fn test_float_comparison() {
    common::assert_float_eq(1.0, 1.0000001, 0.001);
}

#[test]
#[should_panic]
fn test_float_comparison_fails() {
    common::assert_float_eq(1.0, 2.0, 0.001);
}

#[test]
fn test_wait_until() {
    assert!(common::wait_until(common::test_timeout(), || true));
    assert!(!common::wait_until(std::time::Duration::from_millis(20), || false));
}
