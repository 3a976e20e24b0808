//! Mock construction helpers

#[cfg(feature = "mock-source")]
use datafeed_rs::bus::{LocalBus, MockBlackBox, MockDataPattern};
#[cfg(feature = "mock-source")]
use datafeed_rs::config::AppConfig;
#[cfg(feature = "mock-source")]
use std::time::Duration;

/// Black box answering for the configured source with variables `r/x`
/// (counter) and `r/y` (constant), sampling every 10 ms
#[cfg(feature = "mock-source")]
pub fn create_test_black_box(config: &AppConfig) -> MockBlackBox {
    MockBlackBox::new(config.bus.source_id.clone(), config.bus.group.clone())
        .with_sample_period(Duration::from_millis(10))
        .with_variable(
            "r/x",
            MockDataPattern::Counter {
                min: 0.0,
                max: 1000.0,
                step: 1.0,
            },
        )
        .with_variable("r/y", MockDataPattern::Constant(2.0))
}

/// Client bus plus the handle the black box should use
#[cfg(feature = "mock-source")]
pub fn create_test_bus() -> (LocalBus, LocalBus) {
    let client = LocalBus::new("client");
    let black_box = client.join("black-box");
    (client, black_box)
}
