//! # DataFeed-RS: nested telemetry to time series
//!
//! Turns nested telemetry records into flat, named time series. Records
//! come either from stored batches (one grouping per collection) or live
//! from a remote black box answering queries on a publish/subscribe bus.
//!
//! ## Architecture
//!
//! - **Flatten**: one traversal maps nested records to slash-delimited
//!   series names and numeric points
//! - **Store**: a shared, thread-safe map of named series
//! - **Batch**: discovery and loading of stored groupings into the store
//! - **Bus**: the transport seam plus the VARIABLE / LATEST-DATA / DATA query
//!   protocol
//! - **Stream**: the synchronizer that discovers, seeds and streams live
//!   variables with producer threads paced by source timestamps
//!
//! ## Configuration
//!
//! Settings live in a TOML file in the platform config directory under
//! `dev.hxyulin.datafeed-rs`:
//!
//! - **Linux**: `~/.config/dev.hxyulin.datafeed-rs/config.toml`
//! - **macOS**: `~/Library/Application Support/dev.hxyulin.datafeed-rs/config.toml`
//! - **Windows**: `%APPDATA%\dev.hxyulin.datafeed-rs\config.toml`
//!
//! ## Example
//!
//! ```no_run
//! use datafeed_rs::{
//!     bus::{LocalBus, MockBlackBox},
//!     config::AppConfig,
//!     stream::Synchronizer,
//! };
//!
//! let config = AppConfig::default();
//! let bus = LocalBus::new("viewer");
//! let _black_box = MockBlackBox::new(&config.bus.source_id, &config.bus.group)
//!     .with_demo_variables()
//!     .spawn(bus.join("black-box"));
//!
//! let mut sync = Synchronizer::new(config, bus);
//! let catalog = sync.discover()?;
//! let names: Vec<String> = catalog.iter().take(2).map(|e| e.name.clone()).collect();
//! sync.start(&names)?;
//! std::thread::sleep(std::time::Duration::from_secs(2));
//! println!("{} points", sync.store().total_points());
//! sync.shutdown();
//! # Ok::<(), datafeed_rs::DataFeedError>(())
//! ```

pub mod batch;
pub mod bus;
pub mod config;
pub mod error;
pub mod flatten;
pub mod store;
pub mod stream;
pub mod types;

// Re-export commonly used types
pub use batch::{BatchLoader, BatchSource, JsonLinesSource, LoadReport};
pub use bus::{Bus, BusMessage, LocalBus};
pub use config::AppConfig;
pub use error::{DataFeedError, Result, ResultExt};
pub use flatten::Flattener;
pub use store::SeriesStore;
pub use stream::{StreamHealth, Synchronizer, SyncState};
pub use types::{CatalogEntry, DataTypeTag, SamplePoint, Series};
