//! Simulated black box for running without a robot
//!
//! [`MockBlackBox`] joins a bus and answers catalog, latest-value and window
//! queries from a synthetic history. Samples are generated at a fixed period
//! on wall-clock timestamps, so consecutive window queries overlap at their
//! inclusive start bound just like the real source.
//!
//! # Example
//!
//! ```
//! use datafeed_rs::bus::{LocalBus, MockBlackBox, MockDataPattern};
//!
//! let bus = LocalBus::new("datafeed");
//! let black_box = MockBlackBox::new("black_box_001", "ROPOD")
//!     .with_variable("ropod/battery/voltage", MockDataPattern::Constant(24.0))
//!     .spawn(bus.join("black_box_001"));
//! black_box.stop();
//! ```

use crate::types::SamplePoint;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::protocol::{QueryKind, Request, Response};
use super::Bus;

/// Samples kept per variable
const HISTORY_LIMIT: usize = 10_000;

/// Pattern for generating mock data
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockDataPattern {
    /// Constant value
    Constant(f64),
    /// Sine wave over source time
    Sine {
        frequency: f64,
        amplitude: f64,
        offset: f64,
    },
    /// Counter stepping once per sample, wrapping to `min` past `max`
    Counter { step: f64, min: f64, max: f64 },
    /// Random values within range
    Random { min: f64, max: f64 },
    /// Sawtooth over source time
    Sawtooth { period: f64, amplitude: f64 },
}

impl Default for MockDataPattern {
    fn default() -> Self {
        MockDataPattern::Sine {
            frequency: 0.5,
            amplitude: 1.0,
            offset: 0.0,
        }
    }
}

/// One simulated variable
#[derive(Debug, Clone)]
pub struct MockVariableConfig {
    /// Full variable name
    pub name: String,
    /// Data generation pattern
    pub pattern: MockDataPattern,
    /// Noise amplitude to add (0.0 = no noise)
    pub noise_amplitude: f64,
    counter_value: Option<f64>,
}

impl MockVariableConfig {
    /// Create a variable with a pattern
    pub fn new(name: impl Into<String>, pattern: MockDataPattern) -> Self {
        Self {
            name: name.into(),
            pattern,
            noise_amplitude: 0.0,
            counter_value: None,
        }
    }

    /// Add noise to the generated values
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise_amplitude = amplitude;
        self
    }

    /// Generate the value at source time `t` (seconds since the first sample)
    pub fn generate_value(&mut self, t: f64) -> f64 {
        let base = match self.pattern {
            MockDataPattern::Constant(v) => v,
            MockDataPattern::Sine {
                frequency,
                amplitude,
                offset,
            } => offset + amplitude * (2.0 * std::f64::consts::PI * frequency * t).sin(),
            MockDataPattern::Counter { step, min, max } => {
                let next = match self.counter_value {
                    None => min,
                    Some(v) if v + step > max => min,
                    Some(v) => v + step,
                };
                self.counter_value = Some(next);
                next
            }
            MockDataPattern::Random { min, max } => min + rand_simple() * (max - min),
            MockDataPattern::Sawtooth { period, amplitude } if period > 0.0 => {
                amplitude * ((t % period) / period)
            }
            MockDataPattern::Sawtooth { .. } => 0.0,
        };

        if self.noise_amplitude > 0.0 {
            base + (rand_simple() - 0.5) * 2.0 * self.noise_amplitude
        } else {
            base
        }
    }
}

/// xorshift generator, good enough for plot noise
fn rand_simple() -> f64 {
    use std::cell::Cell;
    thread_local! {
        static SEED: Cell<u64> = const { Cell::new(0x2545_f491_4f6c_dd1d) };
    }
    SEED.with(|seed| {
        let mut s = seed.get();
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        seed.set(s);
        (s as f64) / (u64::MAX as f64)
    })
}

/// Wall-clock time in seconds since the epoch
pub fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

/// Simulated remote data source
#[derive(Debug, Clone)]
pub struct MockBlackBox {
    source_id: String,
    group: String,
    variables: Vec<MockVariableConfig>,
    sample_period: Duration,
    muted: HashSet<QueryKind>,
    echo_msg_id: bool,
    history: HashMap<String, Vec<SamplePoint>>,
    origin: Option<f64>,
    next_sample: f64,
}

impl MockBlackBox {
    /// Create a black box answering queries for `source_id` on `group`
    pub fn new(source_id: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            group: group.into(),
            variables: Vec::new(),
            sample_period: Duration::from_millis(100),
            muted: HashSet::new(),
            echo_msg_id: true,
            history: HashMap::new(),
            origin: None,
            next_sample: 0.0,
        }
    }

    /// A black box with a handful of robot-like variables
    pub fn with_demo_variables(self) -> Self {
        self.with_variable(
            "ropod_001/battery/voltage",
            MockDataPattern::Sine {
                frequency: 0.05,
                amplitude: 0.4,
                offset: 24.0,
            },
        )
        .with_variable_config(
            MockVariableConfig::new(
                "ropod_001/odom/speed",
                MockDataPattern::Sine {
                    frequency: 0.5,
                    amplitude: 0.8,
                    offset: 0.8,
                },
            )
            .with_noise(0.05),
        )
        .with_variable(
            "ropod_001/odom/heading",
            MockDataPattern::Sawtooth {
                period: 10.0,
                amplitude: 360.0,
            },
        )
        .with_variable(
            "ropod_001/status/ticks",
            MockDataPattern::Counter {
                step: 1.0,
                min: 0.0,
                max: 1000.0,
            },
        )
        .with_variable(
            "ropod_001/sensors/temperature",
            MockDataPattern::Random {
                min: 35.0,
                max: 38.0,
            },
        )
    }

    /// Add a variable
    pub fn with_variable(mut self, name: impl Into<String>, pattern: MockDataPattern) -> Self {
        self.variables.push(MockVariableConfig::new(name, pattern));
        self
    }

    /// Add a fully configured variable
    pub fn with_variable_config(mut self, config: MockVariableConfig) -> Self {
        self.variables.push(config);
        self
    }

    /// Set the sampling period of the synthetic history
    pub fn with_sample_period(mut self, period: Duration) -> Self {
        self.sample_period = period.max(Duration::from_millis(1));
        self
    }

    /// Never answer queries of `kind`
    pub fn mute(mut self, kind: QueryKind) -> Self {
        self.muted.insert(kind);
        self
    }

    /// Leave `msgId` out of responses
    pub fn without_msg_id_echo(mut self) -> Self {
        self.echo_msg_id = false;
        self
    }

    /// Names of the simulated variables
    pub fn variable_names(&self) -> Vec<String> {
        self.variables.iter().map(|v| v.name.clone()).collect()
    }

    /// Generate samples up to wall-clock time `now`
    fn advance(&mut self, now: f64) {
        let origin = *self.origin.get_or_insert(now);
        if self.history.is_empty() {
            self.next_sample = origin;
        }
        let period = self.sample_period.as_secs_f64();
        while self.next_sample <= now {
            let t = self.next_sample;
            for variable in &mut self.variables {
                let value = variable.generate_value(t - origin);
                let history = self.history.entry(variable.name.clone()).or_default();
                history.push(SamplePoint::new(t, value));
                if history.len() > HISTORY_LIMIT {
                    history.drain(..history.len() - HISTORY_LIMIT);
                }
            }
            self.next_sample += period;
        }
    }

    /// Answer a query at wall-clock time `now`
    ///
    /// Returns `None` for queries addressed to another source or of a
    /// muted kind.
    pub fn answer(&mut self, request: &Request, now: f64) -> Option<Response> {
        if request.source_id != self.source_id || self.muted.contains(&request.kind) {
            return None;
        }
        self.advance(now);

        let msg_id = (self.echo_msg_id && !request.msg_id.is_empty())
            .then(|| request.msg_id.clone());
        let response = match request.kind {
            QueryKind::Variables => Response::Catalog(self.catalog_groups()),
            QueryKind::LatestData => Response::Latest {
                msg_id,
                data: request
                    .variables
                    .iter()
                    .filter_map(|name| {
                        let last = self.history.get(name)?.last()?;
                        Some((name.clone(), *last))
                    })
                    .collect(),
            },
            QueryKind::Data => {
                let start = request.start_time.unwrap_or(f64::NEG_INFINITY);
                Response::Window {
                    msg_id,
                    data: request
                        .variables
                        .iter()
                        .filter_map(|name| {
                            let history = self.history.get(name)?;
                            let window = history
                                .iter()
                                .filter(|p| p.timestamp >= start)
                                .copied()
                                .collect();
                            Some((name.clone(), window))
                        })
                        .collect(),
                }
            }
        };
        Some(response)
    }

    /// Variable names grouped by their first path segment
    fn catalog_groups(&self) -> Vec<Vec<String>> {
        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        for variable in &self.variables {
            let prefix = variable.name.split('/').next().unwrap_or_default().to_string();
            match groups.iter_mut().find(|(p, _)| *p == prefix) {
                Some((_, names)) => names.push(variable.name.clone()),
                None => groups.push((prefix, vec![variable.name.clone()])),
            }
        }
        groups.into_iter().map(|(_, names)| names).collect()
    }

    /// Run the black box on its own thread until the handle is stopped
    pub fn spawn<B: Bus + 'static>(mut self, bus: B) -> MockBlackBoxHandle {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let inbox = bus.subscribe();

        let handle = std::thread::spawn(move || {
            tracing::info!(
                "Mock black box '{}' serving {} variables on {}",
                self.source_id,
                self.variables.len(),
                self.group
            );
            while flag.load(Ordering::SeqCst) {
                let message = match inbox.recv_timeout(Duration::from_millis(20)) {
                    Ok(message) => message,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                        tracing::debug!("Mock black box lost its bus subscription");
                        break;
                    }
                };
                if message.group != self.group {
                    continue;
                }
                let Ok(request) = Request::parse(&message.payload) else {
                    continue;
                };
                let Some(response) = self.answer(&request, now_seconds()) else {
                    continue;
                };
                let sent = response
                    .to_json(&request.sender_id)
                    .and_then(|json| bus.shout(&self.group, &json));
                if let Err(e) = sent {
                    tracing::warn!("Mock black box failed to answer {}: {}", request.kind, e);
                }
            }
            tracing::info!("Mock black box '{}' stopped", self.source_id);
        });

        MockBlackBoxHandle {
            running,
            handle: Some(handle),
        }
    }
}

/// Handle to a running [`MockBlackBox`]; stops it when dropped
#[derive(Debug)]
pub struct MockBlackBoxHandle {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MockBlackBoxHandle {
    /// Stop the black box and wait for its thread
    pub fn stop(mut self) {
        self.shutdown();
    }

    /// Check if the black box thread is still running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MockBlackBoxHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;

    fn black_box() -> MockBlackBox {
        MockBlackBox::new("bb", "ROPOD")
            .with_sample_period(Duration::from_millis(100))
            .with_variable("r1/x", MockDataPattern::Constant(1.0))
            .with_variable("r1/y", MockDataPattern::Counter { step: 1.0, min: 0.0, max: 2.0 })
            .with_variable("r2/z", MockDataPattern::Constant(3.0))
    }

    #[test]
    fn test_counter_wraps() {
        let mut var = MockVariableConfig::new(
            "c",
            MockDataPattern::Counter {
                step: 1.0,
                min: 0.0,
                max: 2.0,
            },
        );
        let values: Vec<f64> = (0..5).map(|i| var.generate_value(i as f64)).collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 0.0, 1.0]);
    }

    #[test]
    fn test_demo_variables_share_one_prefix() {
        let mut bb = MockBlackBox::new("bb", "ROPOD").with_demo_variables();
        let names = bb.variable_names();
        assert_eq!(names.len(), 5);
        assert!(names.iter().all(|n| n.starts_with("ropod_001/")));

        let response = bb.answer(&Request::variables("bb", "me"), 1.0).unwrap();
        assert_eq!(response.catalog_names(), names);
    }

    #[test]
    fn test_catalog_is_grouped_by_prefix() {
        let mut bb = black_box();
        let response = bb.answer(&Request::variables("bb", "me"), 100.0).unwrap();
        assert_eq!(
            response,
            Response::Catalog(vec![
                vec!["r1/x".to_string(), "r1/y".to_string()],
                vec!["r2/z".to_string()]
            ])
        );
    }

    #[test]
    fn test_window_start_is_inclusive() {
        let mut bb = black_box();
        let vars = vec!["r1/y".to_string()];
        let Some(Response::Latest { data, .. }) =
            bb.answer(&Request::latest_data("bb", "me", &vars), 100.0)
        else {
            panic!("expected latest");
        };
        let latest = data[0].1;
        assert_eq!(latest.timestamp, 100.0);

        let Some(Response::Window { data, .. }) =
            bb.answer(&Request::data("bb", "me", latest.timestamp, &vars), 100.25)
        else {
            panic!("expected window");
        };
        let window = &data[0].1;
        assert_eq!(window.len(), 3);
        assert_eq!(window[0], latest);
        assert!(window.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_latest_omits_unknown_variables() {
        let mut bb = black_box().without_msg_id_echo();
        let vars = vec!["r2/z".to_string(), "nope".to_string()];
        let response = bb.answer(&Request::latest_data("bb", "me", &vars), 5.0).unwrap();
        assert_eq!(
            response,
            Response::Latest {
                msg_id: None,
                data: vec![("r2/z".to_string(), SamplePoint::new(5.0, 3.0))]
            }
        );
    }

    #[test]
    fn test_other_source_and_muted_queries() {
        let mut bb = black_box().mute(QueryKind::Variables);
        assert!(bb.answer(&Request::variables("bb", "me"), 1.0).is_none());
        assert!(bb.answer(&Request::latest_data("other", "me", &[]), 1.0).is_none());
    }

    #[test]
    fn test_answers_over_bus() {
        let bus = LocalBus::new("client");
        let inbox = bus.subscribe();
        let handle = black_box().spawn(bus.join("bb"));

        let request = Request::variables("bb", "client-id");
        bus.shout("ROPOD", &request.to_json().unwrap()).unwrap();

        let message = inbox.recv_timeout(Duration::from_secs(2)).unwrap();
        let response = Response::parse(&message.payload, "client-id").unwrap().unwrap();
        assert_eq!(response.catalog_names().len(), 3);

        assert!(handle.is_running());
        handle.stop();
    }
}
