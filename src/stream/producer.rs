//! Producer loops
//!
//! Producers are the only writers of the series store while a session
//! streams. Each one runs until the session's running flag clears and
//! drains its buffers before exiting.

use crate::bus::{Bus, Request};
use crate::config::StreamingConfig;
use crate::store::SeriesStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::pending::PendingBuffer;
use super::router::Correlator;
use super::scheduler::PlaybackScheduler;

/// Everything a producer thread needs
#[derive(Clone)]
pub(crate) struct ProducerContext {
    pub bus: Arc<dyn Bus>,
    pub store: SeriesStore,
    pub running: Arc<AtomicBool>,
    pub correlator: Arc<Correlator>,
    pub group: String,
    pub source_id: String,
    pub sender_id: String,
    pub streaming: StreamingConfig,
}

impl ProducerContext {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register and shout a request. False if the bus refused it.
    fn send(&self, request: &Request) -> bool {
        self.correlator.register(&request.msg_id);
        let sent = request
            .to_json()
            .and_then(|json| self.bus.shout(&self.group, &json));
        match sent {
            Ok(()) => {
                tracing::trace!("Sent {} {}", request.kind, request.msg_id);
                true
            }
            Err(e) => {
                tracing::debug!("Failed to send {}: {}", request.kind, e);
                false
            }
        }
    }
}

/// Tracks whether a variable has gone quiet
#[derive(Debug)]
pub(crate) struct StallWatch {
    timeout: Duration,
    stalled: bool,
}

impl StallWatch {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            stalled: false,
        }
    }

    /// Log once on entering and once on leaving the stalled state
    pub fn check(&mut self, buffer: &PendingBuffer) -> bool {
        let silent = buffer.silent_for();
        if silent > self.timeout {
            if !self.stalled {
                tracing::warn!(
                    "No response for '{}' in {:.1}s; stream stalled",
                    buffer.name(),
                    silent.as_secs_f64()
                );
                self.stalled = true;
            }
        } else if self.stalled {
            tracing::info!("Responses for '{}' resumed", buffer.name());
            self.stalled = false;
        }
        self.stalled
    }
}

/// Catch-up loop for a single variable
///
/// Each cycle asks for everything at or after the latest known timestamp,
/// waits for the correlated response and replays it into the store paced by
/// the source timestamps. Requests go out at most once per poll interval.
pub(crate) fn run_variable_producer(ctx: ProducerContext, buffer: Arc<PendingBuffer>) {
    let name = buffer.name().to_string();
    let variables = vec![name.clone()];
    let poll_interval = ctx.streaming.poll_interval();
    let response_wait = ctx.streaming.response_wait();
    let mut scheduler = PlaybackScheduler::new(&ctx.streaming, ctx.running.clone());
    let mut watch = StallWatch::new(ctx.streaming.stall_timeout());

    tracing::debug!("Producer for '{}' started", name);
    while ctx.is_running() {
        let cycle = Instant::now();
        let seen = buffer.responses();
        let start = buffer.latest().map(|p| p.timestamp).unwrap_or(0.0);
        let request = Request::data(&ctx.source_id, &ctx.sender_id, start, &variables);

        if ctx.send(&request) {
            if let Some(points) = buffer.wait_and_drain(seen, response_wait) {
                let store = &ctx.store;
                match scheduler.deliver(points, |point| store.append(&name, point)) {
                    Ok(delivery) if delivery.abandoned > 0 => {
                        tracing::debug!(
                            "'{}': {} samples not delivered before stop",
                            name,
                            delivery.abandoned
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("Producer for '{}' cannot write: {}", name, e);
                        break;
                    }
                }
            }
        }
        watch.check(&buffer);

        let elapsed = cycle.elapsed();
        if elapsed < poll_interval && !scheduler.pause(poll_interval - elapsed) {
            break;
        }
    }

    let leftover = buffer.drain();
    tracing::debug!(
        "Producer for '{}' stopped ({} queued samples discarded)",
        name,
        leftover.len()
    );
}

/// One loop for all variables
///
/// Asks for the latest value of every variable once per interval and writes
/// whatever arrives as soon as it is seen, without pacing.
pub(crate) fn run_combined_producer(ctx: ProducerContext, buffers: Vec<Arc<PendingBuffer>>) {
    let variables: Vec<String> = buffers.iter().map(|b| b.name().to_string()).collect();
    let interval = ctx.streaming.combined_interval();
    let slice = ctx.streaming.sleep_slice().min(interval);
    let mut scheduler = PlaybackScheduler::new(&ctx.streaming, ctx.running.clone());
    let mut watches: Vec<StallWatch> = buffers
        .iter()
        .map(|_| StallWatch::new(ctx.streaming.stall_timeout()))
        .collect();

    tracing::debug!("Combined producer started for {} variables", variables.len());
    'session: while ctx.is_running() {
        let cycle = Instant::now();
        ctx.send(&Request::latest_data(&ctx.source_id, &ctx.sender_id, &variables));

        loop {
            let remaining = interval.saturating_sub(cycle.elapsed());
            if !scheduler.pause(remaining.min(slice)) {
                break 'session;
            }
            for buffer in &buffers {
                for point in buffer.drain() {
                    if let Err(e) = ctx.store.append(buffer.name(), point) {
                        tracing::error!("Combined producer cannot write: {}", e);
                        break 'session;
                    }
                }
            }
            if cycle.elapsed() >= interval {
                break;
            }
        }

        for (buffer, watch) in buffers.iter().zip(watches.iter_mut()) {
            watch.check(buffer);
        }
    }

    let leftover: usize = buffers.iter().map(|b| b.drain().len()).sum();
    tracing::debug!(
        "Combined producer stopped ({} queued samples discarded)",
        leftover
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SamplePoint;

    #[test]
    fn test_stall_watch_transitions() {
        let buffer = PendingBuffer::new("x", None);
        let mut watch = StallWatch::new(Duration::from_millis(10));
        assert!(!watch.check(&buffer));

        std::thread::sleep(Duration::from_millis(20));
        assert!(watch.check(&buffer));
        assert!(watch.check(&buffer));

        buffer.push_response([SamplePoint::new(1.0, 1.0)]);
        assert!(!watch.check(&buffer));
    }
}
