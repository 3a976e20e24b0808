//! Playback pacing
//!
//! A catch-up response delivers a burst of samples at once. The
//! [`PlaybackScheduler`] spreads that burst back out, sleeping between
//! deliveries for the gap between consecutive source timestamps so the
//! store fills at the rate the source recorded.

use crate::config::StreamingConfig;
use crate::error::Result;
use crate::types::SamplePoint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Playback speed bounds
pub const MIN_PLAYBACK_SPEED: f64 = 0.1;
pub const MAX_PLAYBACK_SPEED: f64 = 10.0;

/// Blocks a producer between deliveries
pub trait Sleeper: Send {
    /// Sleep for `duration` unless `running` clears first
    ///
    /// Returns false if the sleep was cut short by the flag.
    fn sleep(&mut self, duration: Duration, running: &AtomicBool) -> bool;
}

/// Sleeps on the current thread in slices, checking the flag between them
#[derive(Debug, Clone, Copy)]
pub struct ThreadSleeper {
    slice: Duration,
}

impl ThreadSleeper {
    /// Create a sleeper checking the flag every `slice`
    pub fn new(slice: Duration) -> Self {
        Self {
            slice: slice.max(Duration::from_millis(1)),
        }
    }
}

impl Default for ThreadSleeper {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration, running: &AtomicBool) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if !running.load(Ordering::SeqCst) {
                return false;
            }
            let step = remaining.min(self.slice);
            std::thread::sleep(step);
            remaining -= step;
        }
        running.load(Ordering::SeqCst)
    }
}

/// Outcome of delivering one burst
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Samples handed to the sink
    pub delivered: usize,
    /// Samples left undelivered because the running flag cleared
    pub abandoned: usize,
}

/// Paces delivery of buffered samples by their source timestamps
#[derive(Debug)]
pub struct PlaybackScheduler<S: Sleeper = ThreadSleeper> {
    speed: f64,
    sleeper: S,
    running: Arc<AtomicBool>,
}

impl PlaybackScheduler<ThreadSleeper> {
    /// Create a scheduler from the streaming settings
    pub fn new(config: &StreamingConfig, running: Arc<AtomicBool>) -> Self {
        Self::with_sleeper(
            ThreadSleeper::new(config.sleep_slice()),
            config.playback_speed,
            running,
        )
    }
}

impl<S: Sleeper> PlaybackScheduler<S> {
    /// Create a scheduler with a custom sleeper
    pub fn with_sleeper(sleeper: S, speed: f64, running: Arc<AtomicBool>) -> Self {
        Self {
            speed: clamp_speed(speed),
            sleeper,
            running,
        }
    }

    /// Playback speed multiplier (1.0 = source rate)
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Set playback speed, clamped to 0.1-10x
    pub fn set_speed(&mut self, speed: f64) {
        self.speed = clamp_speed(speed);
    }

    /// The sleeper
    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    /// Wall-clock delay between two source timestamps
    ///
    /// A non-positive gap (duplicate or out of order) means no delay.
    pub fn delay_between(&self, previous: f64, next: f64) -> Duration {
        let gap = (next - previous) / self.speed;
        if gap.is_finite() && gap > 0.0 {
            Duration::from_secs_f64(gap)
        } else {
            Duration::ZERO
        }
    }

    /// Sleep for `duration`; false if the running flag cleared meanwhile
    pub fn pause(&mut self, duration: Duration) -> bool {
        if duration.is_zero() {
            return self.running.load(Ordering::SeqCst);
        }
        self.sleeper.sleep(duration, &self.running)
    }

    /// Hand every sample to `sink`, sleeping for the source gap between them
    ///
    /// Stops early when the running flag clears; the remaining samples are
    /// counted as abandoned. A sink error stops delivery and is returned.
    pub fn deliver<F>(&mut self, points: Vec<SamplePoint>, mut sink: F) -> Result<Delivery>
    where
        F: FnMut(SamplePoint) -> Result<()>,
    {
        let total = points.len();
        let mut delivery = Delivery::default();
        let mut previous: Option<f64> = None;

        for point in points {
            if let Some(previous) = previous {
                let delay = self.delay_between(previous, point.timestamp);
                if !self.pause(delay) {
                    break;
                }
            } else if !self.running.load(Ordering::SeqCst) {
                break;
            }
            sink(point)?;
            delivery.delivered += 1;
            previous = Some(point.timestamp);
        }

        delivery.abandoned = total - delivery.delivered;
        Ok(delivery)
    }
}

fn clamp_speed(speed: f64) -> f64 {
    if speed.is_nan() {
        1.0
    } else {
        speed.clamp(MIN_PLAYBACK_SPEED, MAX_PLAYBACK_SPEED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DataFeedError;
    use std::sync::Mutex;

    /// Records requested delays instead of sleeping
    #[derive(Debug, Clone, Default)]
    struct RecordingSleeper {
        delays: Arc<Mutex<Vec<Duration>>>,
        stop_after: Option<usize>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&mut self, duration: Duration, running: &AtomicBool) -> bool {
            let mut delays = self.delays.lock().unwrap();
            delays.push(duration);
            if self.stop_after.is_some_and(|n| delays.len() >= n) {
                running.store(false, Ordering::SeqCst);
            }
            running.load(Ordering::SeqCst)
        }
    }

    fn p(t: f64) -> SamplePoint {
        SamplePoint::new(t, t * 10.0)
    }

    fn scheduler(sleeper: RecordingSleeper, speed: f64) -> PlaybackScheduler<RecordingSleeper> {
        PlaybackScheduler::with_sleeper(sleeper, speed, Arc::new(AtomicBool::new(true)))
    }

    #[test]
    fn test_paces_by_source_gaps() {
        let sleeper = RecordingSleeper::default();
        let delays = sleeper.delays.clone();
        let mut scheduler = scheduler(sleeper, 1.0);

        let mut delivered = Vec::new();
        let result = scheduler
            .deliver(vec![p(1.0), p(1.5), p(1.75)], |point| {
                delivered.push(point);
                Ok(())
            })
            .unwrap();

        assert_eq!(result, Delivery { delivered: 3, abandoned: 0 });
        assert_eq!(delivered, vec![p(1.0), p(1.5), p(1.75)]);
        assert_eq!(
            *delays.lock().unwrap(),
            vec![Duration::from_millis(500), Duration::from_millis(250)]
        );
    }

    #[test]
    fn test_non_positive_gap_is_immediate() {
        let sleeper = RecordingSleeper::default();
        let delays = sleeper.delays.clone();
        let mut scheduler = scheduler(sleeper, 1.0);
        scheduler
            .deliver(vec![p(2.0), p(2.0), p(1.0)], |_| Ok(()))
            .unwrap();
        assert!(delays.lock().unwrap().is_empty());
        assert_eq!(scheduler.delay_between(3.0, 1.0), Duration::ZERO);
    }

    #[test]
    fn test_speed_scales_and_clamps() {
        let mut scheduler = scheduler(RecordingSleeper::default(), 2.0);
        assert_eq!(scheduler.delay_between(0.0, 1.0), Duration::from_millis(500));
        scheduler.set_speed(100.0);
        assert_eq!(scheduler.speed(), MAX_PLAYBACK_SPEED);
        scheduler.set_speed(0.0);
        assert_eq!(scheduler.speed(), MIN_PLAYBACK_SPEED);
        scheduler.set_speed(f64::NAN);
        assert_eq!(scheduler.speed(), 1.0);
    }

    #[test]
    fn test_stops_when_flag_clears() {
        let sleeper = RecordingSleeper {
            stop_after: Some(1),
            ..Default::default()
        };
        let mut scheduler = scheduler(sleeper, 1.0);
        let mut count = 0;
        let result = scheduler
            .deliver(vec![p(0.0), p(0.1), p(0.2)], |_| {
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(result, Delivery { delivered: 1, abandoned: 2 });
    }

    #[test]
    fn test_sink_error_propagates() {
        let mut scheduler = scheduler(RecordingSleeper::default(), 1.0);
        let err = scheduler
            .deliver(vec![p(0.0)], |_| Err(DataFeedError::UnregisteredSeries("x".into())))
            .unwrap_err();
        assert!(matches!(err, DataFeedError::UnregisteredSeries(_)));
    }

    #[test]
    fn test_thread_sleeper_aborts() {
        let running = AtomicBool::new(false);
        let mut sleeper = ThreadSleeper::new(Duration::from_millis(10));
        let started = std::time::Instant::now();
        assert!(!sleeper.sleep(Duration::from_secs(5), &running));
        assert!(started.elapsed() < Duration::from_secs(1));

        let running = AtomicBool::new(true);
        assert!(sleeper.sleep(Duration::from_millis(15), &running));
    }
}
