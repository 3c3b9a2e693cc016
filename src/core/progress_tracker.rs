//! Progress throttling and speed statistics
//!
//! Fetchers sample progress at a fixed cadence ([`ProgressThrottle`]), compute the
//! instantaneous throughput of each window and optionally smooth it over the last few
//! samples ([`SpeedSampler`]). List-style consumers can further thin the event stream
//! with a [`ProgressFilter`], which never holds back a terminal event.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::core::events::DownloadEvent;
use crate::core::models::TaskId;

/// Default cadence of progress updates
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(800);

/// Default number of samples in the speed moving average
pub const DEFAULT_SPEED_SAMPLES: usize = 5;

/// Bytes per second for `delta_bytes` transferred over `elapsed`
pub fn instant_speed(delta_bytes: u64, elapsed: Duration) -> f64 {
    let millis = elapsed.as_millis();
    if millis == 0 {
        return 0.0;
    }
    delta_bytes as f64 * 1000.0 / millis as f64
}

/// Seconds left at `speed`, `None` when unknown
pub fn eta_seconds(done: u64, total: u64, speed: f64) -> Option<u64> {
    if speed > 0.0 && total > done {
        Some(((total - done) as f64 / speed) as u64)
    } else {
        None
    }
}

/// Trailing moving average over the last `capacity` speed samples
#[derive(Debug, Clone)]
pub struct SpeedSampler {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl SpeedSampler {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a sample and return the smoothed speed
    pub fn push(&mut self, speed: f64) -> f64 {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(speed.max(0.0));
        self.average()
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for SpeedSampler {
    fn default() -> Self {
        Self::new(DEFAULT_SPEED_SAMPLES)
    }
}

/// One emitted progress window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub bytes: u64,
    pub delta_bytes: u64,
    pub elapsed: Duration,
    /// Instantaneous bytes per second over the window
    pub speed: f64,
}

/// Emits at most one sample per `interval`
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Instant,
    last_bytes: u64,
}

impl ProgressThrottle {
    pub fn new(interval: Duration, start_bytes: u64) -> Self {
        Self::starting_at(interval, start_bytes, Instant::now())
    }

    pub fn starting_at(interval: Duration, start_bytes: u64, now: Instant) -> Self {
        Self {
            interval,
            last_emit: now,
            last_bytes: start_bytes,
        }
    }

    /// A sample if the window has elapsed, otherwise `None`
    pub fn poll(&mut self, bytes: u64, now: Instant) -> Option<ProgressSample> {
        let elapsed = now.saturating_duration_since(self.last_emit);
        if elapsed < self.interval {
            return None;
        }
        Some(self.take(bytes, now))
    }

    /// Close the current window regardless of cadence (final update)
    pub fn flush(&mut self, bytes: u64, now: Instant) -> ProgressSample {
        self.take(bytes, now)
    }

    fn take(&mut self, bytes: u64, now: Instant) -> ProgressSample {
        let elapsed = now.saturating_duration_since(self.last_emit);
        let delta_bytes = bytes.saturating_sub(self.last_bytes);
        self.last_emit = now;
        self.last_bytes = bytes;

        ProgressSample {
            bytes,
            delta_bytes,
            elapsed,
            speed: instant_speed(delta_bytes, elapsed),
        }
    }
}

/// Per-task gate for list views: cadence plus a minimum percentage step
#[derive(Debug, Clone)]
pub struct ProgressGate {
    min_interval: Duration,
    min_delta_percent: f64,
    last: Option<(Instant, f64)>,
}

impl ProgressGate {
    pub fn new(min_interval: Duration, min_delta_percent: f64) -> Self {
        Self {
            min_interval,
            min_delta_percent,
            last: None,
        }
    }

    pub fn should_emit(&mut self, percent: f64, terminal: bool, now: Instant) -> bool {
        let pass = terminal
            || match self.last {
                None => true,
                Some((at, last_percent)) => {
                    now.saturating_duration_since(at) >= self.min_interval
                        && (percent - last_percent).abs() >= self.min_delta_percent
                }
            };

        if pass {
            self.last = Some((now, percent));
        }
        pass
    }
}

/// Thins an event stream for list consumers; only progress events are ever held back
#[derive(Debug)]
pub struct ProgressFilter {
    min_interval: Duration,
    min_delta_percent: f64,
    gates: HashMap<TaskId, ProgressGate>,
}

impl ProgressFilter {
    pub fn new(min_interval: Duration, min_delta_percent: f64) -> Self {
        Self {
            min_interval,
            min_delta_percent,
            gates: HashMap::new(),
        }
    }

    pub fn admit(&mut self, event: &DownloadEvent) -> bool {
        self.admit_at(event, Instant::now())
    }

    pub fn admit_at(&mut self, event: &DownloadEvent, now: Instant) -> bool {
        let percent = match event {
            DownloadEvent::TaskProgress {
                bytes_done,
                bytes_total,
                ..
            } => percent_of(*bytes_done, *bytes_total),
            DownloadEvent::SegmentProgress {
                segments_done,
                segments_total,
                ..
            } => percent_of(*segments_done as u64, *segments_total as u64),
            DownloadEvent::TaskDeleted { task_id } => {
                self.gates.remove(task_id);
                return true;
            }
            _ => return true,
        };

        let (interval, delta) = (self.min_interval, self.min_delta_percent);
        self.gates
            .entry(event.task_id())
            .or_insert_with(|| ProgressGate::new(interval, delta))
            .should_emit(percent, false, now)
    }
}

fn percent_of(done: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        done as f64 * 100.0 / total as f64
    }
}
