//! Rolling observation window for alarm metrics.
//!
//! Holds timestamped error, throttle, and duration samples and answers
//! aggregate queries over the trailing window. Samples older than the window
//! are pruned on every access, so readings never include stale data.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Samples {
    errors: VecDeque<Instant>,
    throttles: VecDeque<Instant>,
    durations: VecDeque<(Instant, Duration)>,
}

/// Sliding window of pipeline health samples.
#[derive(Debug)]
pub struct PipelineWindow {
    window: Duration,
    samples: Mutex<Samples>,
}

impl PipelineWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: Mutex::new(Samples::default()),
        }
    }

    pub fn record_error(&self) {
        let now = Instant::now();
        let mut samples = self.lock();
        samples.errors.push_back(now);
        self.prune(&mut samples, now);
    }

    pub fn record_throttle(&self) {
        let now = Instant::now();
        let mut samples = self.lock();
        samples.throttles.push_back(now);
        self.prune(&mut samples, now);
    }

    pub fn record_duration(&self, duration: Duration) {
        let now = Instant::now();
        let mut samples = self.lock();
        samples.durations.push_back((now, duration));
        self.prune(&mut samples, now);
    }

    /// Failed invocations within the window.
    pub fn error_count(&self) -> usize {
        let now = Instant::now();
        let mut samples = self.lock();
        self.prune(&mut samples, now);
        samples.errors.len()
    }

    /// Throttled receive attempts within the window.
    pub fn throttle_count(&self) -> usize {
        let now = Instant::now();
        let mut samples = self.lock();
        self.prune(&mut samples, now);
        samples.throttles.len()
    }

    /// 95th-percentile invocation duration within the window, in seconds.
    /// Returns 0.0 when there are no samples.
    pub fn p95_duration_secs(&self) -> f64 {
        let now = Instant::now();
        let mut samples = self.lock();
        self.prune(&mut samples, now);

        if samples.durations.is_empty() {
            return 0.0;
        }

        let mut sorted: Vec<f64> = samples
            .durations
            .iter()
            .map(|(_, d)| d.as_secs_f64())
            .collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        // Nearest-rank percentile
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Samples> {
        // Sample recording never panics while holding the lock
        self.samples.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn prune(&self, samples: &mut Samples, now: Instant) {
        let cutoff = now.checked_sub(self.window);
        let Some(cutoff) = cutoff else {
            return;
        };
        while samples.errors.front().is_some_and(|t| *t < cutoff) {
            samples.errors.pop_front();
        }
        while samples.throttles.front().is_some_and(|t| *t < cutoff) {
            samples.throttles.pop_front();
        }
        while samples.durations.front().is_some_and(|(t, _)| *t < cutoff) {
            samples.durations.pop_front();
        }
    }
}
