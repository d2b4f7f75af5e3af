use std::time::{Duration, Instant};

use crate::core::config::Config;

/// Adaptive micro-batch scheduler. Batch size starts at the configured
/// initial value and floats between the min and max bounds driven by an
/// EWMA of batch processing latency:
///
/// - EWMA above target: shrink by 0.9.
/// - EWMA below 0.7×target while the queue runs hot: grow by 1.1.
/// - Otherwise hold.
///
/// Emission honors a minimum cadence unless utilization exceeds the
/// overflow threshold.
#[derive(Debug)]
pub struct AdaptiveScheduler {
    batch_size: usize,
    min_batch: usize,
    max_batch: usize,
    alpha: f64,
    target_ms: f64,
    ewma_ms: Option<f64>,
    cadence: Duration,
    overflow_utilization: f64,
    grow_utilization: f64,
    last_emit: Option<Instant>,

    batches_out: u64,
    deltas_out: u64,
    latency_sum_ms: f64,
}

impl AdaptiveScheduler {
    pub fn new(config: &Config) -> Self {
        AdaptiveScheduler {
            batch_size: config.initial_batch_size.clamp(config.min_batch_size, config.max_batch_size),
            min_batch: config.min_batch_size,
            max_batch: config.max_batch_size,
            alpha: config.latency_ewma_alpha,
            target_ms: config.target_batch_latency.as_secs_f64() * 1000.0,
            ewma_ms: None,
            cadence: config.min_emit_cadence,
            overflow_utilization: config.backpressure_high,
            grow_utilization: config.grow_utilization,
            last_emit: None,

            batches_out: 0,
            deltas_out: 0,
            latency_sum_ms: 0.0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn ewma_latency_ms(&self) -> f64 {
        self.ewma_ms.unwrap_or(0.0)
    }

    pub fn batches_out(&self) -> u64 {
        self.batches_out
    }

    pub fn avg_batch_size(&self) -> f64 {
        if self.batches_out == 0 {
            0.0
        } else {
            self.deltas_out as f64 / self.batches_out as f64
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.batches_out == 0 {
            0.0
        } else {
            self.latency_sum_ms / self.batches_out as f64
        }
    }

    /// Whether a batch may be emitted now. A nonempty queue still waits
    /// for the cadence window unless utilization is past the overflow
    /// threshold.
    pub fn should_emit(&self, now: Instant, utilization: f64, queue_empty: bool) -> bool {
        if queue_empty {
            return false;
        }
        if let Some(last) = self.last_emit {
            if now.duration_since(last) < self.cadence && utilization <= self.overflow_utilization {
                return false;
            }
        }
        true
    }

    pub fn note_emit(&mut self, now: Instant, deltas: usize) {
        self.last_emit = Some(now);
        self.batches_out += 1;
        self.deltas_out += deltas as u64;
    }

    /// Feed back the processing latency of a completed batch and adapt
    /// the batch size.
    pub fn record_latency(&mut self, elapsed: Duration, utilization: f64) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.latency_sum_ms += ms;
        let ewma = match self.ewma_ms {
            Some(prev) => self.alpha * ms + (1.0 - self.alpha) * prev,
            None => ms,
        };
        self.ewma_ms = Some(ewma);

        if ewma > self.target_ms {
            self.batch_size = ((self.batch_size as f64 * 0.9) as usize).max(self.min_batch);
        } else if ewma < 0.7 * self.target_ms && utilization > self.grow_utilization {
            self.batch_size = ((self.batch_size as f64 * 1.1) as usize).min(self.max_batch);
        }
    }

    pub fn reset(&mut self) {
        self.last_emit = None;
        self.ewma_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn test_shrinks_under_high_latency() {
        let mut sched = AdaptiveScheduler::new(&config());
        let start = sched.batch_size();
        assert_eq!(start, 256);
        for _ in 0..10 {
            sched.record_latency(Duration::from_millis(20), 0.1);
        }
        assert_eq!(sched.batch_size(), 256); // already at the floor
    }

    #[test]
    fn test_grows_only_when_fast_and_busy() {
        let mut sched = AdaptiveScheduler::new(&config());
        // Fast but idle queue: hold.
        sched.record_latency(Duration::from_millis(1), 0.2);
        assert_eq!(sched.batch_size(), 256);
        // Fast and busy: grow.
        sched.record_latency(Duration::from_millis(1), 0.7);
        assert_eq!(sched.batch_size(), 281);
    }

    #[test]
    fn test_bounds_hold() {
        let mut sched = AdaptiveScheduler::new(&config());
        for _ in 0..200 {
            sched.record_latency(Duration::from_micros(100), 0.9);
        }
        assert_eq!(sched.batch_size(), 4096);
        for _ in 0..200 {
            sched.record_latency(Duration::from_millis(50), 0.9);
        }
        assert_eq!(sched.batch_size(), 256);
    }

    #[test]
    fn test_ewma_smoothing() {
        let mut sched = AdaptiveScheduler::new(&config());
        sched.record_latency(Duration::from_millis(10), 0.0);
        assert!((sched.ewma_latency_ms() - 10.0).abs() < 1e-9);
        sched.record_latency(Duration::from_millis(20), 0.0);
        // 0.1 * 20 + 0.9 * 10 = 11
        assert!((sched.ewma_latency_ms() - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_cadence_gate_with_overflow_override() {
        let mut sched = AdaptiveScheduler::new(&config());
        let t0 = Instant::now();
        assert!(sched.should_emit(t0, 0.0, false));
        sched.note_emit(t0, 100);

        // Within the 10ms window: held back at modest utilization.
        let t1 = t0 + Duration::from_millis(3);
        assert!(!sched.should_emit(t1, 0.5, false));
        // Overflow utilization overrides the cadence.
        assert!(sched.should_emit(t1, 0.9, false));
        // After the window it flows again.
        let t2 = t0 + Duration::from_millis(11);
        assert!(sched.should_emit(t2, 0.5, false));
        // An empty queue never emits.
        assert!(!sched.should_emit(t2, 0.5, true));
    }
}
