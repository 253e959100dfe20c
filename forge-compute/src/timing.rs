//! Wall-clock timing utilities for benchmark measurement.

use std::time::{Duration, Instant};

/// Simple wall-clock timer for benchmarking.
pub struct BenchTimer {
    start: Instant,
}

impl BenchTimer {
    /// Start the timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return elapsed time in milliseconds.
    pub fn stop(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }
}

/// Throughput in millions of keys per second.
pub fn mkeys_per_sec(keys: usize, elapsed_ms: f64) -> f64 {
    if elapsed_ms <= 0.0 {
        return 0.0;
    }
    keys as f64 / (elapsed_ms * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_measures_positive() {
        let timer = BenchTimer::start();
        std::thread::sleep(Duration::from_millis(10));
        let elapsed = timer.stop();
        assert!(elapsed >= 5.0, "Timer should measure at least ~10ms (got {elapsed}ms)");
    }

    #[test]
    fn test_mkeys_per_sec() {
        assert_eq!(mkeys_per_sec(1_000_000, 1000.0), 1.0);
        assert_eq!(mkeys_per_sec(10, 0.0), 0.0);
    }
}
