use std::time::{Duration, Instant};

/// Fixed-rate scheduler tick.
///
/// Deadlines advance by exactly one period per cycle so pacing does not drift
/// with per-cycle jitter. Each wait sleeps until `spin_threshold` before the
/// deadline and spins the remainder. A cycle that ends more than one period
/// late resynchronizes to the current time instead of bursting to catch up.
#[derive(Debug)]
pub struct Pacer {
    period: Duration,
    spin_threshold: Duration,
    next_deadline: Option<Instant>,
    overruns: u64,
}

impl Pacer {
    pub fn new(period: Duration, spin_threshold: Duration) -> Self {
        Self {
            period,
            spin_threshold: spin_threshold.min(period),
            next_deadline: None,
            overruns: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Cycles that finished past their deadline.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Start the schedule one period from now.
    pub fn reset(&mut self) {
        self.next_deadline = Some(Instant::now() + self.period);
    }

    /// Block until the current cycle's deadline, then arm the next one.
    pub fn wait(&mut self) {
        let deadline = match self.next_deadline {
            Some(deadline) => deadline,
            None => Instant::now() + self.period,
        };

        let now = Instant::now();
        if now > deadline {
            self.overruns += 1;
        } else {
            sleep_then_spin(deadline, self.spin_threshold);
        }

        let next = deadline + self.period;
        let now = Instant::now();
        self.next_deadline = Some(if now > next { now + self.period } else { next });
    }
}

fn sleep_then_spin(deadline: Instant, spin_threshold: Duration) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let remaining = deadline - now;
        if remaining > spin_threshold {
            std::thread::sleep(remaining - spin_threshold);
        } else {
            std::hint::spin_loop();
        }
    }
}

/// Histogram of cycle durations.
#[derive(Debug, Clone)]
pub struct DelayHistogram {
    // Buckets in microseconds: <1ms, <2ms, <5ms, <10ms, <20ms, <50ms, <100ms, >100ms
    buckets: [u64; 8],
    bucket_limits_us: [u64; 7],
    total_samples: u64,
    sum_delay_us: u64,
    min_delay_us: u64,
    max_delay_us: u64,
}

impl Default for DelayHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayHistogram {
    pub fn new() -> Self {
        Self {
            buckets: [0; 8],
            bucket_limits_us: [1000, 2000, 5000, 10000, 20000, 50000, 100000],
            total_samples: 0,
            sum_delay_us: 0,
            min_delay_us: u64::MAX,
            max_delay_us: 0,
        }
    }

    pub fn record(&mut self, delay: Duration) {
        let delay_us = delay.as_micros().min(u128::from(u64::MAX)) as u64;

        self.min_delay_us = self.min_delay_us.min(delay_us);
        self.max_delay_us = self.max_delay_us.max(delay_us);
        self.sum_delay_us = self.sum_delay_us.saturating_add(delay_us);
        self.total_samples += 1;

        let bucket_idx = self
            .bucket_limits_us
            .iter()
            .position(|&limit| delay_us < limit)
            .unwrap_or(self.bucket_limits_us.len());
        self.buckets[bucket_idx] += 1;
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn buckets(&self) -> &[u64; 8] {
        &self.buckets
    }

    pub fn mean_us(&self) -> f64 {
        if self.total_samples == 0 {
            0.0
        } else {
            self.sum_delay_us as f64 / self.total_samples as f64
        }
    }

    pub fn min_us(&self) -> Option<u64> {
        (self.total_samples > 0).then_some(self.min_delay_us)
    }

    pub fn max_us(&self) -> u64 {
        self.max_delay_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_records_samples() {
        let mut h = DelayHistogram::new();
        h.record(Duration::from_micros(500));
        h.record(Duration::from_micros(1_500));
        h.record(Duration::from_millis(12));

        assert_eq!(h.total_samples(), 3);
        assert_eq!(h.buckets()[0], 1);
        assert_eq!(h.buckets()[1], 1);
        assert_eq!(h.buckets()[4], 1);
        assert_eq!(h.min_us(), Some(500));
        assert_eq!(h.max_us(), 12_000);
    }

    #[test]
    fn slow_cycles_land_in_last_bucket() {
        let mut h = DelayHistogram::new();
        h.record(Duration::from_millis(250));
        assert_eq!(h.buckets()[7], 1);
    }

    #[test]
    fn empty_histogram_has_no_minimum() {
        let h = DelayHistogram::new();
        assert_eq!(h.min_us(), None);
        assert_eq!(h.mean_us(), 0.0);
    }

    #[test]
    fn pacer_holds_period() {
        let mut pacer = Pacer::new(Duration::from_millis(5), Duration::from_micros(500));
        let start = Instant::now();
        pacer.reset();
        for _ in 0..10 {
            pacer.wait();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(150), "elapsed {elapsed:?}");
    }

    #[test]
    fn pacer_resyncs_after_overrun() {
        let mut pacer = Pacer::new(Duration::from_millis(2), Duration::ZERO);
        pacer.reset();
        std::thread::sleep(Duration::from_millis(10));
        pacer.wait();
        assert_eq!(pacer.overruns(), 1);

        let start = Instant::now();
        pacer.wait();
        assert!(start.elapsed() >= Duration::from_millis(1));
    }
}
