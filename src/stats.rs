use crate::timing::DelayHistogram;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Count, total, worst and latest duration of one repeated operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StageStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
    pub last: Duration,
}

impl StageStats {
    pub fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total = self.total.saturating_add(elapsed);
        self.max = self.max.max(elapsed);
        self.last = elapsed;
    }

    pub fn mean(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(count) => self.total / count,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64),
        }
    }
}

/// Timing aggregates for each stage.
#[derive(Clone, Debug, Default)]
pub struct RuntimeStats {
    /// `DataSource::read` duration.
    pub acquisition_read: StageStats,
    /// Handing a filled buffer to the processor.
    pub acquisition_handoff: StageStats,
    /// Full acquisition cycle, including pacing.
    pub acquisition_cycle: StageStats,
    pub cycle_histogram: DelayHistogram,
    /// One validation pass.
    pub validation_pass: StageStats,
    /// One block written to a recording sink.
    pub block_write: StageStats,
}

/// Shared, lock-protected [`RuntimeStats`]. Stage threads record into it and
/// readers take snapshots.
#[derive(Clone, Default)]
pub struct RuntimeStatsHandle {
    inner: Arc<Mutex<RuntimeStats>>,
}

impl RuntimeStatsHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RuntimeStats> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn update(&self, record: impl FnOnce(&mut RuntimeStats)) {
        record(&mut self.lock());
    }

    pub fn snapshot(&self) -> RuntimeStats {
        self.lock().clone()
    }
}

/// Monotonic event counters shared across stage threads.
#[derive(Debug, Default)]
pub struct FrameCounters {
    pub frames_acquired: AtomicU64,
    pub frames_validated: AtomicU64,
    pub packets_lost: AtomicU64,
    pub bad_frames: AtomicU64,
    pub broken_frames: AtomicU64,
    pub bank_overruns: AtomicU64,
    pub blocks_written: AtomicU64,
    pub blocks_dropped: AtomicU64,
    pub write_failures: AtomicU64,
}

impl FrameCounters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            frames_acquired: Self::get(&self.frames_acquired),
            frames_validated: Self::get(&self.frames_validated),
            packets_lost: Self::get(&self.packets_lost),
            bad_frames: Self::get(&self.bad_frames),
            broken_frames: Self::get(&self.broken_frames),
            bank_overruns: Self::get(&self.bank_overruns),
            blocks_written: Self::get(&self.blocks_written),
            blocks_dropped: Self::get(&self.blocks_dropped),
            write_failures: Self::get(&self.write_failures),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub frames_acquired: u64,
    pub frames_validated: u64,
    pub packets_lost: u64,
    pub bad_frames: u64,
    pub broken_frames: u64,
    pub bank_overruns: u64,
    pub blocks_written: u64,
    pub blocks_dropped: u64,
    pub write_failures: u64,
}

/// Point-in-time report for telemetry consumers. Durations are in milliseconds.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PipelineStats {
    #[serde(flatten)]
    pub counters: CounterSnapshot,

    pub read_last_ms: f64,
    pub read_avg_ms: f64,
    pub read_max_ms: f64,
    pub handoff_last_ms: f64,
    pub handoff_max_ms: f64,
    pub cycle_last_ms: f64,
    pub cycle_avg_ms: f64,
    pub cycle_max_ms: f64,
    pub validation_last_ms: f64,
    pub validation_avg_ms: f64,
    pub validation_max_ms: f64,
    pub write_last_ms: f64,
    pub write_avg_ms: f64,
    pub write_max_ms: f64,
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}

impl PipelineStats {
    pub fn from_runtime(s: RuntimeStats, counters: CounterSnapshot) -> Self {
        Self {
            counters,

            read_last_ms: ms(s.acquisition_read.last),
            read_avg_ms: ms(s.acquisition_read.mean()),
            read_max_ms: ms(s.acquisition_read.max),
            handoff_last_ms: ms(s.acquisition_handoff.last),
            handoff_max_ms: ms(s.acquisition_handoff.max),
            cycle_last_ms: ms(s.acquisition_cycle.last),
            cycle_avg_ms: ms(s.acquisition_cycle.mean()),
            cycle_max_ms: ms(s.acquisition_cycle.max),
            validation_last_ms: ms(s.validation_pass.last),
            validation_avg_ms: ms(s.validation_pass.mean()),
            validation_max_ms: ms(s.validation_pass.max),
            write_last_ms: ms(s.block_write.last),
            write_avg_ms: ms(s.block_write.mean()),
            write_max_ms: ms(s.block_write.max),
        }
    }

    /// Lost packets as a percentage of acquired frames.
    pub fn loss_percent(&self) -> f64 {
        if self.counters.frames_acquired == 0 {
            0.0
        } else {
            100.0 * self.counters.packets_lost as f64 / self.counters.frames_acquired as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_updates_and_snapshot() {
        let h = RuntimeStatsHandle::new();
        h.update(|s| {
            s.validation_pass.record(Duration::from_millis(1));
            s.validation_pass.record(Duration::from_millis(3));
        });
        let snap = h.snapshot().validation_pass;
        assert_eq!(snap.count, 2);
        assert_eq!(snap.max, Duration::from_millis(3));
        assert_eq!(snap.last, Duration::from_millis(3));
        assert_eq!(snap.mean(), Duration::from_millis(2));

        let clone = h.clone();
        clone.update(|s| s.block_write.record(Duration::from_micros(10)));
        assert_eq!(h.snapshot().block_write.count, 1);
    }

    #[test]
    fn empty_stage_has_zero_mean() {
        assert_eq!(StageStats::default().mean(), Duration::ZERO);
    }

    #[test]
    fn counters_snapshot_reflects_adds() {
        let c = FrameCounters::default();
        FrameCounters::add(&c.packets_lost, 3);
        FrameCounters::add(&c.bad_frames, 1);
        let snap = c.snapshot();
        assert_eq!(snap.packets_lost, 3);
        assert_eq!(snap.bad_frames, 1);
        assert_eq!(snap.broken_frames, 0);
    }

    #[test]
    fn pipeline_stats_conversion_uses_ms_units() {
        let mut r = RuntimeStats::default();
        r.acquisition_cycle.record(Duration::from_millis(5));
        r.block_write.record(Duration::from_millis(2));
        let counters = CounterSnapshot {
            frames_acquired: 200,
            packets_lost: 2,
            ..CounterSnapshot::default()
        };
        let p = PipelineStats::from_runtime(r, counters);

        assert_eq!(p.cycle_avg_ms, 5.0);
        assert_eq!(p.write_last_ms, 2.0);
        assert_eq!(p.loss_percent(), 1.0);
    }
}
