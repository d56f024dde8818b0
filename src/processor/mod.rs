//! Validation stage.
//!
//! The acquisition thread deposits raw frames into one of two banks of slots.
//! When a bank fills, the banks flip and a dedicated validation thread takes
//! every pending slot from both banks. Frames are checked in arrival order,
//! converted to `f32` and forwarded to the sink registered for their source.

use crate::config::{PipelineConfig, RecorderConfig};
use crate::error::{PipelineError, Result};
use crate::frame::{FrameBuffer, PayloadType};
use crate::recorder::FrameRecorder;
use crate::stats::{FrameCounters, PipelineStats, RuntimeStatsHandle};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub mod normalize;
pub mod validate;

pub use normalize::normalize_into;
pub use validate::{Disposition, FrameCheck, FrameValidator, SequenceTracker};

/// Consumer of canonical frames for one source.
pub trait FrameSink: Send {
    /// Accept one canonical `f32` frame.
    fn write_frame(&mut self, frame: &FrameBuffer) -> anyhow::Result<()>;

    /// Flush and release resources. Called once when the processor stops.
    fn finish(&mut self) {}
}

/// Builds the sink for a source id the first time it appears in the stream.
pub type SinkFactory = Box<dyn FnMut(u8) -> anyhow::Result<Box<dyn FrameSink>> + Send>;

/// Sink factory that records every source to its own file.
pub fn recorder_factory(
    config: RecorderConfig,
    counters: Arc<FrameCounters>,
    stats: RuntimeStatsHandle,
) -> SinkFactory {
    Box::new(move |source_id: u8| -> anyhow::Result<Box<dyn FrameSink>> {
        let recorder = FrameRecorder::with_stats(&config, source_id, counters.clone(), stats.clone())?;
        Ok(Box::new(recorder) as Box<dyn FrameSink>)
    })
}

struct RawSlot {
    buffer: FrameBuffer,
    bytes_read: usize,
    ticket: u64,
    pending: bool,
}

fn slot_vec(len: usize, element_count: usize, config: &PipelineConfig) -> Vec<RawSlot> {
    (0..len)
        .map(|_| RawSlot {
            buffer: FrameBuffer::with_type(config.payload_type, element_count),
            bytes_read: 0,
            ticket: 0,
            pending: false,
        })
        .collect()
}

struct Bank {
    slots: Vec<RawSlot>,
    filled: usize,
}

struct Shared {
    banks: [Mutex<Bank>; 2],
    active_bank: AtomicUsize,
    can_validate: AtomicBool,
    next_ticket: AtomicU64,
    sources: AtomicUsize,
    last_pass_ns: AtomicU64,
    counters: Arc<FrameCounters>,
    stats: RuntimeStatsHandle,
}

impl Shared {
    fn bank(&self, index: usize) -> MutexGuard<'_, Bank> {
        self.banks[index].lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Lazily populated map of per-source sinks. Lives on the validation thread.
struct SinkMap {
    factory: SinkFactory,
    sinks: HashMap<u8, Option<Box<dyn FrameSink>>>,
}

impl SinkMap {
    fn dispatch(&mut self, frame: &FrameBuffer, shared: &Shared) {
        let source_id = frame.source_id();
        let factory = &mut self.factory;
        let entry = self.sinks.entry(source_id).or_insert_with(|| {
            let sink = match (*factory)(source_id) {
                Ok(sink) => {
                    tracing::info!(source_id, "new source");
                    Some(sink)
                }
                Err(e) => {
                    tracing::warn!(source_id, error = %e, "cannot create sink, dropping source");
                    None
                }
            };
            shared.sources.fetch_add(1, Ordering::Relaxed);
            sink
        });

        if let Some(sink) = entry {
            if let Err(e) = sink.write_frame(frame) {
                tracing::warn!(source_id, error = %e, "sink rejected frame");
            }
        }
    }

    fn finish(&mut self) {
        for sink in self.sinks.values_mut().flatten() {
            sink.finish();
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    work: [Vec<RawSlot>; 2],
    order: Vec<(usize, usize)>,
    validator: FrameValidator,
    canonical: FrameBuffer,
    sinks: SinkMap,
}

impl Worker {
    fn run(mut self, wake_rx: Receiver<()>, stop_rx: Receiver<()>, poll: Duration) {
        loop {
            let stopping = select! {
                recv(stop_rx) -> _ => true,
                recv(wake_rx) -> _ => false,
                default(poll) => false,
            };
            if stopping {
                break;
            }
            if self.shared.can_validate.swap(false, Ordering::AcqRel) {
                self.take_banks();
                self.validate_pending();
            }
        }

        self.take_banks();
        self.validate_pending();
        self.sinks.finish();
        tracing::debug!("validation thread stopped");
    }

    /// Swap both banks for the private work vectors.
    ///
    /// Both locks are held together: every frame left in the banks afterwards
    /// is newer than every frame taken.
    fn take_banks(&mut self) {
        let mut first = self.shared.bank(0);
        let mut second = self.shared.bank(1);
        std::mem::swap(&mut first.slots, &mut self.work[0]);
        std::mem::swap(&mut second.slots, &mut self.work[1]);
    }

    /// Validate every pending slot of both work vectors in ticket order.
    fn validate_pending(&mut self) {
        let work = &mut self.work;
        self.order.clear();
        for (bank, slots) in work.iter().enumerate() {
            self.order.extend(
                slots
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| slot.pending)
                    .map(|(index, _)| (bank, index)),
            );
        }
        if self.order.is_empty() {
            return;
        }
        self.order.sort_unstable_by_key(|&(bank, index)| work[bank][index].ticket);

        let start = Instant::now();
        let counters = &self.shared.counters;
        for &(bank, index) in &self.order {
            let slot = &mut work[bank][index];
            slot.pending = false;

            let check = self.validator.check(&slot.buffer, slot.bytes_read);
            FrameCounters::add(&counters.frames_validated, 1);
            if check.lost > 0 {
                FrameCounters::add(&counters.packets_lost, check.lost);
                tracing::debug!(
                    source_id = slot.buffer.source_id(),
                    counter = slot.buffer.frame_counter(),
                    lost = check.lost,
                    "sequence gap"
                );
            }
            if check.bad {
                FrameCounters::add(&counters.bad_frames, 1);
                tracing::trace!(bytes_read = slot.bytes_read, "bad frame");
            }
            if check.broken {
                FrameCounters::add(&counters.broken_frames, 1);
                tracing::trace!(bytes_read = slot.bytes_read, "broken frame");
            }

            if check.disposition == Disposition::Normalize
                && normalize_into(&slot.buffer, &mut self.canonical)
            {
                self.sinks.dispatch(&self.canonical, &self.shared);
            }
        }

        let elapsed = start.elapsed();
        self.shared
            .last_pass_ns
            .store(elapsed.as_nanos().min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
        self.shared.stats.update(|s| s.validation_pass.record(elapsed));
    }
}

/// Double-banked frame validator with its own worker thread.
///
/// [`put_new_frame`](Self::put_new_frame) is the producer side and only ever
/// holds a lock long enough to swap one buffer.
pub struct FrameProcessor {
    shared: Arc<Shared>,
    slots_per_bank: usize,
    payload_type: PayloadType,
    elements_per_frame: usize,
    wake_tx: Sender<()>,
    stop_tx: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FrameProcessor {
    /// Processor forwarding to sinks built by `factory`.
    pub fn new(config: &PipelineConfig, factory: SinkFactory) -> Result<Self> {
        Self::with_stats(
            config,
            factory,
            Arc::new(FrameCounters::default()),
            RuntimeStatsHandle::new(),
        )
    }

    /// Processor that records every source under `config.output_dir`.
    pub fn with_recorders(config: &PipelineConfig) -> Result<Self> {
        let counters = Arc::new(FrameCounters::default());
        let stats = RuntimeStatsHandle::new();
        let factory = recorder_factory(config.recorder_config(), counters.clone(), stats.clone());
        Self::with_stats(config, factory, counters, stats)
    }

    pub fn with_stats(
        config: &PipelineConfig,
        factory: SinkFactory,
        counters: Arc<FrameCounters>,
        stats: RuntimeStatsHandle,
    ) -> Result<Self> {
        config.validate()?;
        let slots_per_bank = config.slots_per_bank;
        let elements = config.elements_per_frame;

        let shared = Arc::new(Shared {
            banks: [
                Mutex::new(Bank {
                    slots: slot_vec(slots_per_bank, elements, config),
                    filled: 0,
                }),
                Mutex::new(Bank {
                    slots: slot_vec(slots_per_bank, elements, config),
                    filled: 0,
                }),
            ],
            active_bank: AtomicUsize::new(0),
            can_validate: AtomicBool::new(false),
            next_ticket: AtomicU64::new(0),
            sources: AtomicUsize::new(0),
            last_pass_ns: AtomicU64::new(0),
            counters,
            stats,
        });

        let worker = Worker {
            shared: shared.clone(),
            work: [
                slot_vec(slots_per_bank, elements, config),
                slot_vec(slots_per_bank, elements, config),
            ],
            order: Vec::with_capacity(2 * slots_per_bank),
            validator: FrameValidator::from_config(config),
            canonical: FrameBuffer::canonical(elements),
            sinks: SinkMap {
                factory,
                sinks: HashMap::new(),
            },
        };

        let (wake_tx, wake_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded(1);
        let poll = config.worker_poll_interval();
        let handle = std::thread::Builder::new()
            .name("validation".into())
            .spawn(move || worker.run(wake_rx, stop_rx, poll))
            .map_err(|e| PipelineError::spawn("validation", e))?;

        tracing::info!(slots_per_bank, elements, "frame processor started");

        Ok(Self {
            shared,
            slots_per_bank,
            payload_type: config.payload_type,
            elements_per_frame: elements,
            wake_tx,
            stop_tx: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Hand over a raw frame of which `bytes_read` bytes were delivered.
    ///
    /// `buffer` is swapped with a free slot, so on return it holds a recycled
    /// buffer of the same shape. Never blocks on validation.
    pub fn put_new_frame(&self, buffer: &mut FrameBuffer, bytes_read: usize) {
        let active = self.shared.active_bank.load(Ordering::Acquire);
        let mut bank = self.shared.bank(active);
        let index = bank.filled;
        let slot = &mut bank.slots[index];

        if slot.pending {
            FrameCounters::add(&self.shared.counters.bank_overruns, 1);
            tracing::trace!(bank = active, slot = index, "overwriting unvalidated frame");
        }
        std::mem::swap(&mut slot.buffer, buffer);
        slot.bytes_read = bytes_read;
        slot.ticket = self.shared.next_ticket.fetch_add(1, Ordering::Relaxed);
        slot.pending = true;

        bank.filled += 1;
        if bank.filled == bank.slots.len() {
            bank.filled = 0;
            drop(bank);
            self.shared.active_bank.store(1 - active, Ordering::Release);
            self.shared.can_validate.store(true, Ordering::Release);
            let _ = self.wake_tx.try_send(());
        }
    }

    pub fn slots_per_bank(&self) -> usize {
        self.slots_per_bank
    }

    /// Payload type the slot buffers are shaped for.
    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    /// Elements per slot buffer. Buffers handed to
    /// [`put_new_frame`](Self::put_new_frame) must have the same shape.
    pub fn elements_per_frame(&self) -> usize {
        self.elements_per_frame
    }

    /// Total frames missing from sequence gaps.
    pub fn packets_loss(&self) -> u64 {
        FrameCounters::get(&self.shared.counters.packets_lost)
    }

    pub fn bad_frames(&self) -> u64 {
        FrameCounters::get(&self.shared.counters.bad_frames)
    }

    pub fn broken_frames(&self) -> u64 {
        FrameCounters::get(&self.shared.counters.broken_frames)
    }

    pub fn frames_validated(&self) -> u64 {
        FrameCounters::get(&self.shared.counters.frames_validated)
    }

    /// Frames overwritten before the validation thread got to them.
    pub fn overruns(&self) -> u64 {
        FrameCounters::get(&self.shared.counters.bank_overruns)
    }

    /// Duration of the last validation pass.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.shared.last_pass_ns.load(Ordering::Relaxed))
    }

    /// Duration of the last block written by any recorder.
    pub fn save_elapsed(&self) -> Duration {
        self.shared.stats.snapshot().block_write.last
    }

    /// Distinct source ids seen so far.
    pub fn sources(&self) -> usize {
        self.shared.sources.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> &Arc<FrameCounters> {
        &self.shared.counters
    }

    pub fn stats_handle(&self) -> &RuntimeStatsHandle {
        &self.shared.stats
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats::from_runtime(self.shared.stats.snapshot(), self.shared.counters.snapshot())
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().map(|w| w.is_some()).unwrap_or(false)
    }

    /// Validate everything still pending, finish all sinks and join the worker.
    pub fn stop(&self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = stop_tx.send(());
        }
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| PipelineError::Panicked { stage: "validation" })?;
            tracing::info!(
                validated = self.frames_validated(),
                lost = self.packets_loss(),
                bad = self.bad_frames(),
                broken = self.broken_frames(),
                "frame processor stopped"
            );
        }
        Ok(())
    }
}

impl Drop for FrameProcessor {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Frame as seen by a sink: source id, counter, samples.
    pub type Captured = (u8, u16, Vec<f32>);

    #[derive(Clone, Default)]
    pub struct CaptureLog {
        pub frames: Arc<Mutex<Vec<Captured>>>,
        pub finished: Arc<AtomicUsize>,
    }

    impl CaptureLog {
        pub fn frames(&self) -> Vec<Captured> {
            self.frames.lock().unwrap().clone()
        }

        pub fn factory(&self) -> SinkFactory {
            let log = self.clone();
            Box::new(move |_source_id: u8| -> anyhow::Result<Box<dyn FrameSink>> {
                Ok(Box::new(CaptureSink { log: log.clone() }))
            })
        }
    }

    struct CaptureSink {
        log: CaptureLog,
    }

    impl FrameSink for CaptureSink {
        fn write_frame(&mut self, frame: &FrameBuffer) -> anyhow::Result<()> {
            self.log.frames.lock().unwrap().push((
                frame.source_id(),
                frame.frame_counter(),
                frame.samples().to_vec(),
            ));
            Ok(())
        }

        fn finish(&mut self) {
            self.log.finished.fetch_add(1, Ordering::SeqCst);
        }
    }
}
