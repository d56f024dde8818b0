use crate::config::RecorderConfig;
use crate::error::{PipelineError, Result};
use crate::frame::FrameBuffer;
use crate::processor::FrameSink;
use crate::stats::{FrameCounters, RuntimeStatsHandle};
use anyhow::bail;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Smallest power of two not less than `n`; `1` for `n <= 1`.
pub fn nearest_power_of_two(n: usize) -> usize {
    if n <= 1 {
        return 1;
    }
    n.checked_next_power_of_two()
        .unwrap_or(1 << (usize::BITS - 1))
}

/// Float accumulation block. `storage` always holds `capacity` samples;
/// only `..write_pos` is meaningful.
#[derive(Debug, Clone)]
pub struct RecordBlock {
    storage: Vec<f32>,
    write_pos: usize,
    full: bool,
}

impl RecordBlock {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0.0; capacity],
            write_pos: 0,
            full: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.write_pos
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn samples(&self) -> &[f32] {
        &self.storage[..self.write_pos]
    }

    /// Copy as much of `samples` as fits; returns how many were taken.
    fn fill(&mut self, samples: &[f32]) -> usize {
        let take = self.remaining().min(samples.len());
        self.storage[self.write_pos..self.write_pos + take].copy_from_slice(&samples[..take]);
        self.write_pos += take;
        self.full = self.write_pos == self.capacity();
        take
    }

    fn reset(&mut self) {
        self.write_pos = 0;
        self.full = false;
    }
}

/// State shared between the recorder and its writer thread.
struct WriterShared {
    path: PathBuf,
    pending: Mutex<Vec<f32>>,
    needs_write: AtomicBool,
    blocks_written: AtomicU64,
    blocks_dropped: AtomicU64,
    write_failures: AtomicU64,
    last_write_ns: AtomicU64,
    counters: Arc<FrameCounters>,
    stats: RuntimeStatsHandle,
}

impl WriterShared {
    fn pending(&self) -> MutexGuard<'_, Vec<f32>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Swap a full block into the pending slot. Returns `true` if an unwritten
    /// block was already waiting there and has now been replaced.
    fn publish(&self, storage: &mut Vec<f32>) -> bool {
        let mut pending = self.pending();
        std::mem::swap(&mut *pending, storage);
        self.needs_write.swap(true, Ordering::AcqRel)
    }

    /// Take the pending block, if any, into `local` and write it out.
    fn write_pending(&self, local: &mut Vec<f32>) {
        if !self.needs_write.load(Ordering::Acquire) {
            return;
        }
        {
            let mut pending = self.pending();
            if !self.needs_write.swap(false, Ordering::AcqRel) {
                return;
            }
            std::mem::swap(&mut *pending, local);
        }

        let start = Instant::now();
        match write_block(&self.path, local) {
            Ok(()) => {
                let elapsed = start.elapsed();
                self.last_write_ns
                    .store(elapsed.as_nanos().min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
                self.blocks_written.fetch_add(1, Ordering::Relaxed);
                FrameCounters::add(&self.counters.blocks_written, 1);
                self.stats.update(|s| s.block_write.record(elapsed));
                tracing::trace!(path = %self.path.display(), ?elapsed, "record block written");
            }
            Err(e) => {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                FrameCounters::add(&self.counters.write_failures, 1);
                tracing::error!(path = %self.path.display(), error = %e, "failed to write record block");
            }
        }
    }
}

/// Truncate the sink and write one block as little-endian `f32`.
fn write_block(path: &Path, samples: &[f32]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytemuck::cast_slice(samples))?;
    file.flush()
}

fn run_writer(shared: Arc<WriterShared>, capacity: usize, wake_rx: Receiver<()>, stop_rx: Receiver<()>, poll: Duration) {
    let mut local = vec![0.0f32; capacity];
    loop {
        let stopping = select! {
            recv(stop_rx) -> _ => true,
            recv(wake_rx) -> _ => false,
            default(poll) => false,
        };
        shared.write_pending(&mut local);
        if stopping {
            break;
        }
    }
}

/// Repacks normalized frames of any length into power-of-two blocks and
/// hands each full block to a dedicated writer thread.
///
/// Each flush overwrites the sink with the latest block only. If a block fills
/// before the writer picked up the previous one, the previous one is dropped.
pub struct FrameRecorder {
    source_id: u8,
    blocks: Vec<RecordBlock>,
    active_block: usize,
    blocks_completed: u64,
    shared: Arc<WriterShared>,
    wake_tx: Sender<()>,
    stop_tx: Option<Sender<()>>,
    writer: Option<JoinHandle<()>>,
}

impl FrameRecorder {
    pub fn new(config: &RecorderConfig, source_id: u8) -> Result<Self> {
        Self::with_stats(
            config,
            source_id,
            Arc::new(FrameCounters::default()),
            RuntimeStatsHandle::new(),
        )
    }

    /// Build a recorder that also reports into pipeline-wide counters and timings.
    pub fn with_stats(
        config: &RecorderConfig,
        source_id: u8,
        counters: Arc<FrameCounters>,
        stats: RuntimeStatsHandle,
    ) -> Result<Self> {
        let capacity = nearest_power_of_two(config.block_elements);
        let path = config.sink_path(source_id);

        if let Err(e) = std::fs::create_dir_all(&config.output_dir) {
            tracing::warn!(dir = %config.output_dir.display(), error = %e, "cannot create output directory");
        }

        let shared = Arc::new(WriterShared {
            path,
            pending: Mutex::new(vec![0.0; capacity]),
            needs_write: AtomicBool::new(false),
            blocks_written: AtomicU64::new(0),
            blocks_dropped: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            last_write_ns: AtomicU64::new(0),
            counters,
            stats,
        });

        let (wake_tx, wake_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded(1);
        let writer_shared = shared.clone();
        let poll = config.poll_interval;
        let writer = std::thread::Builder::new()
            .name(format!("recorder-{source_id}"))
            .spawn(move || run_writer(writer_shared, capacity, wake_rx, stop_rx, poll))
            .map_err(|e| PipelineError::spawn("recorder", e))?;

        tracing::info!(source_id, capacity, path = %shared.path.display(), "recorder started");

        Ok(Self {
            source_id,
            blocks: (0..config.blocks.max(1)).map(|_| RecordBlock::with_capacity(capacity)).collect(),
            active_block: 0,
            blocks_completed: 0,
            shared,
            wake_tx,
            stop_tx: Some(stop_tx),
            writer: Some(writer),
        })
    }

    /// Append samples, spilling into the next block whenever one fills.
    /// Never waits on disk I/O.
    pub fn put_new_frame(&mut self, samples: &[f32]) {
        let mut offset = 0;
        while offset < samples.len() {
            offset += self.blocks[self.active_block].fill(&samples[offset..]);
            if self.blocks[self.active_block].is_full() {
                self.hand_off_active();
                self.active_block = (self.active_block + 1) % self.blocks.len();
            }
        }
    }

    fn hand_off_active(&mut self) {
        let block = &mut self.blocks[self.active_block];
        if self.shared.publish(&mut block.storage) {
            self.shared.blocks_dropped.fetch_add(1, Ordering::Relaxed);
            FrameCounters::add(&self.shared.counters.blocks_dropped, 1);
            tracing::debug!(source_id = self.source_id, "writer behind, replaced pending block");
        }
        block.reset();
        self.blocks_completed += 1;
        let _ = self.wake_tx.try_send(());
    }

    pub fn source_id(&self) -> u8 {
        self.source_id
    }

    /// Samples per block (a power of two).
    pub fn capacity(&self) -> usize {
        self.blocks[0].capacity()
    }

    pub fn blocks(&self) -> &[RecordBlock] {
        &self.blocks
    }

    pub fn active_block(&self) -> usize {
        self.active_block
    }

    /// Blocks that filled and were handed to the writer.
    pub fn blocks_completed(&self) -> u64 {
        self.blocks_completed
    }

    pub fn blocks_written(&self) -> u64 {
        self.shared.blocks_written.load(Ordering::Relaxed)
    }

    pub fn blocks_dropped(&self) -> u64 {
        self.shared.blocks_dropped.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.shared.write_failures.load(Ordering::Relaxed)
    }

    /// Duration of the last successful block write.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.shared.last_write_ns.load(Ordering::Relaxed))
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Stop the writer after it flushes any pending block. Partially filled
    /// blocks are not written.
    pub fn shutdown(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                tracing::error!(source_id = self.source_id, "recorder writer panicked");
            }
        }
    }
}

impl FrameSink for FrameRecorder {
    fn write_frame(&mut self, frame: &FrameBuffer) -> anyhow::Result<()> {
        if !frame.is_canonical() {
            bail!(
                "recorder {} expects canonical f32 frames, got {:?}",
                self.source_id,
                frame.payload_type()
            );
        }
        self.put_new_frame(frame.samples());
        Ok(())
    }

    fn finish(&mut self) {
        self.shutdown();
    }
}

impl Drop for FrameRecorder {
    fn drop(&mut self) {
        self.shutdown();
    }
}
