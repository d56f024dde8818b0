use crate::config::PipelineConfig;
use crate::error::{ConfigError, PipelineError, Result, SourceError};
use crate::frame::FrameBuffer;
use crate::processor::FrameProcessor;
use crate::source::DataSource;
use crate::stats::{FrameCounters, PipelineStats};
use crate::timing::Pacer;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Running,
    Stopped,
}

impl ControllerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

fn nanos(d: Duration) -> u64 {
    d.as_nanos().min(u128::from(u64::MAX)) as u64
}

/// Values published by the acquisition thread.
#[derive(Default)]
struct Telemetry {
    frames_total: AtomicU64,
    last_counter: AtomicU16,
    last_magic: AtomicU32,
    read_ns: AtomicU64,
    handoff_ns: AtomicU64,
    cycle_ns: AtomicU64,
    failed: AtomicBool,
    error: Mutex<Option<SourceError>>,
}

struct Acquisition {
    source: Box<dyn DataSource>,
    processor: Arc<FrameProcessor>,
    telemetry: Arc<Telemetry>,
    ring: Vec<FrameBuffer>,
    pacer: Pacer,
    stop_rx: Receiver<()>,
}

impl Acquisition {
    fn run(mut self) {
        let counters = self.processor.counters().clone();
        let stats = self.processor.stats_handle().clone();
        let mut slot = 0;
        let mut cycle_start = Instant::now();
        self.pacer.reset();

        loop {
            match self.stop_rx.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => break,
            }

            let buffer = &mut self.ring[slot];
            buffer.zero_payload();
            let read_start = Instant::now();
            let result = self.source.read(buffer.as_bytes_mut());
            let read_elapsed = read_start.elapsed();

            match result {
                Ok(bytes_read) => {
                    self.telemetry.last_magic.store(buffer.magic_word(), Ordering::Relaxed);
                    self.telemetry.last_counter.store(buffer.frame_counter(), Ordering::Relaxed);

                    let handoff_start = Instant::now();
                    self.processor.put_new_frame(buffer, bytes_read);
                    let handoff_elapsed = handoff_start.elapsed();

                    self.telemetry.frames_total.fetch_add(1, Ordering::Relaxed);
                    self.telemetry.read_ns.store(nanos(read_elapsed), Ordering::Relaxed);
                    self.telemetry.handoff_ns.store(nanos(handoff_elapsed), Ordering::Relaxed);
                    FrameCounters::add(&counters.frames_acquired, 1);
                    stats.update(|s| {
                        s.acquisition_read.record(read_elapsed);
                        s.acquisition_handoff.record(handoff_elapsed);
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "data source failed, stopping acquisition");
                    *self.telemetry.error.lock().unwrap_or_else(|p| p.into_inner()) = Some(e);
                    self.telemetry.failed.store(true, Ordering::Release);
                    break;
                }
            }

            slot = (slot + 1) % self.ring.len();
            self.pacer.wait();

            let now = Instant::now();
            let cycle = now - cycle_start;
            cycle_start = now;
            self.telemetry.cycle_ns.store(nanos(cycle), Ordering::Relaxed);
            stats.update(|s| {
                s.acquisition_cycle.record(cycle);
                s.cycle_histogram.record(cycle);
            });
        }

        tracing::debug!(
            frames = self.telemetry.frames_total.load(Ordering::Relaxed),
            overruns = self.pacer.overruns(),
            "acquisition thread stopped"
        );
    }
}

/// Owns the pipeline: reads frames from a [`DataSource`] at a fixed rate and
/// feeds them to a [`FrameProcessor`].
pub struct Controller {
    config: PipelineConfig,
    processor: Arc<FrameProcessor>,
    source: Option<Box<dyn DataSource>>,
    telemetry: Arc<Telemetry>,
    state: ControllerState,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Controller {
    /// Pipeline recording every source under `config.output_dir`.
    pub fn new(source: impl DataSource + 'static, config: PipelineConfig) -> Result<Self> {
        let processor = FrameProcessor::with_recorders(&config)?;
        Self::with_processor(source, config, processor)
    }

    /// Pipeline feeding an existing processor. The processor's slots must be
    /// shaped like the acquisition buffers `config` describes.
    pub fn with_processor(
        source: impl DataSource + 'static,
        config: PipelineConfig,
        processor: FrameProcessor,
    ) -> Result<Self> {
        config.validate()?;
        if processor.payload_type() != config.payload_type
            || processor.elements_per_frame() != config.elements_per_frame
        {
            return Err(ConfigError::Invalid(format!(
                "processor slots hold {} {:?} elements, acquisition reads {} {:?} elements",
                processor.elements_per_frame(),
                processor.payload_type(),
                config.elements_per_frame,
                config.payload_type
            ))
            .into());
        }
        Ok(Self {
            config,
            processor: Arc::new(processor),
            source: Some(Box::new(source)),
            telemetry: Arc::new(Telemetry::default()),
            state: ControllerState::Idle,
            stop_tx: None,
            thread: None,
        })
    }

    /// Spawn the acquisition thread. Only valid once, from `Idle`.
    pub fn start(&mut self) -> Result<()> {
        let source = match (self.state, self.source.take()) {
            (ControllerState::Idle, Some(source)) => source,
            (state, _) => {
                return Err(PipelineError::InvalidState {
                    operation: "start",
                    state: state.as_str(),
                })
            }
        };

        let (stop_tx, stop_rx) = bounded(1);
        let acquisition = Acquisition {
            source,
            processor: self.processor.clone(),
            telemetry: self.telemetry.clone(),
            ring: (0..self.config.acquisition_buffers)
                .map(|_| FrameBuffer::with_type(self.config.payload_type, self.config.elements_per_frame))
                .collect(),
            pacer: Pacer::new(self.config.frame_period(), self.config.spin_threshold()),
            stop_rx,
        };

        let thread = std::thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || acquisition.run())
            .map_err(|e| {
                self.state = ControllerState::Stopped;
                PipelineError::spawn("acquisition", e)
            })?;

        tracing::info!(
            rate_hz = self.config.rate_hz,
            payload_type = ?self.config.payload_type,
            elements = self.config.elements_per_frame,
            "acquisition started"
        );
        self.stop_tx = Some(stop_tx);
        self.thread = Some(thread);
        self.state = ControllerState::Running;
        Ok(())
    }

    /// Stop acquisition, then validation and recording.
    ///
    /// Returns the source error if acquisition ended because of one. Calling
    /// again after that is a no-op returning `Ok`.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == ControllerState::Stopped {
            return Ok(());
        }
        self.state = ControllerState::Stopped;

        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let joined = match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| PipelineError::Panicked { stage: "acquisition" }),
            None => Ok(()),
        };
        self.processor.stop()?;
        joined?;

        tracing::info!(frames = self.frames_total(), "acquisition stopped");
        match self.telemetry.error.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Whether acquisition ended on a source error.
    pub fn is_failed(&self) -> bool {
        self.telemetry.failed.load(Ordering::Acquire)
    }

    /// Frames handed to the processor.
    pub fn frames_total(&self) -> u64 {
        self.telemetry.frames_total.load(Ordering::Relaxed)
    }

    pub fn last_frame_counter(&self) -> u16 {
        self.telemetry.last_counter.load(Ordering::Relaxed)
    }

    /// Magic word of the last frame read.
    pub fn header(&self) -> u32 {
        self.telemetry.last_magic.load(Ordering::Relaxed)
    }

    /// Duration of the last source read.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.telemetry.read_ns.load(Ordering::Relaxed))
    }

    /// Duration of the last handoff to the processor.
    pub fn write_elapsed(&self) -> Duration {
        Duration::from_nanos(self.telemetry.handoff_ns.load(Ordering::Relaxed))
    }

    /// Duration of the last full acquisition cycle.
    pub fn cycle_elapsed(&self) -> Duration {
        Duration::from_nanos(self.telemetry.cycle_ns.load(Ordering::Relaxed))
    }

    pub fn processor(&self) -> &FrameProcessor {
        &self.processor
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stats(&self) -> PipelineStats {
        self.processor.stats()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "pipeline stopped with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameHeader, PayloadType, HEADER_SIZE, MAGIC_WORD};
    use crate::processor::test_support::CaptureLog;
    use crate::source::StreamSource;
    use std::io::Cursor;

    /// Emits I16 frames with consecutive counters.
    struct Generator {
        counter: u16,
        payload: Vec<u8>,
        deliver: usize,
    }

    impl Generator {
        fn new(values: [i16; 4]) -> Self {
            let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            let deliver = payload.len();
            Self {
                counter: 0,
                payload,
                deliver,
            }
        }
    }

    impl DataSource for Generator {
        fn read(&mut self, dst: &mut [u8]) -> std::result::Result<usize, SourceError> {
            let header = FrameHeader::new(self.counter, 1, PayloadType::I16, self.payload.len() as u32);
            dst[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
            let n = self.deliver.min(dst.len() - HEADER_SIZE);
            dst[HEADER_SIZE..HEADER_SIZE + n].copy_from_slice(&self.payload[..n]);
            self.counter = self.counter.wrapping_add(1);
            Ok(HEADER_SIZE + n)
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            payload_type: PayloadType::I16,
            elements_per_frame: 4,
            slots_per_bank: 4,
            ..PipelineConfig::default()
        }
    }

    fn controller(source: impl DataSource + 'static, log: &CaptureLog) -> Controller {
        let cfg = config();
        let processor = FrameProcessor::new(&cfg, log.factory()).unwrap();
        Controller::with_processor(source, cfg, processor).unwrap()
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn paces_at_configured_rate() {
        let log = CaptureLog::default();
        let mut c = controller(Generator::new([1, 2, 3, 4]), &log);
        c.start().unwrap();
        std::thread::sleep(Duration::from_secs(1));
        c.stop().unwrap();

        let frames = c.frames_total();
        assert!((180..=220).contains(&frames), "frames {frames}");
        assert_eq!(c.processor().frames_validated(), frames);
        assert_eq!(c.processor().packets_loss(), 0);
        assert_eq!(c.header(), MAGIC_WORD);
        assert_eq!(u64::from(c.last_frame_counter()), frames - 1);
        assert!(c.cycle_elapsed() >= Duration::from_millis(4));
        assert_eq!(c.stats().counters.frames_acquired, frames);
        assert_eq!(log.frames().len() as u64, frames);
    }

    #[test]
    fn source_failure_surfaces_from_stop() {
        let mut bytes = Vec::new();
        for counter in 0..3u16 {
            bytes.extend_from_slice(&FrameHeader::new(counter, 2, PayloadType::I16, 8).to_bytes());
            bytes.extend_from_slice(&[0u8; 8]);
        }
        let log = CaptureLog::default();
        let mut c = controller(StreamSource::new(Cursor::new(bytes)), &log);
        c.start().unwrap();
        wait_for(|| c.is_failed());

        let err = c.stop().unwrap_err();
        assert!(err.is_source_failure());
        assert!(matches!(err, PipelineError::Source(SourceError::Exhausted)));
        assert_eq!(c.frames_total(), 3);
        assert_eq!(c.processor().frames_validated(), 3);
        assert!(c.stop().is_ok());
        assert_eq!(c.state(), ControllerState::Stopped);
    }

    #[test]
    fn short_read_leaves_zeroed_tail() {
        let mut source = Generator::new([7, 7, 7, 7]);
        source.deliver = 4;
        let log = CaptureLog::default();
        let mut c = controller(source, &log);
        c.start().unwrap();
        wait_for(|| c.frames_total() >= 10);
        c.stop().unwrap();

        assert!(c.processor().bad_frames() >= 10);
        assert_eq!(c.processor().broken_frames(), 0);
        for (_, _, samples) in log.frames() {
            assert_eq!(samples, vec![7.0, 7.0, 0.0, 0.0]);
        }
    }

    #[test]
    fn start_is_only_valid_from_idle() {
        let log = CaptureLog::default();
        let mut c = controller(Generator::new([0; 4]), &log);
        assert_eq!(c.state(), ControllerState::Idle);
        c.start().unwrap();
        assert_eq!(c.state(), ControllerState::Running);

        let err = c.start().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState { state: "running", .. }));

        c.stop().unwrap();
        let err = c.start().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState { state: "stopped", .. }));
    }

    #[test]
    fn stop_before_start_is_clean() {
        let log = CaptureLog::default();
        let mut c = controller(Generator::new([0; 4]), &log);
        c.stop().unwrap();
        assert_eq!(c.frames_total(), 0);
        assert!(!c.processor().is_running());
    }

    #[test]
    fn rejects_processor_shaped_for_other_frames() {
        let other_sizes = PipelineConfig {
            elements_per_frame: 8,
            ..config()
        };
        let other_type = PipelineConfig {
            payload_type: PayloadType::F32,
            ..config()
        };
        for processor_config in [other_sizes, other_type] {
            let processor = FrameProcessor::new(&processor_config, CaptureLog::default().factory()).unwrap();
            let Err(err) = Controller::with_processor(Generator::new([0; 4]), config(), processor) else {
                panic!("mismatched processor accepted");
            };
            assert!(matches!(err, PipelineError::Config(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn rejects_invalid_config() {
        let cfg = PipelineConfig {
            rate_hz: 0,
            ..config()
        };
        assert!(matches!(
            Controller::new(Generator::new([0; 4]), cfg),
            Err(PipelineError::Config(_))
        ));
    }
}
