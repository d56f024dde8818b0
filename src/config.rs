//! Pipeline configuration.
//!
//! All fields have defaults, so a TOML file only needs to name what differs:
//!
//! ```toml
//! rate_hz = 200
//! payload_type = "i16"
//! elements_per_frame = 2048
//! output_dir = "/var/lib/daq"
//! ```

use crate::error::ConfigError;
use crate::frame::{PayloadType, HEADER_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Acquisition frequency in frames per second.
    pub rate_hz: u32,
    /// Payload encoding produced by the source.
    pub payload_type: PayloadType,
    /// Nominal number of samples per frame.
    pub elements_per_frame: usize,
    /// Buffers in the acquisition ring (at least 2).
    pub acquisition_buffers: usize,
    /// Raw frame slots per processor bank.
    pub slots_per_bank: usize,
    /// Target samples per recorded block; defaults to `elements_per_frame`.
    /// The actual block is rounded up to a power of two.
    pub record_block_elements: Option<usize>,
    /// Accumulation blocks per recorder.
    pub record_blocks: usize,
    /// Directory for recording sinks.
    pub output_dir: PathBuf,
    /// Sink file prefix; the source id is appended.
    pub record_base_name: String,
    /// Poll interval for the validation and writer threads, in milliseconds.
    pub worker_poll_ms: u64,
    /// Final stretch of each acquisition cycle that is spun instead of slept, in microseconds.
    pub spin_threshold_us: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rate_hz: 200,
            payload_type: PayloadType::U8,
            elements_per_frame: 4096,
            acquisition_buffers: 2,
            slots_per_bank: 10,
            record_block_elements: None,
            record_blocks: 2,
            output_dir: PathBuf::from("."),
            record_base_name: "record".to_string(),
            worker_poll_ms: 1,
            spin_threshold_us: 500,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_hz == 0 {
            return Err(ConfigError::Invalid("rate_hz must be positive".into()));
        }
        if self.payload_type.element_width().is_none() {
            return Err(ConfigError::Invalid("payload_type must be u8, i16, i32 or f32".into()));
        }
        if self.elements_per_frame == 0 {
            return Err(ConfigError::Invalid("elements_per_frame must be positive".into()));
        }
        // Canonical frames carry 4-byte floats whatever the wire type.
        let widest = self.element_width().max(4);
        let fits_header = self
            .elements_per_frame
            .checked_mul(widest)
            .is_some_and(|bytes| u32::try_from(bytes).is_ok());
        if !fits_header {
            return Err(ConfigError::Invalid(format!(
                "elements_per_frame {} overflows the 32-bit payload_size field",
                self.elements_per_frame
            )));
        }
        if self.acquisition_buffers < 2 {
            return Err(ConfigError::Invalid("acquisition_buffers must be at least 2".into()));
        }
        if self.slots_per_bank == 0 {
            return Err(ConfigError::Invalid("slots_per_bank must be positive".into()));
        }
        if self.record_blocks == 0 {
            return Err(ConfigError::Invalid("record_blocks must be positive".into()));
        }
        if self.record_block_elements == Some(0) {
            return Err(ConfigError::Invalid("record_block_elements must be positive".into()));
        }
        if self.record_base_name.is_empty() {
            return Err(ConfigError::Invalid("record_base_name must not be empty".into()));
        }
        Ok(())
    }

    /// Target duration of one acquisition cycle.
    pub fn frame_period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.rate_hz.max(1)))
    }

    pub fn element_width(&self) -> usize {
        self.payload_type.element_width().unwrap_or(1)
    }

    /// Payload bytes a well-formed frame carries.
    pub fn nominal_payload_bytes(&self) -> usize {
        self.elements_per_frame * self.element_width()
    }

    /// Header plus payload bytes a complete read delivers.
    pub fn nominal_frame_bytes(&self) -> usize {
        HEADER_SIZE + self.nominal_payload_bytes()
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_ms.max(1))
    }

    pub fn spin_threshold(&self) -> Duration {
        Duration::from_micros(self.spin_threshold_us)
    }

    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            output_dir: self.output_dir.clone(),
            base_name: self.record_base_name.clone(),
            block_elements: self.record_block_elements.unwrap_or(self.elements_per_frame),
            blocks: self.record_blocks,
            poll_interval: self.worker_poll_interval(),
        }
    }
}

/// Settings for one [`FrameRecorder`](crate::recorder::FrameRecorder).
#[derive(Clone, Debug, PartialEq)]
pub struct RecorderConfig {
    pub output_dir: PathBuf,
    pub base_name: String,
    /// Requested samples per block before power-of-two rounding.
    pub block_elements: usize,
    pub blocks: usize,
    pub poll_interval: Duration,
}

impl RecorderConfig {
    pub fn new(output_dir: impl Into<PathBuf>, block_elements: usize) -> Self {
        Self {
            output_dir: output_dir.into(),
            base_name: "record".to_string(),
            block_elements,
            blocks: 2,
            poll_interval: Duration::from_millis(1),
        }
    }

    /// Sink path for `source_id`.
    pub fn sink_path(&self, source_id: u8) -> PathBuf {
        self.output_dir.join(format!("{}_{}.bin", self.base_name, source_id))
    }
}
