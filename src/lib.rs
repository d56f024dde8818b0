//! Rate-paced acquisition of binary frames with validation, normalization to
//! `f32` and per-source block recording.
//!
//! A [`Controller`] reads frames from a [`DataSource`] at a fixed rate and
//! swaps each buffer into a [`FrameProcessor`]. The processor's thread checks
//! sequence and size, converts the payload to `f32` and forwards it to a
//! [`FrameSink`], by default a [`FrameRecorder`] per source id writing
//! power-of-two blocks on its own thread.
//!
//! ```no_run
//! use framepipe::{Controller, FileSource, PipelineConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = PipelineConfig::load("framepipe.toml")?;
//! let mut pipeline = Controller::new(FileSource::new("/dev/daq0"), config)?;
//! pipeline.start()?;
//! std::thread::sleep(std::time::Duration::from_secs(10));
//! pipeline.stop()?;
//! println!("lost {} frames", pipeline.processor().packets_loss());
//! # Ok(())
//! # }
//! ```

#[cfg(not(target_endian = "little"))]
compile_error!("framepipe maps little-endian wire payloads in place and needs a little-endian target");

pub mod config;
pub mod controller;
pub mod error;
pub mod frame;
pub mod processor;
pub mod recorder;
pub mod source;
pub mod stats;
pub mod timing;

pub use config::{PipelineConfig, RecorderConfig};
pub use controller::{Controller, ControllerState};
pub use error::{ConfigError, FrameError, PipelineError, Result, SourceError};
pub use frame::{FrameBuffer, FrameHeader, PayloadType, HEADER_SIZE, MAGIC_WORD};
pub use processor::{FrameProcessor, FrameSink, SinkFactory};
pub use recorder::{nearest_power_of_two, FrameRecorder};
pub use source::{DataSource, FileSource, StreamSource};
pub use stats::{CounterSnapshot, PipelineStats};
