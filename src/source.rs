//! Acquisition transports.
//!
//! The controller only sees [`DataSource`]. Two reference implementations are
//! provided: [`FileSource`] re-reads a snapshot file that a device driver keeps
//! overwriting, and [`StreamSource`] pulls consecutive frames from any reader.

use crate::error::SourceError;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

/// Supplies raw frame bytes on demand.
///
/// `read` may return fewer bytes than `dst.len()`; a short read is a normal
/// outcome. `Err` means the source can no longer deliver and ends acquisition.
pub trait DataSource: Send {
    fn read(&mut self, dst: &mut [u8]) -> Result<usize, SourceError>;
}

impl<S: DataSource + ?Sized> DataSource for Box<S> {
    fn read(&mut self, dst: &mut [u8]) -> Result<usize, SourceError> {
        (**self).read(dst)
    }
}

/// Reads the start of a file on every call.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DataSource for FileSource {
    fn read(&mut self, dst: &mut [u8]) -> Result<usize, SourceError> {
        let file = File::open(&self.path).map_err(|e| {
            SourceError::unavailable(format!("cannot open {}: {}", self.path.display(), e))
        })?;
        fill_from(file, dst)
    }
}

/// Reads consecutive frames from a byte stream.
#[derive(Debug)]
pub struct StreamSource<R> {
    reader: R,
}

impl<R: Read + Send> StreamSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read + Send> DataSource for StreamSource<R> {
    fn read(&mut self, dst: &mut [u8]) -> Result<usize, SourceError> {
        let filled = fill_from(&mut self.reader, dst)?;
        if filled == 0 && !dst.is_empty() {
            return Err(SourceError::Exhausted);
        }
        Ok(filled)
    }
}

/// Read until `dst` is full or the reader hits end of input.
fn fill_from(mut reader: impl Read, dst: &mut [u8]) -> Result<usize, SourceError> {
    let mut filled = 0;
    while filled < dst.len() {
        match reader.read(&mut dst[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(SourceError::Io(e)),
        }
    }
    Ok(filled)
}
