//! Output locations for exported files.
//!
//! The serializer never opens files itself. It asks a [`FileManager`] for a
//! writable handle under a label ("stream_data") and a postfix (the file name),
//! and the manager records every artifact it hands out so the export driver can
//! return a manifest.
//!
//! - [`MultiFileManager`]: files in a directory on disk, never overwriting
//! - [`MemoryBuffersManager`]: in-memory buffers, for tests and previews

pub mod prefix;

use crate::error::{SpecError, SpecResult};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Artifact label for SPEC scan data files.
pub const STREAM_DATA: &str = "stream_data";

/// Produced artifacts, grouped by label.
pub type Manifest = BTreeMap<String, Vec<PathBuf>>;

/// Hands out writable handles and remembers what was produced.
pub trait FileManager {
    /// Open a new artifact `postfix` under `label`.
    fn open(&mut self, label: &str, postfix: &str) -> SpecResult<Box<dyn Write + Send>>;

    /// Artifacts opened so far.
    fn artifacts(&self) -> &Manifest;

    /// Release any resources held by the manager.
    fn close(&mut self) -> SpecResult<()> {
        Ok(())
    }
}

/// Writes artifacts as files under one directory.
///
/// Existing files are never overwritten; opening a postfix that already exists
/// on disk fails with an I/O error.
#[derive(Debug)]
pub struct MultiFileManager {
    directory: PathBuf,
    artifacts: Manifest,
}

impl MultiFileManager {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            artifacts: Manifest::new(),
        }
    }

    /// Directory artifacts are written to.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn reserve(&self, postfix: &str) -> SpecResult<PathBuf> {
        let relative = Path::new(postfix);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(SpecError::Template(format!(
                "artifact name '{postfix}' escapes the output directory"
            )));
        }
        Ok(self.directory.join(relative))
    }
}

impl FileManager for MultiFileManager {
    fn open(&mut self, label: &str, postfix: &str) -> SpecResult<Box<dyn Write + Send>> {
        let path = self.reserve(postfix)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file: File = OpenOptions::new().write(true).create_new(true).open(&path)?;
        tracing::debug!(label, path = %path.display(), "opened artifact");
        self.artifacts
            .entry(label.to_string())
            .or_default()
            .push(path);
        Ok(Box::new(BufWriter::new(file)))
    }

    fn artifacts(&self) -> &Manifest {
        &self.artifacts
    }
}

/// A cloneable in-memory byte sink.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Copy of the bytes written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Keeps artifacts in memory instead of on disk.
#[derive(Debug, Default)]
pub struct MemoryBuffersManager {
    buffers: BTreeMap<PathBuf, SharedBuffer>,
    artifacts: Manifest,
}

impl MemoryBuffersManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text written to artifact `postfix`, if it was opened.
    pub fn contents(&self, postfix: &str) -> Option<String> {
        self.buffers
            .get(Path::new(postfix))
            .map(|buffer| String::from_utf8_lossy(&buffer.contents()).into_owned())
    }
}

impl FileManager for MemoryBuffersManager {
    fn open(&mut self, label: &str, postfix: &str) -> SpecResult<Box<dyn Write + Send>> {
        let path = PathBuf::from(postfix);
        if self.buffers.contains_key(&path) {
            return Err(SpecError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("buffer '{postfix}' already open"),
            )));
        }
        let buffer = SharedBuffer::default();
        self.buffers.insert(path.clone(), buffer.clone());
        self.artifacts
            .entry(label.to_string())
            .or_default()
            .push(path);
        Ok(Box::new(buffer))
    }

    fn artifacts(&self) -> &Manifest {
        &self.artifacts
    }
}
