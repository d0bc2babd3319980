//! Sinks for inbound response bodies.

use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use bytes::{Bytes, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Which drain a task writes into. A fresh drain is built per attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DrainKind {
    #[default]
    Memory,
    File(PathBuf),
    Ignore,
}

impl DrainKind {
    pub fn create(&self) -> DataDrain {
        match self {
            DrainKind::Memory => DataDrain::Memory(BytesMut::new()),
            DrainKind::File(path) => DataDrain::ToFile {
                path: path.clone(),
                file: None,
                written: 0,
            },
            DrainKind::Ignore => DataDrain::Ignore { bytes: 0 },
        }
    }
}

/// Append-only body sink.
#[derive(Debug)]
pub enum DataDrain {
    /// Grows without bound.
    Memory(BytesMut),
    /// Opened on the first byte, then appended to.
    ToFile {
        path: PathBuf,
        file: Option<File>,
        written: u64,
    },
    /// Counts and drops.
    Ignore { bytes: u64 },
}

/// What a drain produced once the attempt is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Memory(Bytes),
    File { path: PathBuf, bytes: u64 },
    Ignored(u64),
}

impl DataDrain {
    pub fn append(&mut self, data: &[u8]) -> Result<(), NetError> {
        match self {
            DataDrain::Memory(buf) => buf.extend_from_slice(data),
            DataDrain::ToFile {
                path,
                file,
                written,
            } => {
                if file.is_none() {
                    *file = Some(open_truncated(path)?);
                }
                if let Some(f) = file.as_mut() {
                    f.write_all(data).file_context(path)?;
                }
                *written += data.len() as u64;
            }
            DataDrain::Ignore { bytes } => *bytes += data.len() as u64,
        }
        Ok(())
    }

    pub fn len(&self) -> u64 {
        match self {
            DataDrain::Memory(buf) => buf.len() as u64,
            DataDrain::ToFile { written, .. } => *written,
            DataDrain::Ignore { bytes } => *bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush and close. A file drain that never saw a byte leaves the
    /// destination untouched.
    pub fn finish(self) -> Result<DrainResult, NetError> {
        match self {
            DataDrain::Memory(buf) => Ok(DrainResult::Memory(buf.freeze())),
            DataDrain::ToFile {
                path,
                file,
                written,
            } => {
                if let Some(mut file) = file {
                    file.flush().file_context(&path)?;
                }
                Ok(DrainResult::File {
                    path,
                    bytes: written,
                })
            }
            DataDrain::Ignore { bytes } => Ok(DrainResult::Ignored(bytes)),
        }
    }
}

impl DrainResult {
    /// Settle a successful exchange. An empty body still produces an empty
    /// destination file.
    pub fn complete(self) -> Result<Self, NetError> {
        if let DrainResult::File { path, bytes: 0 } = &self {
            open_truncated(path)?;
        }
        Ok(self)
    }

    /// Whether anything reached the drain's destination.
    pub fn is_unwritten_file(&self) -> bool {
        matches!(self, DrainResult::File { bytes: 0, .. })
    }
}

fn open_truncated(path: &Path) -> Result<File, NetError> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .file_context(path)
}
