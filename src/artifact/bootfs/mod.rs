//! Boot filesystem (FAT) collaborator.
//!
//! - [`fat`] - staging writer that encodes a FAT volume with `fatfs`
//! - [`reader`] - read-back of a written volume to find a file's byte extent
//!
//! The boot image is written to a [`BootSink`]. Only sinks that can be read
//! back (a regular file) support the partition table pass, because the
//! table points at where the FAT encoder actually placed `vmlinuz` and
//! `cmdline.txt`.

pub mod fat;
pub mod reader;

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::time::SystemTime;

use crate::error::Result;

pub use fat::{FatOptions, FatWriter};
pub use reader::{Extent, FatKind, FatReader};

/// Encoder side of the boot filesystem.
pub trait BootFsWriter {
    /// Start a file at `path` (e.g. `/cmdline.txt`) and return its content sink.
    fn create_file(&mut self, path: &str, modified: SystemTime) -> Result<&mut dyn Write>;

    /// Encode everything staged so far and flush it fully to the sink.
    fn flush(&mut self) -> Result<()>;
}

/// Destination of the boot image.
pub enum BootSink {
    /// Seekable and readable: supports the partition table pass.
    File(File),
    /// Write-only stream (pipe, stdout, socket).
    Stream(Box<dyn Write>),
}

impl BootSink {
    /// Access to the written image for the read-back pass, if the sink has one.
    pub fn read_back(&mut self) -> Option<&mut File> {
        match self {
            BootSink::File(file) => Some(file),
            BootSink::Stream(_) => None,
        }
    }

    pub(crate) fn rewind(&mut self) -> io::Result<()> {
        match self {
            BootSink::File(file) => file.seek(SeekFrom::Start(0)).map(|_| ()),
            BootSink::Stream(_) => Ok(()),
        }
    }
}

impl Write for BootSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            BootSink::File(file) => file.write(buf),
            BootSink::Stream(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            BootSink::File(file) => file.flush(),
            BootSink::Stream(stream) => stream.flush(),
        }
    }
}

impl std::fmt::Debug for BootSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootSink::File(file) => f.debug_tuple("File").field(file).finish(),
            BootSink::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}
