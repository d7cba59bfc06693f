//! Output artifact files.
//!
//! Outputs are truncated only after an exclusive advisory lock is held, so a
//! second run against the same paths fails instead of interleaving writes.
//! The lock lives as long as the returned [`File`].

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use fs2::FileExt;

use crate::error::{PackError, Result};

/// Create or truncate `path` for reading and writing, holding an exclusive lock.
pub fn create_locked(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| PackError::output(parent, e))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| PackError::output(path, e))?;

    if file.try_lock_exclusive().is_err() {
        return Err(PackError::output(
            path,
            io::Error::new(
                io::ErrorKind::WouldBlock,
                "output is locked by another process",
            ),
        ));
    }

    file.set_len(0).map_err(|e| PackError::output(path, e))?;
    Ok(file)
}
