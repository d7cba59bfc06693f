//! SquashFS root filesystem writer.
//!
//! Implements [`RootFsWriter`] on top of `backhand`. Entries are staged in
//! the order the assembler emits them (parents before children, children by
//! name) and encoded in one go by [`RootFsWriter::finish`].
//!
//! Every inode is owned by root. Directories get mode `0755`; the superblock
//! timestamp is the build time so that identical inputs give identical bytes.

use std::collections::BTreeSet;
use std::io::{Read, Seek, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use backhand::{FilesystemWriter, NodeHeader};

use crate::artifact::rootfs::RootFsWriter;
use crate::error::{PackError, Result};

/// Mode for every directory in the image.
pub const DIR_MODE: u16 = 0o755;

/// Handle to a directory staged in a [`SquashfsWriter`].
#[derive(Debug, Clone)]
pub struct SquashfsDir {
    path: String,
}

#[derive(Debug)]
enum Staged {
    Dir {
        path: String,
        mtime: u32,
    },
    File {
        path: String,
        mode: u16,
        mtime: u32,
        data: Vec<u8>,
    },
    Symlink {
        path: String,
        target: String,
        mode: u16,
        mtime: u32,
    },
}

#[derive(Debug)]
pub struct SquashfsWriter {
    build_time: u32,
    staged: Vec<Staged>,
    paths: BTreeSet<String>,
    finalized: BTreeSet<String>,
}

impl SquashfsWriter {
    pub fn new(build_time: SystemTime) -> Self {
        Self {
            build_time: unix_seconds(build_time),
            staged: Vec::new(),
            paths: BTreeSet::new(),
            finalized: BTreeSet::new(),
        }
    }

    /// Reserve `parent/name`, rejecting writes into closed directories and duplicates.
    fn claim(&mut self, parent: &SquashfsDir, name: &str) -> Result<String> {
        if self.finalized.contains(&parent.path) {
            return Err(PackError::encoding(
                format!("cannot add '{name}' to finalized directory '/{}'", parent.path),
                "directory already finalized",
            ));
        }
        let path = if parent.path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent.path, name)
        };
        if !self.paths.insert(path.clone()) {
            return Err(PackError::DuplicateEntry { path });
        }
        Ok(path)
    }
}

impl RootFsWriter for SquashfsWriter {
    type Dir = SquashfsDir;

    fn root(&mut self) -> SquashfsDir {
        SquashfsDir {
            path: String::new(),
        }
    }

    fn create_dir(
        &mut self,
        parent: &SquashfsDir,
        name: &str,
        modified: SystemTime,
    ) -> Result<SquashfsDir> {
        let path = self.claim(parent, name)?;
        self.staged.push(Staged::Dir {
            path: path.clone(),
            mtime: unix_seconds(modified),
        });
        Ok(SquashfsDir { path })
    }

    fn create_file(
        &mut self,
        parent: &SquashfsDir,
        name: &str,
        modified: SystemTime,
        mode: u32,
        content: &mut dyn Read,
    ) -> Result<()> {
        let path = self.claim(parent, name)?;
        let mut data = Vec::new();
        content
            .read_to_end(&mut data)
            .map_err(|e| PackError::encoding(format!("reading content for '/{path}'"), e))?;
        self.staged.push(Staged::File {
            path,
            mode: mode as u16,
            mtime: unix_seconds(modified),
            data,
        });
        Ok(())
    }

    fn create_symlink(
        &mut self,
        parent: &SquashfsDir,
        target: &str,
        name: &str,
        modified: SystemTime,
        mode: u32,
    ) -> Result<()> {
        let path = self.claim(parent, name)?;
        self.staged.push(Staged::Symlink {
            path,
            target: target.to_string(),
            mode: mode as u16,
            mtime: unix_seconds(modified),
        });
        Ok(())
    }

    fn finalize_dir(&mut self, dir: SquashfsDir) -> Result<()> {
        tracing::trace!(dir = %format!("/{}", dir.path), "directory finalized");
        self.finalized.insert(dir.path);
        Ok(())
    }

    fn finish<W: Write + Seek>(self, mut sink: W) -> Result<()> {
        let mut fs = FilesystemWriter::default();
        fs.set_time(self.build_time);
        fs.set_root_mode(DIR_MODE);

        for entry in &self.staged {
            let (path, pushed) = match entry {
                Staged::Dir { path, mtime } => {
                    (path, fs.push_dir(path, NodeHeader::new(DIR_MODE, 0, 0, *mtime)))
                }
                Staged::File {
                    path,
                    mode,
                    mtime,
                    data,
                } => (
                    path,
                    fs.push_file(data.as_slice(), path, NodeHeader::new(*mode, 0, 0, *mtime)),
                ),
                Staged::Symlink {
                    path,
                    target,
                    mode,
                    mtime,
                } => (
                    path,
                    fs.push_symlink(target, path, NodeHeader::new(*mode, 0, 0, *mtime)),
                ),
            };
            pushed.map_err(|e| PackError::encoding(format!("adding '/{path}' to squashfs"), e))?;
        }

        fs.write(&mut sink)
            .map_err(|e| PackError::encoding("encoding squashfs image", e))?;
        sink.flush()
            .map_err(|e| PackError::encoding("flushing squashfs image", e))?;
        Ok(())
    }
}

/// Seconds since the epoch as stored in SquashFS inodes (clamped to `u32`).
pub(crate) fn unix_seconds(t: SystemTime) -> u32 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(u64::from(u32::MAX)) as u32)
        .unwrap_or(0)
}
