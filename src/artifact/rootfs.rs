//! Root partition assembler.
//!
//! Walks a [`Directory`] tree depth-first and replays it into a
//! [`RootFsWriter`]. Each directory's children are visited in name order and
//! the directory is finalized only after all of them were written, which is
//! what formats with bottom-up directory accounting (SquashFS) need.
//!
//! The pass fails fast: the first I/O or encoder error aborts it and leaves a
//! partially written sink that the caller must discard.

use std::fs::File;
use std::io::{Read, Seek, Write};
use std::os::unix::fs::PermissionsExt;
use std::time::SystemTime;

use crate::error::{PackError, Result};
use crate::tree::{Directory, FileNode};

/// Mode for literal files and symlinks.
pub const READ_ONLY_MODE: u32 = 0o444;

/// Permission bits kept from host files; file-type bits are dropped.
pub const PERMISSION_MASK: u32 = 0o777;

/// Encoder for the compressed root filesystem format.
///
/// Directories are addressed through opaque handles returned by
/// [`RootFsWriter::root`] and [`RootFsWriter::create_dir`].
pub trait RootFsWriter {
    type Dir;

    fn root(&mut self) -> Self::Dir;

    fn create_dir(&mut self, parent: &Self::Dir, name: &str, modified: SystemTime)
        -> Result<Self::Dir>;

    fn create_file(
        &mut self,
        parent: &Self::Dir,
        name: &str,
        modified: SystemTime,
        mode: u32,
        content: &mut dyn Read,
    ) -> Result<()>;

    fn create_symlink(
        &mut self,
        parent: &Self::Dir,
        target: &str,
        name: &str,
        modified: SystemTime,
        mode: u32,
    ) -> Result<()>;

    /// Close a directory once every child has been written.
    fn finalize_dir(&mut self, dir: Self::Dir) -> Result<()>;

    /// Serialize the whole image into `sink`.
    fn finish<W: Write + Seek>(self, sink: W) -> Result<()>;
}

/// Write `tree` into `writer` and finish the image into `sink`.
pub fn write_root<F, W>(mut writer: F, tree: &Directory, build_time: SystemTime, sink: W) -> Result<()>
where
    F: RootFsWriter,
    W: Write + Seek,
{
    tracing::info!("writing root file system");
    let root = writer.root();
    write_children(&mut writer, &root, tree, build_time)?;
    writer.finalize_dir(root)?;
    writer.finish(sink)
}

fn write_children<F: RootFsWriter>(
    writer: &mut F,
    parent: &F::Dir,
    dir: &Directory,
    build_time: SystemTime,
) -> Result<()> {
    for (name, node) in dir.entries() {
        write_node(writer, parent, name, node, build_time)?;
    }
    Ok(())
}

fn write_node<F: RootFsWriter>(
    writer: &mut F,
    parent: &F::Dir,
    name: &str,
    node: &FileNode,
    build_time: SystemTime,
) -> Result<()> {
    match node {
        FileNode::HostFile { source } => {
            let mut file =
                File::open(source).map_err(|e| PackError::source_unavailable(source, e))?;
            let meta = file
                .metadata()
                .map_err(|e| PackError::source_unavailable(source, e))?;
            let modified = meta
                .modified()
                .map_err(|e| PackError::source_unavailable(source, e))?;
            let mode = meta.permissions().mode() & PERMISSION_MASK;
            tracing::debug!(name, source = %source.display(), mode = %format!("{mode:o}"), "copying host file");
            writer.create_file(parent, name, modified, mode, &mut file)
        }
        FileNode::Literal { content } => {
            writer.create_file(parent, name, build_time, READ_ONLY_MODE, &mut content.as_slice())
        }
        FileNode::Symlink { target } => {
            writer.create_symlink(parent, target, name, build_time, READ_ONLY_MODE)
        }
        FileNode::Directory(dir) => {
            let handle = writer.create_dir(parent, name, build_time)?;
            write_children(writer, &handle, dir, build_time)?;
            writer.finalize_dir(handle)
        }
    }
}
