//! In-memory layout of the root partition.
//!
//! The tree is built once, before any image I/O, and only read afterwards.
//! Children are kept in a `BTreeMap`, so iteration is byte-lexicographic by
//! name no matter in which order entries were inserted. That ordering is
//! what makes two builds from identical inputs produce identical images.
//!
//! # Example
//!
//! ```rust
//! use appliance_builder::tree::Directory;
//!
//! let mut root = Directory::new();
//! root.add_host_file("user/webserver", "/tmp/build/webserver")?;
//! root.add_symlink("etc/resolv.conf", "/tmp/resolv.conf")?;
//! assert!(root.must_child("user").as_directory().is_some());
//! # Ok::<(), appliance_builder::PackError>(())
//! ```

use std::collections::btree_map::{self, BTreeMap};
use std::path::{Path, PathBuf};

use crate::error::{PackError, Result};

/// One entry of the root partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileNode {
    /// Copied verbatim from the build host; mtime and mode come from the source.
    HostFile { source: PathBuf },
    /// Inline content, written read-only with the build timestamp.
    Literal { content: Vec<u8> },
    Symlink { target: String },
    Directory(Directory),
}

impl FileNode {
    pub fn as_directory(&self) -> Option<&Directory> {
        match self {
            FileNode::Directory(dir) => Some(dir),
            _ => None,
        }
    }

    pub fn as_directory_mut(&mut self) -> Option<&mut Directory> {
        match self {
            FileNode::Directory(dir) => Some(dir),
            _ => None,
        }
    }
}

/// A directory node. The tree root is a `Directory` with no name of its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    children: BTreeMap<String, FileNode>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Children in output order (sorted by name).
    pub fn entries(&self) -> btree_map::Iter<'_, String, FileNode> {
        self.children.iter()
    }

    pub fn child(&self, name: &str) -> Option<&FileNode> {
        self.children.get(name)
    }

    /// Look up an entry the caller created itself.
    ///
    /// # Panics
    ///
    /// Panics if `name` is absent. That means the assembler's own
    /// construction logic is broken, not that the input was bad.
    pub fn must_child(&self, name: &str) -> &FileNode {
        match self.children.get(name) {
            Some(node) => node,
            None => panic!("must_child({name:?}) did not find directory entry"),
        }
    }

    /// Mutable variant of [`Directory::must_child`], panicking the same way.
    pub fn must_child_mut(&mut self, name: &str) -> &mut FileNode {
        match self.children.get_mut(name) {
            Some(node) => node,
            None => panic!("must_child_mut({name:?}) did not find directory entry"),
        }
    }

    /// The subdirectory `name`, which the caller created itself.
    ///
    /// # Panics
    ///
    /// Panics if `name` is absent or is not a directory.
    pub fn must_dir_mut(&mut self, name: &str) -> &mut Directory {
        match self.must_child_mut(name) {
            FileNode::Directory(dir) => dir,
            _ => panic!("must_dir_mut({name:?}) found a non-directory entry"),
        }
    }

    pub fn add_host_file(&mut self, path: &str, source: impl AsRef<Path>) -> Result<()> {
        self.insert(
            path,
            FileNode::HostFile {
                source: source.as_ref().to_path_buf(),
            },
        )
    }

    pub fn add_literal(&mut self, path: &str, content: impl Into<Vec<u8>>) -> Result<()> {
        self.insert(
            path,
            FileNode::Literal {
                content: content.into(),
            },
        )
    }

    pub fn add_symlink(&mut self, path: &str, target: impl Into<String>) -> Result<()> {
        self.insert(
            path,
            FileNode::Symlink {
                target: target.into(),
            },
        )
    }

    /// Create an empty directory at `path`.
    pub fn add_dir(&mut self, path: &str) -> Result<()> {
        self.insert(path, FileNode::Directory(Directory::new()))
    }

    /// Insert `node` at the slash-separated `path`, creating missing parents.
    pub fn insert(&mut self, path: &str, node: FileNode) -> Result<()> {
        let segments = split_path(path)?;
        let (name, parents) = segments
            .split_last()
            .ok_or_else(|| invalid(path, "path is empty"))?;

        let mut dir = self;
        for segment in parents {
            let next = dir
                .children
                .entry((*segment).to_string())
                .or_insert_with(|| FileNode::Directory(Directory::new()));
            dir = match next {
                FileNode::Directory(child) => child,
                _ => return Err(invalid(path, "intermediate segment is not a directory")),
            };
        }

        match dir.children.entry((*name).to_string()) {
            btree_map::Entry::Occupied(_) => Err(PackError::DuplicateEntry {
                path: path.to_string(),
            }),
            btree_map::Entry::Vacant(slot) => {
                slot.insert(node);
                Ok(())
            }
        }
    }
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(invalid(path, "path is empty"));
    }
    let segments: Vec<&str> = trimmed.split('/').collect();
    for segment in &segments {
        match *segment {
            "" => return Err(invalid(path, "empty path segment")),
            "." | ".." => return Err(invalid(path, "relative path segment")),
            _ => {}
        }
    }
    Ok(segments)
}

fn invalid(path: &str, reason: &'static str) -> PackError {
    PackError::InvalidPath {
        path: path.to_string(),
        reason,
    }
}
