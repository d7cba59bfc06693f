//! Error kinds surfaced by image assembly.
//!
//! Every kind propagates straight to the caller. Nothing is retried: the
//! build is deterministic, so a retry with the same inputs fails the same way.
//! Internal defects (an entry the assembler itself created has vanished)
//! panic instead of showing up here.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = PackError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PackError {
    /// A host file, firmware blob, kernel artifact or template is missing or unreadable.
    #[error("source unavailable: '{}'", path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("duplicate entry '{path}'")]
    DuplicateEntry { path: String },

    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// A mandatory file is missing from an image written earlier in the run.
    #[error("asset '{path}' not found in boot image")]
    AssetNotFound { path: String },

    #[error("{what}")]
    FormatEncoding {
        what: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("partition table requested but the boot image sink cannot be read back")]
    UnsupportedSink,

    #[error("writing output '{}'", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PackError {
    pub(crate) fn source_unavailable(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::SourceUnavailable {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn encoding<E>(what: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::FormatEncoding {
            what: what.into(),
            source: source.into(),
        }
    }

    pub(crate) fn output(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Output {
            path: path.into(),
            source,
        }
    }
}
