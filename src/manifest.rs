//! JSON build manifest: identifiers, LBAs and a checksum of every artifact.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::artifact::disk::BootLbas;
use crate::error::{PackError, Result};
use crate::output;
use crate::partuuid::PartUuid;

#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub partuuid: PartUuid,
    /// `YYYY-MM-DDTHH:MM:SSZ`
    pub build_time: String,
    pub build_time_unix: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lbas: Option<BootLbas>,
    pub artifacts: Vec<ArtifactRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactRecord {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

impl Manifest {
    pub fn new(partuuid: PartUuid, build_time: SystemTime, lbas: Option<BootLbas>) -> Self {
        let dt = OffsetDateTime::from(build_time);
        Self {
            partuuid,
            build_time: format!(
                "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
                dt.year(),
                dt.month() as u8,
                dt.day(),
                dt.hour(),
                dt.minute(),
                dt.second()
            ),
            build_time_unix: dt.unix_timestamp(),
            lbas,
            artifacts: Vec::new(),
        }
    }

    /// Hash the file at `path` and add it under `name`.
    pub fn record(&mut self, name: &str, path: &Path) -> Result<()> {
        let (sha256, size_bytes) = sha256_file(path)?;
        self.artifacts.push(ArtifactRecord {
            name: name.to_string(),
            path: path.to_path_buf(),
            size_bytes,
            sha256,
        });
        Ok(())
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| PackError::encoding("serializing build manifest", e))?;
        let mut file = output::create_locked(path)?;
        file.write_all(&json)
            .and_then(|_| file.write_all(b"\n"))
            .map_err(|e| PackError::output(path, e))
    }
}

fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).map_err(|e| PackError::source_unavailable(path, e))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r
            .read(&mut buf)
            .map_err(|e| PackError::source_unavailable(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}
