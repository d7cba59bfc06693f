//! The 32-bit disk identifier shared by the MBR and `cmdline.txt`.
//!
//! The kernel finds its root filesystem through `root=PARTUUID=xxxxxxxx-02`,
//! where `xxxxxxxx` is the MBR disk signature and `02` the partition number.
//! Both places must carry the same value or the image does not boot.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Partition number of the root filesystem (boot is 1, root is 2).
pub const ROOT_PARTITION_SUFFIX: &str = "02";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartUuid(pub u32);

impl PartUuid {
    /// Stable identifier for a hostname: the first four bytes of its SHA-256.
    pub fn from_hostname(hostname: &str) -> Self {
        let digest = Sha256::digest(hostname.as_bytes());
        Self(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
    }

    /// Kernel `root=` argument selecting the root partition of this disk.
    pub fn root_arg(&self) -> String {
        format!("root=PARTUUID={self}-{ROOT_PARTITION_SUFFIX}")
    }

    /// Disk signature bytes as stored in the MBR.
    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for PartUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl FromStr for PartUuid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let hex = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if hex.is_empty() || hex.len() > 8 {
            return Err(format!("PARTUUID '{s}' must be 1 to 8 hex digits"));
        }
        u32::from_str_radix(hex, 16)
            .map(PartUuid)
            .map_err(|e| format!("PARTUUID '{s}' is not hexadecimal: {e}"))
    }
}

impl Serialize for PartUuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PartUuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
