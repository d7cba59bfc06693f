//! Disk layout, partition table sector and full-disk assembly.
//!
//! The target disk has a fixed shape:
//!
//! ```text
//! sector 0          MBR (boot-code area carries vmlinuz/cmdline.txt LBAs)
//! sector 1..8192    alignment gap (4 MiB)
//! sector 8192       partition 1, FAT boot image
//! 8192 + boot       partition 2, SquashFS root image
//! ```
//!
//! Firmware reads the kernel and command line straight from the LBAs
//! recorded in the MBR, so those must point at where the FAT encoder put
//! the files. [`partition_table`] discovers them by reading the boot image
//! back.

pub mod assembly;
pub mod mbr;
pub mod partition_table;

pub use assembly::assemble_disk;
pub use partition_table::{write_partition_table, BootLbas};

use crate::error::{PackError, Result};

/// Sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// First partition starts here (4 MiB alignment gap).
pub const BOOT_START_LBA: u32 = 8192;

/// Partition sizes in sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskLayout {
    pub boot_sectors: u32,
    pub root_sectors: u32,
}

impl DiskLayout {
    /// Layout for partitions of the given byte sizes, rounded up to whole sectors.
    pub fn from_bytes(boot_bytes: u64, root_bytes: u64) -> Result<Self> {
        let layout = Self {
            boot_sectors: sectors("boot", boot_bytes)?,
            root_sectors: sectors("root", root_bytes)?,
        };
        // The whole disk must stay addressable by 32-bit LBAs.
        layout
            .total_sectors_checked()
            .ok_or_else(|| PackError::encoding("disk layout", "disk exceeds 2^32 sectors"))?;
        Ok(layout)
    }

    pub fn root_start_lba(&self) -> u32 {
        BOOT_START_LBA + self.boot_sectors
    }

    pub fn total_sectors(&self) -> u64 {
        u64::from(BOOT_START_LBA) + u64::from(self.boot_sectors) + u64::from(self.root_sectors)
    }

    fn total_sectors_checked(&self) -> Option<u32> {
        BOOT_START_LBA
            .checked_add(self.boot_sectors)?
            .checked_add(self.root_sectors)
    }
}

fn sectors(partition: &str, bytes: u64) -> Result<u32> {
    let count = bytes.div_ceil(SECTOR_SIZE);
    u32::try_from(count).map_err(|e| {
        PackError::encoding(format!("{partition} partition of {bytes} bytes"), e)
    })
}

/// Absolute LBA of a byte offset inside the boot partition.
///
/// Truncates: an offset inside a sector maps to that sector.
pub fn extent_lba(offset: u64) -> Result<u32> {
    u32::try_from(offset / SECTOR_SIZE)
        .ok()
        .and_then(|sector| sector.checked_add(BOOT_START_LBA))
        .ok_or_else(|| {
            PackError::encoding(
                format!("boot image offset {offset}"),
                "beyond 32-bit LBA range",
            )
        })
}
