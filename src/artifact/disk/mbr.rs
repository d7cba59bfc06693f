//! Master boot record encoder.
//!
//! Byte layout of the sector:
//!
//! | offset  | size | field                              |
//! |---------|------|------------------------------------|
//! | 0x000   | 432  | boot code (zero)                   |
//! | 0x1B0   | 4    | LBA of `/vmlinuz` (LE)             |
//! | 0x1B4   | 4    | LBA of `/cmdline.txt` (LE)         |
//! | 0x1B8   | 4    | disk signature (LE)                |
//! | 0x1BC   | 2    | reserved (zero)                    |
//! | 0x1BE   | 64   | four partition entries             |
//! | 0x1FE   | 2    | `0x55 0xAA`                        |

use super::{DiskLayout, BOOT_START_LBA};
use crate::artifact::bootfs::FatKind;
use crate::partuuid::PartUuid;

pub const MBR_SIZE: usize = 512;

const VMLINUZ_LBA_OFFSET: usize = 0x1B0;
const CMDLINE_LBA_OFFSET: usize = 0x1B4;
const DISK_SIGNATURE_OFFSET: usize = 0x1B8;
const PARTITION_TABLE_OFFSET: usize = 0x1BE;
const PARTITION_ENTRY_SIZE: usize = 16;
const BOOT_SIGNATURE_OFFSET: usize = 0x1FE;

const STATUS_ACTIVE: u8 = 0x80;
const STATUS_INACTIVE: u8 = 0x00;

pub const TYPE_FAT12: u8 = 0x01;
/// FAT16 with LBA addressing.
pub const TYPE_FAT16_LBA: u8 = 0x0e;
/// FAT32 with LBA addressing.
pub const TYPE_FAT32_LBA: u8 = 0x0c;
pub const TYPE_LINUX: u8 = 0x83;

/// Partition type byte announcing a FAT volume of the given variant.
pub fn fat_partition_type(kind: FatKind) -> u8 {
    match kind {
        FatKind::Fat12 => TYPE_FAT12,
        FatKind::Fat16 => TYPE_FAT16_LBA,
        FatKind::Fat32 => TYPE_FAT32_LBA,
    }
}

/// CHS tuple meaning "use the LBA fields".
const CHS_LBA_ONLY: [u8; 3] = [0xFE, 0xFF, 0xFF];

/// One primary partition entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionEntry {
    pub active: bool,
    pub kind: u8,
    pub start_lba: u32,
    pub sectors: u32,
}

impl PartitionEntry {
    fn encode(&self) -> [u8; PARTITION_ENTRY_SIZE] {
        let mut entry = [0u8; PARTITION_ENTRY_SIZE];
        entry[0] = if self.active { STATUS_ACTIVE } else { STATUS_INACTIVE };
        entry[1..4].copy_from_slice(&CHS_LBA_ONLY);
        entry[4] = self.kind;
        entry[5..8].copy_from_slice(&CHS_LBA_ONLY);
        entry[8..12].copy_from_slice(&self.start_lba.to_le_bytes());
        entry[12..16].copy_from_slice(&self.sectors.to_le_bytes());
        entry
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != PARTITION_ENTRY_SIZE || raw[4] == 0 {
            return None;
        }
        Some(Self {
            active: raw[0] == STATUS_ACTIVE,
            kind: raw[4],
            start_lba: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            sectors: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        })
    }
}

/// The two partitions of the target layout. `boot_type` is the type byte of
/// the boot partition and must match the FAT variant actually written.
pub fn partitions(layout: &DiskLayout, boot_type: u8) -> [PartitionEntry; 2] {
    [
        PartitionEntry {
            active: true,
            kind: boot_type,
            start_lba: BOOT_START_LBA,
            sectors: layout.boot_sectors,
        },
        PartitionEntry {
            active: false,
            kind: TYPE_LINUX,
            start_lba: layout.root_start_lba(),
            sectors: layout.root_sectors,
        },
    ]
}

/// Encode the MBR sector.
pub fn encode(
    layout: &DiskLayout,
    vmlinuz_lba: u32,
    cmdline_lba: u32,
    disk_signature: PartUuid,
    boot_type: u8,
) -> [u8; MBR_SIZE] {
    let mut sector = [0u8; MBR_SIZE];
    sector[VMLINUZ_LBA_OFFSET..VMLINUZ_LBA_OFFSET + 4].copy_from_slice(&vmlinuz_lba.to_le_bytes());
    sector[CMDLINE_LBA_OFFSET..CMDLINE_LBA_OFFSET + 4].copy_from_slice(&cmdline_lba.to_le_bytes());
    sector[DISK_SIGNATURE_OFFSET..DISK_SIGNATURE_OFFSET + 4]
        .copy_from_slice(&disk_signature.to_le_bytes());

    for (i, entry) in partitions(layout, boot_type).iter().enumerate() {
        let start = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
        sector[start..start + PARTITION_ENTRY_SIZE].copy_from_slice(&entry.encode());
    }

    sector[BOOT_SIGNATURE_OFFSET] = 0x55;
    sector[BOOT_SIGNATURE_OFFSET + 1] = 0xAA;
    sector
}

/// Fields read back from an encoded sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMbr {
    pub vmlinuz_lba: u32,
    pub cmdline_lba: u32,
    pub disk_signature: PartUuid,
    pub partitions: Vec<PartitionEntry>,
}

/// Inverse of [`encode`]; `None` without the `0x55AA` signature.
pub fn decode(sector: &[u8; MBR_SIZE]) -> Option<DecodedMbr> {
    if sector[BOOT_SIGNATURE_OFFSET..] != [0x55, 0xAA] {
        return None;
    }
    let le = |at: usize| u32::from_le_bytes([sector[at], sector[at + 1], sector[at + 2], sector[at + 3]]);
    let partitions = (0..4)
        .filter_map(|i| {
            let start = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
            PartitionEntry::decode(&sector[start..start + PARTITION_ENTRY_SIZE])
        })
        .collect();
    Some(DecodedMbr {
        vmlinuz_lba: le(VMLINUZ_LBA_OFFSET),
        cmdline_lba: le(CMDLINE_LBA_OFFSET),
        disk_signature: PartUuid(le(DISK_SIGNATURE_OFFSET)),
        partitions,
    })
}
