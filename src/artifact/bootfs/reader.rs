//! FAT read-back: locate a file's byte extent inside a written volume.
//!
//! Only the root directory is searched; the boot partition is flat. Names
//! are matched case-insensitively against both the long (VFAT) name and the
//! 8.3 short name.

use std::io::{Read, Seek, SeekFrom};

use crate::error::{PackError, Result};

const DIR_ENTRY_SIZE: usize = 32;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LONG_NAME: u8 = 0x0F;
const LFN_LAST_ENTRY: u8 = 0x40;
const ENTRY_FREE: u8 = 0xE5;
const ENTRY_END: u8 = 0x00;
const FAT32_EOC: u32 = 0x0FFF_FFF8;
/// Guards against cyclic cluster chains in a corrupt FAT.
const MAX_ROOT_CLUSTERS: usize = 65_536;

/// Where a file's data begins inside the boot image, and how long it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RootDir {
    /// FAT12/16: fixed region after the FATs.
    Fixed { entries: u64 },
    /// FAT32: cluster chain starting at the given cluster.
    Chain { first_cluster: u32 },
}

/// FAT variant, decided by the cluster count as the FAT specification does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatKind {
    Fat12,
    Fat16,
    Fat32,
}

/// Largest cluster counts of FAT12 and FAT16 volumes.
const FAT12_MAX_CLUSTERS: u64 = 4084;
const FAT16_MAX_CLUSTERS: u64 = 65_524;

#[derive(Debug, Clone, Copy)]
struct Geometry {
    total_sectors: u64,
    bytes_per_sector: u64,
    sectors_per_cluster: u64,
    reserved_sectors: u64,
    fat_count: u64,
    sectors_per_fat: u64,
    root: RootDir,
}

impl Geometry {
    fn parse(bpb: &[u8; 512]) -> Result<Self> {
        if bpb[510..512] != [0x55, 0xAA] {
            return Err(bad_volume("missing boot sector signature"));
        }
        let bytes_per_sector = u64::from(le16(bpb, 0x0B));
        let sectors_per_cluster = u64::from(bpb[0x0D]);
        let reserved_sectors = u64::from(le16(bpb, 0x0E));
        let fat_count = u64::from(bpb[0x10]);
        let root_entries = u64::from(le16(bpb, 0x11));
        let fat_size_16 = u64::from(le16(bpb, 0x16));
        let total_sectors = match le16(bpb, 0x13) {
            0 => u64::from(le32(bpb, 0x20)),
            n => u64::from(n),
        };

        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(bad_volume("unsupported sector size"));
        }
        if sectors_per_cluster == 0 || fat_count == 0 {
            return Err(bad_volume("zero cluster size or FAT count"));
        }

        let (sectors_per_fat, root) = if fat_size_16 != 0 {
            (fat_size_16, RootDir::Fixed { entries: root_entries })
        } else {
            (
                u64::from(le32(bpb, 0x24)),
                RootDir::Chain {
                    first_cluster: le32(bpb, 0x2C),
                },
            )
        };

        Ok(Self {
            total_sectors,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            fat_count,
            sectors_per_fat,
            root,
        })
    }

    fn root_dir_sectors(&self) -> u64 {
        match self.root {
            RootDir::Fixed { entries } => {
                (entries * DIR_ENTRY_SIZE as u64).div_ceil(self.bytes_per_sector)
            }
            RootDir::Chain { .. } => 0,
        }
    }

    fn root_dir_offset(&self) -> u64 {
        (self.reserved_sectors + self.fat_count * self.sectors_per_fat) * self.bytes_per_sector
    }

    fn data_offset(&self) -> u64 {
        self.root_dir_offset() + self.root_dir_sectors() * self.bytes_per_sector
    }

    fn cluster_bytes(&self) -> u64 {
        self.sectors_per_cluster * self.bytes_per_sector
    }

    fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_offset() + u64::from(cluster - 2) * self.cluster_bytes()
    }

    fn kind(&self) -> FatKind {
        let data_sectors = self
            .total_sectors
            .saturating_sub(self.data_offset() / self.bytes_per_sector);
        let clusters = data_sectors / self.sectors_per_cluster;
        if clusters <= FAT12_MAX_CLUSTERS {
            FatKind::Fat12
        } else if clusters <= FAT16_MAX_CLUSTERS {
            FatKind::Fat16
        } else {
            FatKind::Fat32
        }
    }
}

/// Structured reader over a written FAT volume.
pub struct FatReader<R> {
    inner: R,
    geometry: Geometry,
}

impl<R: Read + Seek> FatReader<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let mut bpb = [0u8; 512];
        inner
            .seek(SeekFrom::Start(0))
            .and_then(|_| inner.read_exact(&mut bpb))
            .map_err(|e| PackError::encoding("reading boot sector", e))?;
        let geometry = Geometry::parse(&bpb)?;
        Ok(Self { inner, geometry })
    }

    pub fn kind(&self) -> FatKind {
        self.geometry.kind()
    }

    /// Byte extent of the top-level file at `path` (e.g. `/vmlinuz`).
    pub fn extent(&mut self, path: &str) -> Result<Extent> {
        let not_found = || PackError::AssetNotFound {
            path: path.to_string(),
        };
        let wanted = path.trim_start_matches('/');
        if wanted.is_empty() || wanted.contains('/') {
            return Err(not_found());
        }

        let root = self.read_root_dir()?;
        let entry = find_entry(&root, wanted).ok_or_else(not_found)?;

        let cluster = (u32::from(le16(entry, 20)) << 16) | u32::from(le16(entry, 26));
        let length = u64::from(le32(entry, 28));
        if cluster < 2 {
            return Err(PackError::encoding(
                format!("'{path}' has no data clusters"),
                "empty file has no extent",
            ));
        }
        Ok(Extent {
            offset: self.geometry.cluster_offset(cluster),
            length,
        })
    }

    fn read_root_dir(&mut self) -> Result<Vec<u8>> {
        match self.geometry.root {
            RootDir::Fixed { entries } => {
                let offset = self.geometry.root_dir_offset();
                self.read_at(offset, entries as usize * DIR_ENTRY_SIZE)
            }
            RootDir::Chain { first_cluster } => {
                let cluster_bytes = self.geometry.cluster_bytes() as usize;
                let mut data = Vec::new();
                let mut cluster = first_cluster;
                for _ in 0..MAX_ROOT_CLUSTERS {
                    if !(2..FAT32_EOC).contains(&cluster) {
                        return Ok(data);
                    }
                    let offset = self.geometry.cluster_offset(cluster);
                    data.extend(self.read_at(offset, cluster_bytes)?);
                    cluster = self.next_cluster(cluster)?;
                }
                Err(bad_volume("root directory cluster chain does not terminate"))
            }
        }
    }

    fn next_cluster(&mut self, cluster: u32) -> Result<u32> {
        let offset = self.geometry.reserved_sectors * self.geometry.bytes_per_sector
            + u64::from(cluster) * 4;
        let raw = self.read_at(offset, 4)?;
        Ok(le32(&raw, 0) & 0x0FFF_FFFF)
    }

    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.inner.read_exact(&mut buf))
            .map_err(|e| PackError::encoding(format!("reading boot image at offset {offset}"), e))?;
        Ok(buf)
    }
}

/// Scan raw directory entries for `wanted`, assembling VFAT long names.
fn find_entry<'a>(dir: &'a [u8], wanted: &str) -> Option<&'a [u8]> {
    let mut long_parts: Vec<(u8, [u16; 13])> = Vec::new();

    for entry in dir.chunks_exact(DIR_ENTRY_SIZE) {
        match entry[0] {
            ENTRY_END => return None,
            ENTRY_FREE => {
                long_parts.clear();
                continue;
            }
            _ => {}
        }

        let attr = entry[11];
        if attr & 0x3F == ATTR_LONG_NAME {
            if entry[0] & LFN_LAST_ENTRY != 0 {
                long_parts.clear();
            }
            long_parts.push((entry[0] & 0x1F, lfn_units(entry)));
            continue;
        }
        if attr & ATTR_VOLUME_ID != 0 {
            long_parts.clear();
            continue;
        }

        let long_name = assemble_long_name(&mut long_parts);
        long_parts.clear();
        if attr & ATTR_DIRECTORY != 0 {
            continue;
        }
        let matches = long_name
            .as_deref()
            .is_some_and(|n| n.eq_ignore_ascii_case(wanted))
            || short_name(entry).eq_ignore_ascii_case(wanted);
        if matches {
            return Some(entry);
        }
    }
    None
}

fn lfn_units(entry: &[u8]) -> [u16; 13] {
    let mut units = [0u16; 13];
    let offsets = (1..11).step_by(2).chain((14..26).step_by(2)).chain((28..32).step_by(2));
    for (unit, off) in units.iter_mut().zip(offsets) {
        *unit = le16(entry, off);
    }
    units
}

fn assemble_long_name(parts: &mut [(u8, [u16; 13])]) -> Option<String> {
    if parts.is_empty() {
        return None;
    }
    parts.sort_by_key(|(seq, _)| *seq);
    let units: Vec<u16> = parts
        .iter()
        .flat_map(|(_, chunk)| chunk.iter().copied())
        .take_while(|&u| u != 0x0000)
        .collect();
    Some(String::from_utf16_lossy(&units))
}

fn short_name(entry: &[u8]) -> String {
    let mut raw = [0u8; 11];
    raw.copy_from_slice(&entry[..11]);
    // 0x05 stands in for a leading 0xE5 byte.
    if raw[0] == 0x05 {
        raw[0] = ENTRY_FREE;
    }
    let base = String::from_utf8_lossy(&raw[..8]).trim_end().to_string();
    let ext = String::from_utf8_lossy(&raw[8..]).trim_end().to_string();
    if ext.is_empty() {
        base
    } else {
        format!("{base}.{ext}")
    }
}

fn le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn bad_volume(reason: &'static str) -> PackError {
    PackError::encoding("parsing boot image", reason)
}
