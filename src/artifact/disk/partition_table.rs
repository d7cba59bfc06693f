//! Second pass over the boot image: find the kernel and command line, then
//! write the MBR that points at them.

use std::io::Write;
use std::path::Path;

use super::{extent_lba, mbr, DiskLayout};
use crate::artifact::boot::{WrittenBoot, CMDLINE_PATH, KERNEL_PATH};
use crate::artifact::bootfs::FatReader;
use crate::error::{PackError, Result};
use crate::output;

/// Absolute LBAs recorded in the MBR boot-code area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BootLbas {
    pub vmlinuz: u32,
    pub cmdline: u32,
}

/// Locate `/vmlinuz` and `/cmdline.txt` in the written boot image and encode
/// the MBR sector. The disk signature is the PARTUUID the boot image carries,
/// and the boot partition type follows the FAT variant of the image.
pub fn encode_partition_table(
    boot: &mut WrittenBoot,
    layout: &DiskLayout,
) -> Result<(BootLbas, [u8; mbr::MBR_SIZE])> {
    let partuuid = boot.partuuid();
    let image = boot
        .sink_mut()
        .read_back()
        .ok_or(PackError::UnsupportedSink)?;

    let mut reader = FatReader::new(image)?;
    let boot_type = mbr::fat_partition_type(reader.kind());
    let vmlinuz = reader.extent(KERNEL_PATH)?;
    let cmdline = reader.extent(CMDLINE_PATH)?;

    let lbas = BootLbas {
        vmlinuz: extent_lba(vmlinuz.offset)?,
        cmdline: extent_lba(cmdline.offset)?,
    };
    tracing::info!(
        vmlinuz = lbas.vmlinuz,
        cmdline = lbas.cmdline,
        partuuid = %partuuid,
        boot_type,
        "encoding MBR"
    );
    let sector = mbr::encode(layout, lbas.vmlinuz, lbas.cmdline, partuuid, boot_type);
    Ok((lbas, sector))
}

/// Write the MBR sector to a fresh file at `out`.
///
/// Nothing is created unless both extents were found.
pub fn write_partition_table(
    boot: &mut WrittenBoot,
    layout: &DiskLayout,
    out: &Path,
) -> Result<BootLbas> {
    let (lbas, sector) = encode_partition_table(boot, layout)?;

    let mut file = output::create_locked(out)?;
    file.write_all(&sector)
        .and_then(|_| file.flush())
        .map_err(|e| PackError::output(out, e))?;
    Ok(lbas)
}
