//! Disk assembly: MBR plus partition splicing into one raw image.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use super::{mbr::MBR_SIZE, DiskLayout, BOOT_START_LBA, SECTOR_SIZE};
use crate::error::{PackError, Result};
use crate::output;

/// Assemble a raw disk image from the MBR sector and both partition images.
///
/// Creates a sparse disk file of `layout.total_sectors()` sectors, then
/// splices the boot image at sector 8192 and the root image directly after.
pub fn assemble_disk(
    disk_path: &Path,
    mbr: &[u8; MBR_SIZE],
    boot_image: &Path,
    root_image: &Path,
    layout: &DiskLayout,
) -> Result<()> {
    let boot_offset = u64::from(BOOT_START_LBA) * SECTOR_SIZE;
    let root_offset = u64::from(layout.root_start_lba()) * SECTOR_SIZE;

    let mut disk = output::create_locked(disk_path)?;
    disk.set_len(layout.total_sectors() * SECTOR_SIZE)
        .map_err(|e| PackError::output(disk_path, e))?;

    disk.write_all(mbr)
        .map_err(|e| PackError::output(disk_path, e))?;

    tracing::info!(offset = boot_offset, "writing boot partition into disk image");
    splice(&mut disk, disk_path, boot_offset, boot_image, layout.boot_sectors, "boot")?;

    tracing::info!(offset = root_offset, "writing root partition into disk image");
    splice(&mut disk, disk_path, root_offset, root_image, layout.root_sectors, "root")?;

    disk.flush().map_err(|e| PackError::output(disk_path, e))?;
    Ok(())
}

fn splice(
    disk: &mut File,
    disk_path: &Path,
    offset: u64,
    image: &Path,
    sectors: u32,
    partition: &str,
) -> Result<()> {
    let mut src = File::open(image).map_err(|e| PackError::source_unavailable(image, e))?;
    let len = src
        .metadata()
        .map_err(|e| PackError::source_unavailable(image, e))?
        .len();
    let capacity = u64::from(sectors) * SECTOR_SIZE;
    if len > capacity {
        return Err(PackError::encoding(
            format!(
                "{partition} image '{}' is {len} bytes, partition holds {capacity}",
                image.display()
            ),
            "image larger than its partition",
        ));
    }

    disk.seek(SeekFrom::Start(offset))
        .and_then(|_| io::copy(&mut src, disk))
        .map_err(|e| PackError::output(disk_path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::disk::mbr;
    use crate::partuuid::PartUuid;
    use std::fs;
    use std::io::Read;
    use tempfile::TempDir;

    fn layout() -> DiskLayout {
        DiskLayout {
            boot_sectors: 8,
            root_sectors: 4,
        }
    }

    #[test]
    fn test_splices_at_partition_offsets() {
        let temp = TempDir::new().unwrap();
        let boot = temp.path().join("boot.img");
        let root = temp.path().join("root.img");
        fs::write(&boot, vec![0xB0; 8 * 512]).unwrap();
        fs::write(&root, vec![0x50; 1000]).unwrap();
        let sector = mbr::encode(&layout(), 8200, 8201, PartUuid(0xCAFE), mbr::TYPE_FAT16_LBA);

        let disk = temp.path().join("disk.img");
        assemble_disk(&disk, &sector, &boot, &root, &layout()).unwrap();

        let mut data = Vec::new();
        File::open(&disk).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data.len() as u64, (8192 + 8 + 4) * 512);
        assert_eq!(&data[..512], &sector[..]);
        assert!(data[512..8192 * 512].iter().all(|&b| b == 0));
        assert!(data[8192 * 512..8200 * 512].iter().all(|&b| b == 0xB0));
        assert!(data[8200 * 512..8200 * 512 + 1000].iter().all(|&b| b == 0x50));
        assert!(data[8200 * 512 + 1000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_oversized_image_rejected() {
        let temp = TempDir::new().unwrap();
        let boot = temp.path().join("boot.img");
        let root = temp.path().join("root.img");
        fs::write(&boot, vec![0; 512]).unwrap();
        fs::write(&root, vec![0; 4 * 512 + 1]).unwrap();
        let sector = mbr::encode(&layout(), 8192, 8192, PartUuid(1), mbr::TYPE_FAT16_LBA);

        let err = assemble_disk(&temp.path().join("disk.img"), &sector, &boot, &root, &layout())
            .unwrap_err();
        assert!(matches!(err, PackError::FormatEncoding { .. }));
    }
}
