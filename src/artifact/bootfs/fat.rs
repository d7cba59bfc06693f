//! FAT boot filesystem writer.
//!
//! Files are staged in memory and encoded into a FAT volume of a fixed size
//! on [`BootFsWriter::flush`]. The boot partition is flat, so only top-level
//! paths are accepted. The FAT variant (12/16/32) is chosen by `fatfs` from
//! the volume size.

use std::io::{Cursor, Write};
use std::time::SystemTime;

use fatfs::{FileSystem, FormatVolumeOptions, FsOptions};
use time::OffsetDateTime;

use super::{BootFsWriter, BootSink};
use crate::error::{PackError, Result};

const SECTOR_SIZE: u64 = 512;

/// Geometry and identity of the FAT volume.
#[derive(Debug, Clone)]
pub struct FatOptions {
    /// Volume size in bytes; must be a multiple of 512.
    pub size_bytes: u64,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
}

impl FatOptions {
    pub fn new(size_bytes: u64, volume_id: u32) -> Self {
        Self {
            size_bytes,
            volume_id,
            volume_label: *b"BOOT       ",
        }
    }
}

#[derive(Debug)]
struct StagedFile {
    name: String,
    modified: SystemTime,
    data: Vec<u8>,
}

/// Stages boot files and writes the encoded volume to a [`BootSink`].
#[derive(Debug)]
pub struct FatWriter<'s> {
    sink: &'s mut BootSink,
    options: FatOptions,
    staged: Vec<StagedFile>,
}

impl<'s> FatWriter<'s> {
    pub fn new(sink: &'s mut BootSink, options: FatOptions) -> Result<Self> {
        if options.size_bytes == 0 || options.size_bytes % SECTOR_SIZE != 0 {
            return Err(PackError::encoding(
                format!(
                    "boot volume size {} is not a positive multiple of {SECTOR_SIZE}",
                    options.size_bytes
                ),
                "invalid FAT geometry",
            ));
        }
        Ok(Self {
            sink,
            options,
            staged: Vec::new(),
        })
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let size = usize::try_from(self.options.size_bytes)
            .map_err(|e| PackError::encoding("boot volume does not fit in memory", e))?;
        let mut image = Cursor::new(vec![0u8; size]);

        let format = FormatVolumeOptions::new()
            .volume_id(self.options.volume_id)
            .volume_label(self.options.volume_label);
        fatfs::format_volume(&mut image, format)
            .map_err(|e| PackError::encoding("formatting boot volume", e))?;

        let fs = FileSystem::new(&mut image, FsOptions::new())
            .map_err(|e| PackError::encoding("opening formatted boot volume", e))?;
        {
            let root = fs.root_dir();
            for staged in &self.staged {
                let what = || format!("writing '/{}' to boot volume", staged.name);
                let mut file = root
                    .create_file(&staged.name)
                    .map_err(|e| PackError::encoding(what(), e))?;
                file.write_all(&staged.data)
                    .map_err(|e| PackError::encoding(what(), e))?;
                // Per-file times are only settable through this setter in fatfs 0.3.
                #[allow(deprecated)]
                file.set_modified(fat_datetime(staged.modified));
                file.flush().map_err(|e| PackError::encoding(what(), e))?;
            }
        }
        fs.unmount()
            .map_err(|e| PackError::encoding("unmounting boot volume", e))?;

        Ok(image.into_inner())
    }
}

impl BootFsWriter for FatWriter<'_> {
    fn create_file(&mut self, path: &str, modified: SystemTime) -> Result<&mut dyn Write> {
        let name = path.trim_start_matches('/');
        if name.is_empty() || name.contains('/') {
            return Err(PackError::InvalidPath {
                path: path.to_string(),
                reason: "boot partition only holds top-level files",
            });
        }
        if self
            .staged
            .iter()
            .any(|f| f.name.eq_ignore_ascii_case(name))
        {
            return Err(PackError::DuplicateEntry {
                path: path.to_string(),
            });
        }

        let idx = self.staged.len();
        self.staged.push(StagedFile {
            name: name.to_string(),
            modified,
            data: Vec::new(),
        });
        Ok(&mut self.staged[idx].data)
    }

    fn flush(&mut self) -> Result<()> {
        let image = self.encode()?;
        self.sink
            .rewind()
            .map_err(|e| PackError::encoding("rewinding boot image sink", e))?;
        self.sink
            .write_all(&image)
            .map_err(|e| PackError::encoding("writing boot image", e))?;
        self.sink
            .flush()
            .map_err(|e| PackError::encoding("flushing boot image", e))?;
        tracing::debug!(
            files = self.staged.len(),
            bytes = image.len(),
            "boot volume flushed"
        );
        Ok(())
    }
}

/// FAT timestamps cover 1980..=2107 with two-second resolution.
fn fat_datetime(t: SystemTime) -> fatfs::DateTime {
    let dt = OffsetDateTime::from(t);
    fatfs::DateTime {
        date: fatfs::Date {
            year: dt.year().clamp(1980, 2107) as u16,
            month: u16::from(u8::from(dt.month())),
            day: u16::from(dt.day()),
        },
        time: fatfs::Time {
            hour: u16::from(dt.hour()),
            min: u16::from(dt.minute()),
            sec: u16::from(dt.second()),
            millis: dt.millisecond(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_rejects_nested_paths() {
        let mut sink = BootSink::Stream(Box::new(Vec::new()));
        let mut writer = FatWriter::new(&mut sink, FatOptions::new(4 << 20, 1)).unwrap();
        assert!(matches!(
            writer.create_file("/overlays/foo.dtbo", UNIX_EPOCH),
            Err(PackError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_rejects_duplicate_names_case_insensitively() {
        let mut sink = BootSink::Stream(Box::new(Vec::new()));
        let mut writer = FatWriter::new(&mut sink, FatOptions::new(4 << 20, 1)).unwrap();
        writer.create_file("/config.txt", UNIX_EPOCH).unwrap();
        assert!(matches!(
            writer.create_file("/CONFIG.TXT", UNIX_EPOCH),
            Err(PackError::DuplicateEntry { .. })
        ));
    }

    #[test]
    fn test_rejects_unaligned_size() {
        let mut sink = BootSink::Stream(Box::new(Vec::new()));
        assert!(FatWriter::new(&mut sink, FatOptions::new(1000, 1)).is_err());
    }

    #[test]
    fn test_streams_full_volume() {
        let size = 4u64 << 20;
        let buf = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        struct Shared(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, b: &[u8]) -> std::io::Result<usize> {
                self.0.borrow_mut().extend_from_slice(b);
                Ok(b.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut sink = BootSink::Stream(Box::new(Shared(buf.clone())));
        let mut writer = FatWriter::new(&mut sink, FatOptions::new(size, 7)).unwrap();
        writer
            .create_file("/cmdline.txt", UNIX_EPOCH + Duration::from_secs(1_600_000_000))
            .unwrap()
            .write_all(b"console=tty1")
            .unwrap();
        writer.flush().unwrap();

        let image = buf.borrow();
        assert_eq!(image.len() as u64, size);
        assert_eq!(&image[510..512], &[0x55, 0xAA]);
    }

    #[test]
    fn test_fat_datetime_clamps_to_dos_epoch() {
        let dt = fat_datetime(UNIX_EPOCH);
        assert_eq!(dt.date.year, 1980);
        let dt = fat_datetime(UNIX_EPOCH + Duration::from_secs(1_600_000_000));
        assert_eq!((dt.date.year, dt.date.month, dt.date.day), (2020, 9, 13));
        assert_eq!((dt.time.hour, dt.time.min, dt.time.sec), (12, 26, 40));
    }
}
