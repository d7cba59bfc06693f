//! Boot partition assembler.
//!
//! Collects firmware and kernel files by name pattern, copies them into the
//! boot filesystem, and writes patched `cmdline.txt` and `config.txt`.
//!
//! ```text
//! firmware dir ── *.bin *.dat *.elf *.upd *.sig ─┐
//!                                                ├─► /<name>      (mtime kept)
//! kernel dir ──── vmlinuz *.dtb ─────────────────┘
//! kernel dir ──── cmdline.txt ─► patch_cmdline ─► /cmdline.txt
//! kernel dir ──── config.txt ──► patch_config ──► /config.txt
//! ```
//!
//! [`write_boot_partition`] returns a [`WrittenBoot`] receipt. It carries
//! the PARTUUID that went into `cmdline.txt`, and the partition table pass
//! takes its disk signature from that receipt only.

pub mod params;

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

use crate::artifact::bootfs::{BootFsWriter, BootSink, FatOptions, FatWriter};
use crate::error::{PackError, Result};
use crate::partuuid::PartUuid;

pub use params::{patch_cmdline, patch_config, SerialConsole};

/// Firmware blobs copied from the firmware directory.
pub const FIRMWARE_PATTERNS: &[&str] = &["*.bin", "*.dat", "*.elf", "*.upd", "*.sig"];

/// Kernel image and device trees copied from the kernel directory.
pub const KERNEL_PATTERNS: &[&str] = &["vmlinuz", "*.dtb"];

pub const CMDLINE_TEMPLATE: &str = "cmdline.txt";
pub const CONFIG_TEMPLATE: &str = "config.txt";

pub const CMDLINE_PATH: &str = "/cmdline.txt";
pub const CONFIG_PATH: &str = "/config.txt";
pub const KERNEL_PATH: &str = "/vmlinuz";

/// A host file destined for the boot partition root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootAsset {
    pub name: String,
    pub source: PathBuf,
}

/// Flat set of boot files plus the two text templates.
#[derive(Debug, Clone)]
pub struct BootAssets {
    pub files: Vec<BootAsset>,
    pub cmdline_template: PathBuf,
    pub config_template: PathBuf,
}

impl BootAssets {
    /// Resolve [`FIRMWARE_PATTERNS`] and [`KERNEL_PATTERNS`].
    ///
    /// Patterns are applied in order; matches of one pattern are sorted by
    /// file name. Templates are not checked here, only when they are read.
    pub fn collect(firmware_dir: &Path, kernel_dir: &Path) -> Result<Self> {
        let mut files = Vec::new();
        files.extend(match_patterns(firmware_dir, FIRMWARE_PATTERNS)?);
        files.extend(match_patterns(kernel_dir, KERNEL_PATTERNS)?);
        Ok(Self {
            files,
            cmdline_template: kernel_dir.join(CMDLINE_TEMPLATE),
            config_template: kernel_dir.join(CONFIG_TEMPLATE),
        })
    }
}

fn match_patterns(dir: &Path, patterns: &[&str]) -> Result<Vec<BootAsset>> {
    let mut listing = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            PackError::source_unavailable(path, io::Error::from(e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.file_name().to_str() {
            Some(name) => listing.push((name.to_string(), entry.into_path())),
            None => tracing::warn!(
                path = %entry.path().display(),
                "skipping boot file with non-UTF-8 name"
            ),
        }
    }

    let mut matched = Vec::new();
    for pattern in patterns {
        for (name, path) in &listing {
            if pattern_matches(pattern, name) {
                matched.push(BootAsset {
                    name: name.clone(),
                    source: path.clone(),
                });
            }
        }
    }
    Ok(matched)
}

/// `*suffix` matches by suffix, anything else must match exactly.
fn pattern_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_prefix('*') {
        Some(suffix) => name.ends_with(suffix),
        None => name == pattern,
    }
}

/// Options for the boot partition contents.
#[derive(Debug, Clone)]
pub struct BootParams {
    pub serial_console: SerialConsole,
    /// Rewrite legacy `root=` spellings to `root=PARTUUID=...`.
    pub use_partuuid: bool,
    pub partuuid: PartUuid,
}

/// A fully flushed boot image together with the identifier embedded in it.
#[derive(Debug)]
pub struct WrittenBoot {
    sink: BootSink,
    partuuid: PartUuid,
}

impl WrittenBoot {
    pub(crate) fn new(sink: BootSink, partuuid: PartUuid) -> Self {
        Self { sink, partuuid }
    }

    pub fn partuuid(&self) -> PartUuid {
        self.partuuid
    }

    pub fn sink_mut(&mut self) -> &mut BootSink {
        &mut self.sink
    }

    pub fn into_sink(self) -> BootSink {
        self.sink
    }
}

/// Encode the boot partition as FAT into `sink`.
pub fn write_boot_partition(
    mut sink: BootSink,
    assets: &BootAssets,
    params: &BootParams,
    fat: FatOptions,
    build_time: SystemTime,
) -> Result<WrittenBoot> {
    {
        let mut writer = FatWriter::new(&mut sink, fat)?;
        write_boot(&mut writer, assets, params, build_time)?;
    }
    Ok(WrittenBoot::new(sink, params.partuuid))
}

/// Copy assets, write the patched templates and flush `writer`.
pub fn write_boot<W: BootFsWriter>(
    writer: &mut W,
    assets: &BootAssets,
    params: &BootParams,
    build_time: SystemTime,
) -> Result<()> {
    tracing::info!(files = assets.files.len(), "writing boot file system");

    for asset in &assets.files {
        copy_file(writer, &format!("/{}", asset.name), &asset.source)?;
    }

    let template = read_template(&assets.cmdline_template)?;
    let partuuid = if params.use_partuuid {
        Some(params.partuuid)
    } else {
        tracing::info!("not using PARTUUID= in cmdline.txt");
        None
    };
    let cmdline = patch_cmdline(&template, &params.serial_console, partuuid);
    write_text(writer, CMDLINE_PATH, &cmdline, build_time)?;

    let template = read_template(&assets.config_template)?;
    let config = patch_config(&template, &params.serial_console);
    write_text(writer, CONFIG_PATH, &config, build_time)?;

    writer.flush()
}

fn copy_file<W: BootFsWriter>(writer: &mut W, dest: &str, src: &Path) -> Result<()> {
    let mut file = File::open(src).map_err(|e| PackError::source_unavailable(src, e))?;
    let modified = file
        .metadata()
        .and_then(|m| m.modified())
        .map_err(|e| PackError::source_unavailable(src, e))?;
    tracing::debug!(dest, src = %src.display(), "copying boot file");
    let sink = writer.create_file(dest, modified)?;
    io::copy(&mut file, sink).map_err(|e| PackError::source_unavailable(src, e))?;
    Ok(())
}

fn read_template(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| PackError::source_unavailable(path, e))
}

fn write_text<W: BootFsWriter>(
    writer: &mut W,
    dest: &str,
    text: &str,
    modified: SystemTime,
) -> Result<()> {
    writer
        .create_file(dest, modified)?
        .write_all(text.as_bytes())
        .map_err(|e| PackError::encoding(format!("writing '{dest}'"), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::time::UNIX_EPOCH;
    use tempfile::TempDir;

    /// In-memory boot filesystem keyed by path.
    #[derive(Default)]
    struct MemoryBootFs {
        files: BTreeMap<String, Vec<u8>>,
        order: Vec<String>,
        flushed: bool,
    }

    impl BootFsWriter for MemoryBootFs {
        fn create_file(&mut self, path: &str, _modified: SystemTime) -> Result<&mut dyn Write> {
            self.order.push(path.to_string());
            Ok(self.files.entry(path.to_string()).or_default())
        }

        fn flush(&mut self) -> Result<()> {
            self.flushed = true;
            Ok(())
        }
    }

    fn kernel_fixture(temp: &TempDir) -> (PathBuf, PathBuf) {
        let firmware = temp.path().join("firmware");
        let kernel = temp.path().join("kernel");
        fs::create_dir_all(&firmware).unwrap();
        fs::create_dir_all(&kernel).unwrap();
        for name in ["start.elf", "bootcode.bin", "fixup.dat", "LICENCE.broadcom"] {
            fs::write(firmware.join(name), name).unwrap();
        }
        for name in ["vmlinuz", "bcm2710-rpi-3-b.dtb", "bcm2711-rpi-4-b.dtb", "README.md"] {
            fs::write(kernel.join(name), name).unwrap();
        }
        fs::write(
            kernel.join(CMDLINE_TEMPLATE),
            "console=tty1 root=/dev/mmcblk0p2 rootwait",
        )
        .unwrap();
        fs::write(kernel.join(CONFIG_TEMPLATE), "enable_uart=0\n").unwrap();
        (firmware, kernel)
    }

    #[test]
    fn test_collect_orders_by_pattern_then_name() {
        let temp = TempDir::new().unwrap();
        let (firmware, kernel) = kernel_fixture(&temp);

        let assets = BootAssets::collect(&firmware, &kernel).unwrap();
        let names: Vec<&str> = assets.files.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "bootcode.bin",
                "fixup.dat",
                "start.elf",
                "vmlinuz",
                "bcm2710-rpi-3-b.dtb",
                "bcm2711-rpi-4-b.dtb",
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_collect_skips_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp = TempDir::new().unwrap();
        let (firmware, kernel) = kernel_fixture(&temp);
        fs::write(firmware.join(OsStr::from_bytes(b"bad\xff.bin")), "x").unwrap();

        let assets = BootAssets::collect(&firmware, &kernel).unwrap();
        assert!(assets.files.iter().all(|a| !a.name.contains("bad")));
        assert_eq!(assets.files.len(), 6);
    }

    #[test]
    fn test_collect_missing_dir_is_source_unavailable() {
        let temp = TempDir::new().unwrap();
        let err = BootAssets::collect(&temp.path().join("nope"), temp.path()).unwrap_err();
        assert!(matches!(err, PackError::SourceUnavailable { .. }));
    }

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("*.dtb", "bcm2711-rpi-4-b.dtb"));
        assert!(!pattern_matches("*.dtb", "bcm2711-rpi-4-b.dtbo"));
        assert!(pattern_matches("vmlinuz", "vmlinuz"));
        assert!(!pattern_matches("vmlinuz", "vmlinuz.old"));
    }

    #[test]
    fn test_write_boot_patches_templates() {
        let temp = TempDir::new().unwrap();
        let (firmware, kernel) = kernel_fixture(&temp);
        let assets = BootAssets::collect(&firmware, &kernel).unwrap();
        let params = BootParams {
            serial_console: "UART0".parse().unwrap(),
            use_partuuid: true,
            partuuid: PartUuid(0xDEADBEEF),
        };

        let mut fs = MemoryBootFs::default();
        write_boot(&mut fs, &assets, &params, UNIX_EPOCH).unwrap();

        assert!(fs.flushed);
        assert_eq!(
            fs.files[CMDLINE_PATH],
            b"console=ttyAMA0,115200 console=tty1 root=PARTUUID=deadbeef-02 rootwait"
        );
        assert_eq!(fs.files[CONFIG_PATH], b"enable_uart=1\n");
        assert_eq!(fs.files["/vmlinuz"], b"vmlinuz");
        assert_eq!(fs.order.last().map(String::as_str), Some(CONFIG_PATH));
    }

    #[test]
    fn test_write_boot_without_partuuid_keeps_cmdline() {
        let temp = TempDir::new().unwrap();
        let (firmware, kernel) = kernel_fixture(&temp);
        let assets = BootAssets::collect(&firmware, &kernel).unwrap();
        let params = BootParams {
            serial_console: SerialConsole::Disabled,
            use_partuuid: false,
            partuuid: PartUuid(0xDEADBEEF),
        };

        let mut fs = MemoryBootFs::default();
        write_boot(&mut fs, &assets, &params, UNIX_EPOCH).unwrap();

        assert_eq!(
            fs.files[CMDLINE_PATH],
            b"console=tty1 root=/dev/mmcblk0p2 rootwait"
        );
        assert_eq!(fs.files[CONFIG_PATH], b"enable_uart=0\n");
    }

    #[test]
    fn test_missing_template_is_source_unavailable() {
        let temp = TempDir::new().unwrap();
        let (firmware, kernel) = kernel_fixture(&temp);
        fs::remove_file(kernel.join(CONFIG_TEMPLATE)).unwrap();
        let assets = BootAssets::collect(&firmware, &kernel).unwrap();
        let params = BootParams {
            serial_console: SerialConsole::default(),
            use_partuuid: true,
            partuuid: PartUuid(1),
        };

        let mut fs = MemoryBootFs::default();
        let err = write_boot(&mut fs, &assets, &params, UNIX_EPOCH).unwrap_err();
        assert!(matches!(err, PackError::SourceUnavailable { ref path, .. } if path.ends_with(CONFIG_TEMPLATE)));
        assert!(!fs.flushed);
    }
}
