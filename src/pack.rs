//! Build orchestration.
//!
//! ```text
//! build_tree ─► write_root ─► write_boot_partition ─┬─► write_partition_table (mbr)
//!                                                   ├─► assemble_disk          (disk)
//!                                                   └─► Manifest::write        (manifest)
//! ```
//!
//! Stages run strictly in sequence and the first error aborts the build.
//! Artifacts written before the failure are left in place.

use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::artifact::boot::{write_boot_partition, BootAssets, BootParams, WrittenBoot};
use crate::artifact::bootfs::{BootSink, FatOptions};
use crate::artifact::disk::{
    assemble_disk, partition_table::encode_partition_table, write_partition_table, BootLbas,
    DiskLayout,
};
use crate::artifact::rootfs::write_root;
use crate::artifact::squashfs::SquashfsWriter;
use crate::config::PackConfig;
use crate::error::{PackError, Result};
use crate::manifest::Manifest;
use crate::output;
use crate::partuuid::PartUuid;
use crate::tree::Directory;

/// Directory holding the base system binaries and `init`.
pub const BASE_DIR: &str = "gokrazy";
/// Directory holding the user binaries.
pub const USER_DIR: &str = "user";

/// The file name under which the init binary is installed.
pub const INIT_NAME: &str = "init";

/// What a build produced.
#[derive(Debug, Clone)]
pub struct PackReport {
    pub partuuid: PartUuid,
    pub lbas: Option<BootLbas>,
    pub written: Vec<PathBuf>,
}

/// Lay out the root filesystem tree.
///
/// Binaries are installed under their base name. The optional `hostname`
/// adds `/etc/hostname` and the `/etc/resolv.conf` symlink the device's
/// DHCP client maintains.
pub fn build_tree(
    base_bins: &[PathBuf],
    init: Option<&Path>,
    user_bins: &[PathBuf],
    hostname: Option<&str>,
) -> Result<Directory> {
    let mut root = Directory::new();
    root.add_dir(BASE_DIR)?;
    root.add_dir(USER_DIR)?;

    let base = root.must_dir_mut(BASE_DIR);
    for bin in base_bins {
        base.add_host_file(base_name(bin)?, bin).map_err(within(BASE_DIR))?;
    }
    if let Some(init) = init {
        base.add_host_file(INIT_NAME, init).map_err(within(BASE_DIR))?;
    }
    let user = root.must_dir_mut(USER_DIR);
    for bin in user_bins {
        user.add_host_file(base_name(bin)?, bin).map_err(within(USER_DIR))?;
    }

    if let Some(hostname) = hostname {
        root.add_literal("etc/hostname", hostname)?;
        root.add_symlink("etc/resolv.conf", "/tmp/resolv.conf")?;
    }

    Ok(root)
}

/// Report a duplicate found inside `dir` by its path from the root.
fn within(dir: &'static str) -> impl Fn(PackError) -> PackError {
    move |err| match err {
        PackError::DuplicateEntry { path } => PackError::DuplicateEntry {
            path: format!("{dir}/{path}"),
        },
        other => other,
    }
}

fn base_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| PackError::InvalidPath {
            path: path.display().to_string(),
            reason: "binary path has no UTF-8 file name",
        })
}

/// Run a full build.
pub fn run(config: &PackConfig) -> Result<PackReport> {
    let mut written = Vec::new();

    let tree = build_tree(
        &config.base_bins,
        config.init.as_deref(),
        &config.user_bins,
        config.hostname.as_deref(),
    )?;

    let root_path = &config.outputs.root;
    tracing::info!(path = %root_path.display(), "writing root partition");
    {
        let file = output::create_locked(root_path)?;
        let mut sink = BufWriter::new(file);
        write_root(SquashfsWriter::new(config.build_time), &tree, config.build_time, &mut sink)?;
        sink.flush().map_err(|e| PackError::output(root_path, e))?;
    }
    written.push(root_path.clone());

    let assets = BootAssets::collect(&config.firmware_dir, &config.kernel_dir)?;
    let params = BootParams {
        serial_console: config.serial_console.clone(),
        use_partuuid: config.use_partuuid,
        partuuid: config.partuuid,
    };
    let sink = if config.outputs.boot_is_stdout() {
        tracing::info!("writing boot partition to stdout");
        BootSink::Stream(Box::new(io::stdout()))
    } else {
        tracing::info!(path = %config.outputs.boot.display(), "writing boot partition");
        written.push(config.outputs.boot.clone());
        BootSink::File(output::create_locked(&config.outputs.boot)?)
    };
    let fat = FatOptions::new(config.boot_bytes, config.partuuid.0);
    let mut boot = write_boot_partition(sink, &assets, &params, fat, config.build_time)?;

    let layout = DiskLayout::from_bytes(config.boot_bytes, config.root_bytes)?;
    let mut lbas = None;

    if let Some(mbr_path) = &config.outputs.mbr {
        tracing::info!(path = %mbr_path.display(), "writing MBR");
        lbas = Some(write_partition_table(&mut boot, &layout, mbr_path)?);
        written.push(mbr_path.clone());
    }

    if let Some(disk_path) = &config.outputs.disk {
        lbas = Some(write_disk(&mut boot, &layout, config, disk_path)?);
        written.push(disk_path.clone());
    }

    if let Some(manifest_path) = &config.outputs.manifest {
        let mut manifest = Manifest::new(boot.partuuid(), config.build_time, lbas);
        for path in &written {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            manifest.record(&name, path)?;
        }
        manifest.write(manifest_path)?;
        tracing::info!(path = %manifest_path.display(), "wrote build manifest");
    }

    Ok(PackReport {
        partuuid: boot.partuuid(),
        lbas,
        written,
    })
}

fn write_disk(
    boot: &mut WrittenBoot,
    layout: &DiskLayout,
    config: &PackConfig,
    disk_path: &Path,
) -> Result<BootLbas> {
    tracing::info!(path = %disk_path.display(), "assembling disk image");
    let (lbas, sector) = encode_partition_table(boot, layout)?;
    assemble_disk(
        disk_path,
        &sector,
        &config.outputs.boot,
        &config.outputs.root,
        layout,
    )?;
    Ok(lbas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::boot::SerialConsole;
    use crate::artifact::disk::mbr;
    use crate::config::Outputs;
    use crate::tree::FileNode;
    use std::fs;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    fn bins(temp: &TempDir, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|name| {
                let dir = temp.path().join("bins").join(name);
                fs::create_dir_all(&dir).unwrap();
                let path = dir.join(name);
                fs::write(&path, format!("#!{name}")).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn test_build_tree_layout() {
        let temp = TempDir::new().unwrap();
        let base = bins(&temp, &["dhcp", "ntp"]);
        let user = bins(&temp, &["router7"]);
        let init = temp.path().join("gokrazy-init");
        fs::write(&init, b"init").unwrap();

        let tree = build_tree(&base, Some(&init), &user, None).unwrap();

        let names: Vec<&str> = tree.entries().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["gokrazy", "user"]);

        let gokrazy = tree.must_child("gokrazy").as_directory().unwrap();
        let names: Vec<&str> = gokrazy.entries().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["dhcp", "init", "ntp"]);
        assert_eq!(
            gokrazy.must_child("init"),
            &FileNode::HostFile {
                source: init.clone()
            }
        );

        let user_dir = tree.must_child("user").as_directory().unwrap();
        assert!(user_dir.child("router7").is_some());
    }

    #[test]
    fn test_build_tree_hostname() {
        let tree = build_tree(&[], None, &[], Some("router7")).unwrap();
        let etc = tree.must_child("etc").as_directory().unwrap();
        assert_eq!(
            etc.must_child("hostname"),
            &FileNode::Literal {
                content: b"router7".to_vec()
            }
        );
        assert_eq!(
            etc.must_child("resolv.conf"),
            &FileNode::Symlink {
                target: "/tmp/resolv.conf".into()
            }
        );
    }

    #[test]
    fn test_build_tree_duplicate_base_name() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a/tool");
        let b = temp.path().join("b/tool");
        let err = build_tree(&[a, b], None, &[], None).unwrap_err();
        assert!(matches!(err, PackError::DuplicateEntry { ref path } if path == "gokrazy/tool"));
    }

    #[test]
    fn test_build_tree_duplicate_user_name() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a/app");
        let b = temp.path().join("b/app");
        let err = build_tree(&[], None, &[a, b], None).unwrap_err();
        assert!(matches!(err, PackError::DuplicateEntry { ref path } if path == "user/app"));
    }

    fn kernel_fixture(temp: &TempDir) -> (PathBuf, PathBuf) {
        let firmware = temp.path().join("firmware");
        let kernel = temp.path().join("kernel");
        fs::create_dir_all(&firmware).unwrap();
        fs::create_dir_all(&kernel).unwrap();
        fs::write(firmware.join("bootcode.bin"), vec![3u8; 5000]).unwrap();
        fs::write(firmware.join("start.elf"), vec![4u8; 9000]).unwrap();
        fs::write(kernel.join("vmlinuz"), vec![5u8; 40_000]).unwrap();
        fs::write(kernel.join("bcm2710-rpi-3-b.dtb"), b"dtb").unwrap();
        fs::write(
            kernel.join("cmdline.txt"),
            "dwc_otg.lpm_enable=0 root=/dev/mmcblk0p2 rootwait",
        )
        .unwrap();
        fs::write(kernel.join("config.txt"), "enable_uart=0\n").unwrap();
        (firmware, kernel)
    }

    fn config(temp: &TempDir) -> PackConfig {
        let (firmware_dir, kernel_dir) = kernel_fixture(temp);
        let out = temp.path().join("out");
        PackConfig {
            hostname: Some("router7".into()),
            partuuid: PartUuid(0x2badc0de),
            serial_console: SerialConsole::default(),
            use_partuuid: true,
            build_time: UNIX_EPOCH + Duration::from_secs(1_600_000_000),
            base_bins: bins(temp, &["dhcp"]),
            init: None,
            user_bins: bins(temp, &["router7"]),
            firmware_dir,
            kernel_dir,
            boot_bytes: 8 << 20,
            root_bytes: 4 << 20,
            outputs: Outputs {
                boot: out.join("boot.img"),
                root: out.join("root.img"),
                mbr: Some(out.join("mbr.img")),
                disk: Some(out.join("disk.img")),
                manifest: Some(out.join("manifest.json")),
            },
        }
    }

    #[test]
    fn test_run_end_to_end() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);

        let report = run(&config).unwrap();
        assert_eq!(report.partuuid, PartUuid(0x2badc0de));
        assert_eq!(report.written.len(), 4);

        let root = fs::read(&config.outputs.root).unwrap();
        assert_eq!(&root[..4], b"hsqs");

        let sector: [u8; 512] = fs::read(config.outputs.mbr.as_ref().unwrap())
            .unwrap()
            .try_into()
            .unwrap();
        let decoded = mbr::decode(&sector).unwrap();
        assert_eq!(decoded.disk_signature, PartUuid(0x2badc0de));
        assert_eq!(Some(decoded.vmlinuz_lba), report.lbas.map(|l| l.vmlinuz));

        let disk = fs::read(config.outputs.disk.as_ref().unwrap()).unwrap();
        let boot = fs::read(&config.outputs.boot).unwrap();
        assert_eq!(&disk[..512], &sector[..]);
        assert_eq!(&disk[8192 * 512..8192 * 512 + boot.len()], &boot[..]);
        let root_start = (8192 + (8 << 20) / 512) * 512;
        assert_eq!(&disk[root_start..root_start + root.len()], &root[..]);

        let manifest: serde_json::Value =
            serde_json::from_slice(&fs::read(config.outputs.manifest.as_ref().unwrap()).unwrap())
                .unwrap();
        assert_eq!(manifest["partuuid"], "2badc0de");
        assert_eq!(manifest["artifacts"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_root_image_is_reproducible() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        run(&config).unwrap();
        let first_root = fs::read(&config.outputs.root).unwrap();

        run(&config).unwrap();
        assert_eq!(fs::read(&config.outputs.root).unwrap(), first_root);
    }

    #[test]
    fn test_run_missing_host_binary() {
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp);
        config.user_bins.push(temp.path().join("missing/hello"));

        let err = run(&config).unwrap_err();
        assert!(matches!(err, PackError::SourceUnavailable { .. }));
        assert!(!config.outputs.boot.exists());
    }
}
