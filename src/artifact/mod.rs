//! Image artifacts of an appliance disk.
//!
//! - [`rootfs`] - depth-first writer of the file tree into a root image
//! - [`squashfs`] - SquashFS encoder for the root image (`backhand`)
//! - [`boot`] - boot partition contents: firmware, kernel, patched text files
//! - [`bootfs`] - FAT encoder and extent reader for the boot image
//! - [`disk`] - MBR generation and full-disk assembly
//!
//! The root and boot images are independent. The MBR depends on the boot
//! image, because it records where `vmlinuz` and `cmdline.txt` ended up.

pub mod boot;
pub mod bootfs;
pub mod disk;
pub mod rootfs;
pub mod squashfs;
