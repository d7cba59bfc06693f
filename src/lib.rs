//! Assembles bootable disk images for Raspberry Pi class appliances.
//!
//! Inputs are prebuilt binaries, firmware blobs and kernel artifacts on the
//! build host. Outputs are:
//!
//! - a SquashFS **root image** with `/gokrazy/*` (base system and `init`)
//!   and `/user/*` (user programs),
//! - a FAT **boot image** with firmware, `vmlinuz`, device trees and patched
//!   `cmdline.txt` / `config.txt`,
//! - optionally an **MBR sector** whose disk signature is the PARTUUID named
//!   in `cmdline.txt`, and which records where the firmware finds the kernel,
//! - optionally a spliced **disk image** and a JSON **manifest**.
//!
//! # Architecture
//!
//! ```text
//! config ──► pack::run
//!               │
//!               ├── tree             file tree of the root partition
//!               ├── artifact::rootfs ──► artifact::squashfs   (root image)
//!               ├── artifact::boot   ──► artifact::bootfs     (boot image)
//!               ├── artifact::disk   MBR from boot image read-back
//!               └── manifest
//! ```

pub mod artifact;
pub mod config;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod output;
pub mod pack;
pub mod partuuid;
pub mod tree;

pub use error::{PackError, Result};
pub use partuuid::PartUuid;
