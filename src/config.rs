//! Build configuration.
//!
//! Settings come from an optional TOML file, then command-line overrides,
//! then defaults. A minimal file:
//!
//! ```toml
//! hostname = "router7"
//!
//! [inputs]
//! base_bins = ["bin/dhcp", "bin/ntp"]
//! init = "bin/init"
//! user_bins = ["bin/router7"]
//! firmware_dir = "firmware"
//! kernel_dir = "kernel"
//!
//! [outputs]
//! boot = "out/boot.img"
//! root = "out/root.img"
//! mbr = "out/mbr.img"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::artifact::boot::SerialConsole;
use crate::partuuid::PartUuid;

pub const DEFAULT_HOSTNAME: &str = "gokrazy";
pub const DEFAULT_BOOT_MIB: u64 = 100;
pub const DEFAULT_ROOT_MIB: u64 = 500;

/// Environment variable holding a fixed build time (unix seconds).
pub const SOURCE_DATE_EPOCH: &str = "SOURCE_DATE_EPOCH";

/// Output path meaning "write the boot image to stdout".
pub const STDOUT_PATH: &str = "-";

const MIB: u64 = 1024 * 1024;

/// Raw settings as read from TOML. Every field is optional so that CLI flags
/// can fill in or override what the file leaves out.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub hostname: Option<String>,
    pub partuuid: Option<PartUuid>,
    pub serial_console: Option<String>,
    pub use_partuuid: Option<bool>,
    /// Unix seconds used for every generated timestamp.
    pub build_time: Option<u64>,
    #[serde(default)]
    pub inputs: InputsToml,
    #[serde(default)]
    pub outputs: OutputsToml,
    #[serde(default)]
    pub sizes: SizesToml,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputsToml {
    #[serde(default)]
    pub base_bins: Vec<PathBuf>,
    pub init: Option<PathBuf>,
    #[serde(default)]
    pub user_bins: Vec<PathBuf>,
    pub firmware_dir: Option<PathBuf>,
    pub kernel_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputsToml {
    pub boot: Option<PathBuf>,
    pub root: Option<PathBuf>,
    pub mbr: Option<PathBuf>,
    pub disk: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SizesToml {
    pub boot_mib: Option<u64>,
    pub root_mib: Option<u64>,
}

/// Fully resolved settings for one build.
#[derive(Debug, Clone)]
pub struct PackConfig {
    /// Written to `/etc/hostname` when set explicitly.
    pub hostname: Option<String>,
    pub partuuid: PartUuid,
    pub serial_console: SerialConsole,
    pub use_partuuid: bool,
    pub build_time: SystemTime,
    pub base_bins: Vec<PathBuf>,
    pub init: Option<PathBuf>,
    pub user_bins: Vec<PathBuf>,
    pub firmware_dir: PathBuf,
    pub kernel_dir: PathBuf,
    pub boot_bytes: u64,
    pub root_bytes: u64,
    pub outputs: Outputs,
}

#[derive(Debug, Clone)]
pub struct Outputs {
    /// Boot image path, or [`STDOUT_PATH`].
    pub boot: PathBuf,
    pub root: PathBuf,
    pub mbr: Option<PathBuf>,
    pub disk: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
}

impl Outputs {
    pub fn boot_is_stdout(&self) -> bool {
        self.boot.as_os_str() == STDOUT_PATH
    }
}

impl ConfigFile {
    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing config '{}'", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply defaults and validate. `source_date_epoch` is the value of
    /// [`SOURCE_DATE_EPOCH`], if set; an explicit `build_time` wins over it.
    pub fn resolve(self, source_date_epoch: Option<&str>) -> Result<PackConfig> {
        let inputs = self.inputs;
        let outputs = self.outputs;

        let firmware_dir = require(inputs.firmware_dir, "inputs.firmware_dir")?;
        let kernel_dir = require(inputs.kernel_dir, "inputs.kernel_dir")?;
        let boot = require(outputs.boot, "outputs.boot")?;
        let root = require(outputs.root, "outputs.root")?;

        if let Some(hostname) = &self.hostname {
            validate_hostname(hostname)?;
        }
        let partuuid = self.partuuid.unwrap_or_else(|| {
            PartUuid::from_hostname(self.hostname.as_deref().unwrap_or(DEFAULT_HOSTNAME))
        });

        // Parsing a console string cannot fail.
        let serial_console = self
            .serial_console
            .as_deref()
            .and_then(|raw| raw.parse::<SerialConsole>().ok())
            .unwrap_or_default();

        let build_time = match (self.build_time, source_date_epoch) {
            (Some(secs), _) => UNIX_EPOCH + Duration::from_secs(secs),
            (None, Some(raw)) => parse_epoch(raw)?,
            (None, None) => SystemTime::now(),
        };

        let boot_bytes = mib_to_bytes(self.sizes.boot_mib.unwrap_or(DEFAULT_BOOT_MIB), "sizes.boot_mib")?;
        let root_bytes = mib_to_bytes(self.sizes.root_mib.unwrap_or(DEFAULT_ROOT_MIB), "sizes.root_mib")?;

        if boot.as_os_str() == STDOUT_PATH && (outputs.mbr.is_some() || outputs.disk.is_some()) {
            tracing::warn!("boot image goes to stdout; the partition table pass will be refused");
        }

        Ok(PackConfig {
            hostname: self.hostname,
            partuuid,
            serial_console,
            use_partuuid: self.use_partuuid.unwrap_or(true),
            build_time,
            base_bins: inputs.base_bins,
            init: inputs.init,
            user_bins: inputs.user_bins,
            firmware_dir,
            kernel_dir,
            boot_bytes,
            root_bytes,
            outputs: Outputs {
                boot,
                root,
                mbr: outputs.mbr,
                disk: outputs.disk,
                manifest: outputs.manifest,
            },
        })
    }
}

fn require<T>(value: Option<T>, key: &str) -> Result<T> {
    value.ok_or_else(|| anyhow::anyhow!("missing required setting '{key}'"))
}

fn parse_epoch(raw: &str) -> Result<SystemTime> {
    let secs: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("parsing {SOURCE_DATE_EPOCH}='{raw}'"))?;
    Ok(UNIX_EPOCH + Duration::from_secs(secs))
}

fn mib_to_bytes(mib: u64, key: &str) -> Result<u64> {
    if mib == 0 {
        bail!("'{key}' must be at least 1");
    }
    mib.checked_mul(MIB)
        .ok_or_else(|| anyhow::anyhow!("'{key}' = {mib} is too large"))
}

fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() || hostname.len() > 253 {
        bail!("hostname '{hostname}' must be 1 to 253 characters");
    }
    if hostname.contains(['/', '\n', '\0']) {
        bail!("hostname '{hostname}' contains an invalid character");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[inputs]
firmware_dir = "fw"
kernel_dir = "kernel"

[outputs]
boot = "boot.img"
root = "root.img"
"#;

    #[test]
    fn test_defaults() {
        let config = ConfigFile::parse(MINIMAL).unwrap().resolve(Some("0")).unwrap();
        assert_eq!(config.hostname, None);
        assert_eq!(config.partuuid, PartUuid::from_hostname("gokrazy"));
        assert_eq!(config.serial_console, SerialConsole::Device("ttyAMA0,115200".into()));
        assert!(config.use_partuuid);
        assert_eq!(config.boot_bytes, 100 * MIB);
        assert_eq!(config.root_bytes, 500 * MIB);
        assert_eq!(config.build_time, UNIX_EPOCH);
        assert!(config.outputs.mbr.is_none());
        assert!(!config.outputs.boot_is_stdout());
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let err = ConfigFile::parse("hostnmae = \"typo\"\n").unwrap_err();
        assert!(err.to_string().contains("hostnmae"));

        let err = ConfigFile::parse("[outputs]\nisos = \"x\"\n").unwrap_err();
        assert!(err.to_string().contains("isos"));
    }

    #[test]
    fn test_missing_required_setting() {
        let err = ConfigFile::parse("[inputs]\nfirmware_dir = \"fw\"\n")
            .unwrap()
            .resolve(None)
            .unwrap_err();
        assert!(err.to_string().contains("inputs.kernel_dir"));
    }

    #[test]
    fn test_explicit_values() {
        let raw = format!(
            "hostname = \"router7\"\npartuuid = \"deadbeef\"\nserial_console = \"disabled\"\n\
             use_partuuid = false\nbuild_time = 1600000000\n\n[sizes]\nboot_mib = 64\n{MINIMAL}"
        );
        let config = ConfigFile::parse(&raw).unwrap().resolve(Some("5")).unwrap();
        assert_eq!(config.hostname.as_deref(), Some("router7"));
        assert_eq!(config.partuuid, PartUuid(0xdeadbeef));
        assert_eq!(config.serial_console, SerialConsole::Disabled);
        assert!(!config.use_partuuid);
        assert_eq!(config.build_time, UNIX_EPOCH + Duration::from_secs(1_600_000_000));
        assert_eq!(config.boot_bytes, 64 * MIB);
    }

    #[test]
    fn test_serial_console_strings() {
        for (raw, want) in [
            ("UART0", SerialConsole::Device("ttyAMA0,115200".into())),
            ("ttyS0,9600", SerialConsole::Device("ttyS0,9600".into())),
            ("disabled", SerialConsole::Disabled),
        ] {
            let file = format!("serial_console = \"{raw}\"\n{MINIMAL}");
            let config = ConfigFile::parse(&file).unwrap().resolve(None).unwrap();
            assert_eq!(config.serial_console, want, "{raw}");
        }
    }

    #[test]
    fn test_partuuid_derived_from_hostname() {
        let raw = format!("hostname = \"router7\"\n{MINIMAL}");
        let config = ConfigFile::parse(&raw).unwrap().resolve(None).unwrap();
        assert_eq!(config.partuuid, PartUuid::from_hostname("router7"));
    }

    #[test]
    fn test_source_date_epoch() {
        let config = ConfigFile::parse(MINIMAL).unwrap().resolve(Some("1234")).unwrap();
        assert_eq!(config.build_time, UNIX_EPOCH + Duration::from_secs(1234));

        let err = ConfigFile::parse(MINIMAL).unwrap().resolve(Some("soon")).unwrap_err();
        assert!(format!("{err:#}").contains("SOURCE_DATE_EPOCH"));
    }

    #[test]
    fn test_zero_size_rejected() {
        let raw = format!("{MINIMAL}\n[sizes]\nroot_mib = 0\n");
        assert!(ConfigFile::parse(&raw).unwrap().resolve(None).is_err());
    }

    #[test]
    fn test_bad_partuuid_rejected() {
        let raw = format!("partuuid = \"nothex\"\n{MINIMAL}");
        assert!(ConfigFile::parse(&raw).is_err());
    }
}
