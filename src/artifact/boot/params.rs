//! Boot parameter patching for `cmdline.txt` and `config.txt`.
//!
//! Both files are plain-text templates shipped with the kernel. They are
//! patched textually while being copied into the boot partition.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use crate::partuuid::PartUuid;

/// Root device spellings in stock kernel templates that get rewritten to a PARTUUID.
pub const LEGACY_ROOT_DEVICES: &[&str] = &["root=/dev/mmcblk0p2", "root=/dev/sda2"];

const UART_DISABLED: &str = "enable_uart=0";
const UART_ENABLED: &str = "enable_uart=1";

/// Serial console selection.
///
/// Parsed from `"disabled"`, the historical alias `"UART0"`, or a
/// `<device>,<baud>` string such as `ttyAMA0,115200`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialConsole {
    /// UART left free for applications.
    Disabled,
    Device(String),
}

impl SerialConsole {
    pub const DEFAULT_DEVICE: &'static str = "ttyAMA0,115200";

    pub fn is_enabled(&self) -> bool {
        matches!(self, SerialConsole::Device(_))
    }
}

impl Default for SerialConsole {
    fn default() -> Self {
        SerialConsole::Device(Self::DEFAULT_DEVICE.to_string())
    }
}

impl FromStr for SerialConsole {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "disabled" => SerialConsole::Disabled,
            "UART0" => SerialConsole::Device(Self::DEFAULT_DEVICE.to_string()),
            device => SerialConsole::Device(device.to_string()),
        })
    }
}

impl fmt::Display for SerialConsole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerialConsole::Disabled => f.write_str("disabled"),
            SerialConsole::Device(device) => f.write_str(device),
        }
    }
}

/// Patch the kernel command line template.
///
/// With a console enabled, `console=<device> ` is prepended. With
/// `partuuid` set, every [`LEGACY_ROOT_DEVICES`] spelling is replaced by
/// `root=PARTUUID=<id>-02`; other spellings are left alone.
pub fn patch_cmdline(template: &str, console: &SerialConsole, partuuid: Option<PartUuid>) -> String {
    let mut cmdline = match console {
        SerialConsole::Disabled => template.to_string(),
        SerialConsole::Device(device) => format!("console={device} {template}"),
    };
    if let Some(id) = partuuid {
        let root = id.root_arg();
        for legacy in LEGACY_ROOT_DEVICES {
            cmdline = cmdline.replace(legacy, &root);
        }
    }
    cmdline
}

/// Patch the firmware configuration template: a console needs the UART on.
pub fn patch_config(template: &str, console: &SerialConsole) -> String {
    if console.is_enabled() {
        template.replace(UART_DISABLED, UART_ENABLED)
    } else {
        template.to_string()
    }
}
