use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use appliance_builder::config::{ConfigFile, SOURCE_DATE_EPOCH};
use appliance_builder::{logging, pack, PartUuid};

#[derive(Parser)]
#[command(name = "appliance-builder", version, about = "Assemble bootable appliance disk images")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the root and boot images, and optionally MBR, disk image and manifest.
    Build(BuildArgs),
    /// Print the PARTUUID derived from a hostname.
    Partuuid {
        #[arg(default_value = appliance_builder::config::DEFAULT_HOSTNAME)]
        hostname: String,
    },
}

#[derive(Args)]
struct BuildArgs {
    /// TOML config file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    hostname: Option<String>,

    /// Disk identifier as hex; derived from the hostname when omitted.
    #[arg(long)]
    partuuid: Option<PartUuid>,

    /// `disabled`, `UART0` or a `<device>,<baud>` string.
    #[arg(long)]
    serial_console: Option<String>,

    /// Keep the `root=` argument of cmdline.txt as shipped.
    #[arg(long)]
    no_partuuid: bool,

    /// Base system binary (repeatable).
    #[arg(long = "base-bin")]
    base_bins: Vec<PathBuf>,

    #[arg(long)]
    init: Option<PathBuf>,

    /// User binary (repeatable).
    #[arg(long = "user-bin")]
    user_bins: Vec<PathBuf>,

    #[arg(long)]
    firmware_dir: Option<PathBuf>,

    #[arg(long)]
    kernel_dir: Option<PathBuf>,

    /// Boot image output, or `-` for stdout.
    #[arg(long)]
    boot: Option<PathBuf>,

    #[arg(long)]
    root: Option<PathBuf>,

    #[arg(long)]
    mbr: Option<PathBuf>,

    #[arg(long)]
    disk: Option<PathBuf>,

    #[arg(long)]
    manifest: Option<PathBuf>,

    #[arg(long)]
    boot_mib: Option<u64>,

    #[arg(long)]
    root_mib: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Command::Build(args) => build(args),
        Command::Partuuid { hostname } => {
            println!("{}", PartUuid::from_hostname(&hostname));
            Ok(())
        }
    }
}

fn build(args: BuildArgs) -> Result<()> {
    let mut file = match &args.config {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::default(),
    };
    apply_overrides(&mut file, args);

    let epoch = std::env::var(SOURCE_DATE_EPOCH).ok();
    let config = file
        .resolve(epoch.as_deref())
        .context("resolving build configuration")?;

    tracing::info!(partuuid = %config.partuuid, "starting build");
    let report = pack::run(&config).context("assembling appliance image")?;

    for path in &report.written {
        tracing::info!(path = %path.display(), "wrote artifact");
    }
    if let Some(lbas) = report.lbas {
        tracing::info!(
            vmlinuz = lbas.vmlinuz,
            cmdline = lbas.cmdline,
            partuuid = %report.partuuid,
            "partition table written"
        );
    }
    Ok(())
}

fn apply_overrides(file: &mut ConfigFile, args: BuildArgs) {
    fn set<T>(slot: &mut Option<T>, value: Option<T>) {
        if value.is_some() {
            *slot = value;
        }
    }

    set(&mut file.hostname, args.hostname);
    set(&mut file.partuuid, args.partuuid);
    set(&mut file.serial_console, args.serial_console);
    if args.no_partuuid {
        file.use_partuuid = Some(false);
    }

    let inputs = &mut file.inputs;
    inputs.base_bins.extend(args.base_bins);
    set(&mut inputs.init, args.init);
    inputs.user_bins.extend(args.user_bins);
    set(&mut inputs.firmware_dir, args.firmware_dir);
    set(&mut inputs.kernel_dir, args.kernel_dir);

    let outputs = &mut file.outputs;
    set(&mut outputs.boot, args.boot);
    set(&mut outputs.root, args.root);
    set(&mut outputs.mbr, args.mbr);
    set(&mut outputs.disk, args.disk);
    set(&mut outputs.manifest, args.manifest);

    set(&mut file.sizes.boot_mib, args.boot_mib);
    set(&mut file.sizes.root_mib, args.root_mib);
}
