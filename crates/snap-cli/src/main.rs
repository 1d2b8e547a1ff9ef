#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use snap_block::{FileByteDevice, FileControlChannel};
use snap_core::SnapshotDevice;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Root directory of UBD control devices.
const DEFAULT_CONTROL_ROOT: &str = "/dev/ubd";

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "snapserv", about = "Userspace COW servicer for kernel snapshot devices")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve one snapshot device until its control channel closes.
    Serve {
        /// Device name under the UBD control root.
        name: String,
        /// Path to the COW device.
        cow_device: PathBuf,
        /// Path to the read-only base device.
        base_device: PathBuf,
        /// Override the UBD control root directory.
        #[arg(long, default_value = DEFAULT_CONTROL_ROOT)]
        control_root: PathBuf,
    },
    /// Print a device's translation summary without serving it.
    Inspect {
        /// Path to the COW device.
        cow_device: PathBuf,
        /// Path to the read-only base device.
        base_device: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            name,
            cow_device,
            base_device,
            control_root,
        } => serve(&name, &cow_device, &base_device, &control_root),
        Command::Inspect {
            cow_device,
            base_device,
            json,
        } => inspect(&cow_device, &base_device, json),
    }
}

fn open_device(
    cow_device: &std::path::Path,
    base_device: &std::path::Path,
) -> Result<SnapshotDevice<FileByteDevice, FileByteDevice>> {
    let cow = FileByteDevice::open(cow_device)
        .with_context(|| format!("open COW device {}", cow_device.display()))?;
    let base = FileByteDevice::open_read_only(base_device)
        .with_context(|| format!("open base device {}", base_device.display()))?;
    SnapshotDevice::new(cow, base).context("construct snapshot device")
}

fn serve(
    name: &str,
    cow_device: &std::path::Path,
    base_device: &std::path::Path,
    control_root: &std::path::Path,
) -> Result<()> {
    let mut device = open_device(cow_device, base_device)?;

    let control_path = control_root.join(name);
    let mut control = FileControlChannel::open(&control_path)
        .with_context(|| format!("open control device {}", control_path.display()))?;

    info!(
        target: "snap::cli",
        name,
        num_sectors = device.num_sectors(),
        "serving snapshot device"
    );
    device.serve(&mut control).context("request loop failed")?;
    Ok(())
}

fn inspect(cow_device: &std::path::Path, base_device: &std::path::Path, json: bool) -> Result<()> {
    let device = open_device(cow_device, base_device)?;
    let summary = device.summary();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("sectors:        {}", summary.num_sectors);
        println!("areas:          {}", summary.areas);
        println!("exceptions:     {}", summary.exceptions);
        println!("log ops:        {}", summary.ops);
        println!("mergeable ops:  {}", summary.mergeable_ops);
        println!("merged so far:  {}", summary.num_merge_ops);
    }
    Ok(())
}
