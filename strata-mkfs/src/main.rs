//! Formats a disk image for `strata-fs`, matching spec.md §6's CLI
//! contract: `-f` to format, `-o mlfqs` accepted and threaded through for
//! an external scheduler's benefit.
mod device;

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use strata_core::facade::{BlockDevice, DeviceRole, SECTOR_SIZE};
use strata_fs::FileSystem;

use device::FileBlockDevice;

/// Format a strata-fs disk image.
#[derive(Parser, Debug)]
#[command(name = "strata-mkfs", about = "Format a strata-fs disk image")]
struct Args {
    /// Format the image (the only supported mode; accepted for parity
    /// with the kernel's argv contract).
    #[arg(short = 'f', long = "format")]
    format: bool,

    /// Scheduler options, e.g. `-o mlfqs`. Recorded but otherwise inert:
    /// the scheduler itself is out of scope for this workspace.
    #[arg(short = 'o', long = "option")]
    option: Option<String>,

    /// Path to the disk image to create or overwrite.
    image: PathBuf,

    /// Image size in sectors.
    #[arg(long, default_value_t = 1 << 15)]
    sectors: u32,
}

fn main() {
    strata_core::logging::set_max_level(strata_core::logging::LevelFilter::Info);
    let _ = env_logger::try_init();

    let args = Args::parse();
    if !args.format {
        strata_core::logging::error!("strata-mkfs requires -f to format an image");
        std::process::exit(1);
    }
    let mlfqs = args.option.as_deref() == Some("mlfqs");
    if mlfqs {
        strata_core::logging::info!("mlfqs option recorded; no scheduler in this workspace consumes it");
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .read(true)
        .truncate(true)
        .open(&args.image)
        .unwrap_or_else(|e| {
            strata_core::logging::error!("failed to open {}: {e}", args.image.display());
            std::process::exit(1);
        });
    file.set_len(args.sectors as u64 * SECTOR_SIZE as u64).unwrap_or_else(|e| {
        strata_core::logging::error!("failed to size {}: {e}", args.image.display());
        std::process::exit(1);
    });

    let device: Arc<dyn BlockDevice> = Arc::new(FileBlockDevice::new(file, args.sectors, DeviceRole::Filesys));
    match FileSystem::format(device, Duration::from_secs(30)) {
        Ok(fs) => {
            if let Err(e) = fs.shutdown() {
                strata_core::logging::error!("failed to flush formatted image: {e}");
                std::process::exit(1);
            }
            strata_core::logging::info!("formatted {} ({} sectors)", args.image.display(), args.sectors);
        }
        Err(e) => {
            strata_core::logging::error!("format failed: {e}");
            std::process::exit(1);
        }
    }
}
