//! Module image tooling CLI.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use plcrt_runtime::flash::FileFlash;
use plcrt_runtime::image::{ImageHeader, HEADER_SIZE};
use plcrt_runtime::loader;

#[derive(Parser)]
#[command(name = "plcrt", about = "PLC module image tooling", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify a sealed module image (signature and payload checksum).
    Check {
        /// Image file.
        image: PathBuf,
    },
    /// Print header fields and payload size of an image.
    Info {
        /// Image file.
        image: PathBuf,
    },
    /// Program a sealed image into a partition file.
    Flash {
        /// Image file.
        image: PathBuf,
        /// Partition backing file.
        #[arg(long)]
        partition: PathBuf,
        /// Partition size in bytes.
        #[arg(long, default_value_t = 256 * 1024)]
        size: usize,
    },
    /// Erase a partition file.
    Erase {
        /// Partition backing file.
        #[arg(long)]
        partition: PathBuf,
        /// Partition size in bytes.
        #[arg(long, default_value_t = 256 * 1024)]
        size: usize,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Check { image } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            ImageHeader::verify(&bytes).context("image verification failed")?;
            println!("OK: {} ({} payload bytes)", image.display(), bytes.len() - HEADER_SIZE);
        }
        Command::Info { image } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            let header = ImageHeader::parse(&bytes).context("invalid image header")?;
            let payload = bytes.len().saturating_sub(HEADER_SIZE);
            let valid = ImageHeader::verify(&bytes).is_ok();
            println!("image:    {}", image.display());
            println!("checksum: {:#010x} ({})", header.checksum, if valid { "valid" } else { "MISMATCH" });
            println!("payload:  {payload} bytes");
        }
        Command::Flash {
            image,
            partition,
            size,
        } => {
            let flash = FileFlash::open(&partition, size)
                .with_context(|| format!("opening partition {}", partition.display()))?;
            loader::flash_module(&flash, &image).context("flash programming failed")?;
            println!("flashed {} into {}", image.display(), partition.display());
        }
        Command::Erase { partition, size } => {
            let flash = FileFlash::open(&partition, size)
                .with_context(|| format!("opening partition {}", partition.display()))?;
            loader::erase_flash(&flash).context("erase failed")?;
            println!("erased {}", partition.display());
        }
    }
    Ok(())
}
