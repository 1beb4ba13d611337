use clap::{Parser, Subcommand};
use hytale_region::{OpenMode, RegionFile, RegionOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "region-cli", about = "Inspect Hytale region files")]
struct Cli {
    /// Path to a .region.bin file
    region: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the file header
    Info,
    /// List the occupied blob keys
    Keys,
    /// Per-blob compressed and decompressed sizes
    Stat,
    /// Decompress one blob to a file
    Extract {
        /// Blob key (for chunk columns: x + 32 * z within the region)
        #[arg(long)]
        key: u32,
        /// Output path for the raw decompressed payload
        #[arg(long, short)]
        output: PathBuf,
    },
}

fn open_region(path: &PathBuf) -> std::io::Result<RegionFile> {
    RegionFile::open(
        path,
        &RegionOptions {
            mode: OpenMode::Open,
            ..Default::default()
        },
    )
}

fn run(cli: Cli) -> std::io::Result<()> {
    let region = open_region(&cli.region)?;
    match cli.command {
        Command::Info => {
            println!("path:         {}", region.path().display());
            println!("blob count:   {}", region.blob_count());
            println!("segment size: {}", region.segment_size());
            println!("occupied:     {}", region.keys().len());
        }
        Command::Keys => {
            for key in region.keys() {
                println!("{key}");
            }
        }
        Command::Stat => {
            for key in region.keys() {
                match region.read_blob(key)? {
                    Some(blob) => println!("{key}\t{} bytes", blob.len()),
                    None => println!("{key}\t(removed concurrently)"),
                }
            }
        }
        Command::Extract { key, output } => {
            let Some(blob) = region.read_blob(key)? else {
                eprintln!("slot {key} is empty");
                std::process::exit(1);
            };
            std::fs::write(&output, &blob)?;
            println!("wrote {} bytes to {}", blob.len(), output.display());
        }
    }
    region.close()
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(error) = run(cli) {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}
