use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use rusty_mount::{open_image, read_header, NoProgress, OpenOptions, Progress};

#[derive(Parser)]
#[command(
    name = "rusty-mount",
    about = "Inspect, verify and read partclone/partimage/ntfsclone backup images"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the image header.
    Info {
        /// Path to the image (first split file for split sets).
        image: PathBuf,
    },
    /// Read every used block and check the embedded checksums.
    Verify {
        image: PathBuf,
    },
    /// Read a byte range of the virtual partition to stdout.
    Read {
        image: PathBuf,
        /// Byte offset in the partition.
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Number of bytes to read.
        #[arg(long)]
        size: u64,
    },
}

/// Progress reporter backed by an indicatif bar.
struct ConsoleProgress {
    bar: Option<ProgressBar>,
}

impl ConsoleProgress {
    fn new() -> Self {
        Self { bar: None }
    }
}

impl Progress for ConsoleProgress {
    fn start(&mut self, total: u64) {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template(
                "{bar:40} {human_pos}/{human_len} used blocks ({eta})",
            )
            .expect("static template"),
        );
        self.bar = Some(bar);
    }

    fn advance(&mut self, n: u64) {
        if let Some(bar) = &self.bar {
            bar.inc(n);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Info { image } => {
            let header = read_header(&image)
                .with_context(|| format!("failed to read {}", image.display()))?;
            println!("{header}");
        }
        Command::Verify { image } => {
            let options = OpenOptions {
                verify_checksums: true,
                ..OpenOptions::default()
            };
            let opened = open_image(&image, &options, &mut ConsoleProgress::new())
                .with_context(|| format!("failed to open {}", image.display()))?;
            match opened.verify_failure() {
                Some(block) => bail!("checksum mismatch at used block {block}"),
                None => println!(
                    "OK: {} used blocks verified",
                    opened.header().used_blocks
                ),
            }
        }
        Command::Read {
            image,
            offset,
            size,
        } => {
            let opened = open_image(&image, &OpenOptions::default(), &mut NoProgress)
                .with_context(|| format!("failed to open {}", image.display()))?;
            let (_, io) = opened.into_block_io()?;
            let data = io.read_at(offset, size as usize)?;
            std::io::stdout().write_all(&data)?;
        }
    }
    Ok(())
}
