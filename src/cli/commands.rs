use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tgscrape")]
#[command(author, version, about = "Periodically archive new Telegram group messages to CSV", long_about = None)]
pub struct Cli {
    /// CSV file to read and append to (overrides scraper.output_file)
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one cycle now, then keep running on the configured schedule until Ctrl+C
    Run,

    /// Run a single cycle and exit
    Once,

    /// Resolve the configured group and report what was found
    Check,

    /// Summarize the stored messages without touching the network
    Stats,
}
