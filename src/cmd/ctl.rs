use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Commands,
    /// Logging level: off, error, warn, info, debug or trace
    #[clap(short, long, default_value = "info", global = true)]
    pub log_level: LevelFilter,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a file of random records
    Generate {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Number of records
        #[arg(short = 'n', long)]
        records: u64,

        /// Bytes of value per record
        #[arg(long, default_value_t = 90)]
        value_len: usize,

        /// Seed for reproducible data
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Check that the given files, concatenated in order, are sorted by key
    Validate {
        /// Files in node id order
        #[clap(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print a topology of local nodes on consecutive ports
    Topology {
        /// Number of nodes
        #[arg(short = 'n', long)]
        nodes: usize,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short = 'p', long, default_value_t = 5000)]
        base_port: u16,
    },
}
