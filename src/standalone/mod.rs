//! Runs a whole cluster inside one process over loopback gRPC.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

use crate::cmd::Tuning;

pub mod engine;

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
    /// Sort the inputs with one in-process node per input file
    Sort {
        /// Input files; node i reads the i-th one
        #[arg(short, long, num_args = 1.., required = true)]
        input: Vec<PathBuf>,

        /// Output directory; node i writes part-i
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        tuning: Tuning,
    },
}

#[derive(Debug, Clone)]
pub struct Job {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
}
