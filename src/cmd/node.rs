use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

use crate::cmd::Tuning;
use crate::NodeId;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Identifier of this node in the topology
    pub node_id: NodeId,
    /// Records this node starts with
    pub input: PathBuf,
    /// Where this node's sorted partition is written
    pub output: PathBuf,
    /// Topology file listing every node of the cluster
    pub config: PathBuf,
    #[command(flatten)]
    pub tuning: Tuning,
    /// Logging level: off, error, warn, info, debug or trace
    #[clap(short, long, default_value = "info")]
    pub log_level: LevelFilter,
}
