use anyhow::{Context, Result};
use clap::Parser;
use globesort::cmd::node::Args;
use globesort::utils::init_logger;
use globesort::{Node, Topology};
use log::{error, info};

async fn run(args: Args) -> Result<()> {
    let topology = Topology::load(&args.config)
        .with_context(|| format!("Failed to read config file {}", args.config.display()))?;
    let node = Node::new(args.node_id, topology, args.tuning.options())?;

    let summary = node.run(&args.input, &args.output).await?;
    info!(
        "node {}: read {}, kept {}, sent {} in {} batches, wrote {}",
        args.node_id,
        summary.records_read,
        summary.records_kept,
        summary.records_sent,
        summary.batches_sent,
        summary.records_written
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logger(args.log_level);

    if let Err(err) = run(args).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}
