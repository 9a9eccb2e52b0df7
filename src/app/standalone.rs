use anyhow::Result;
use clap::Parser;
use globesort::standalone::{engine::perform_sort, Args, Commands, Job};
use globesort::utils::init_logger;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.log_level);

    match args.command {
        Commands::Sort {
            input,
            output,
            tuning,
        } => {
            let job = Job {
                inputs: input,
                output,
            };
            for part in perform_sort(&job, tuning.options()).await? {
                info!(
                    "node {} wrote {} records to {}",
                    part.node_id,
                    part.summary.records_written,
                    part.path.display()
                );
            }
        }
    }
    Ok(())
}
