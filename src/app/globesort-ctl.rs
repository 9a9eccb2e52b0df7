use anyhow::{bail, Result};
use clap::Parser;
use globesort::cmd::ctl::{Args, Commands};
use globesort::tools::{generate, validate};
use globesort::utils::init_logger;
use globesort::Topology;
use log::info;

fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.log_level);

    match args.command {
        Commands::Generate {
            output,
            records,
            value_len,
            seed,
        } => {
            let written = generate(&output, records, value_len, seed)?;
            info!("wrote {} records to {}", written, output.display());
        }
        Commands::Validate { files } => {
            let report = validate(&files)?;
            match report.disorder {
                None => println!("{} records sorted", report.records),
                Some(disorder) => bail!(
                    "record {} of {} is out of order ({} records checked before it)",
                    disorder.index,
                    disorder.path.display(),
                    report.records
                ),
            }
        }
        Commands::Topology {
            nodes,
            host,
            base_port,
        } => {
            println!("{}", Topology::local(nodes, &host, base_port)?.to_json()?);
        }
    }
    Ok(())
}
