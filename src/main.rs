mod cli;
mod engine;
mod logging;
mod model;
mod orchestrator;
mod shell;
mod storage;
mod text_summary;
mod validation;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    logging::init_tracing(args.verbose);

    match cli::run(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}
