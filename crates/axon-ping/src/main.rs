// ABOUTME: Entry point for the axon-ping CLI
// ABOUTME: Parses arguments and hands off to the library

use anyhow::Result;
use axon_ping::Cli;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    axon_log::init(cli.verbose);

    axon_ping::run(cli).await
}
