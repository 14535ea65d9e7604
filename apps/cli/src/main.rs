//! ctirelay CLI — threat-intel relay from client queues to a STIX sink.
//!
//! Producers push raw observable records into per-client queues; the relay
//! drains them on an interval and ships one STIX bundle per cycle.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
