//! Gapwise CLI: industrial-maintenance query decision core.
//!
//! Answers technician questions from the knowledge store, scores the
//! answers, and researches the gaps it finds.

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
