use clap::Parser;

use pulseglow::config::{Cli, Command};
use pulseglow::{logging, monitor, server};


#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();
    logging::init()?;

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(config) => server::serve(config).await,
        Command::Monitor(config) => monitor::run(config).await,
    }
}
