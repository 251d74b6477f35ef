use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.log_level.as_deref());

    match cli.command {
        Commands::Check(args) => commands::check::execute(args, &cli.global),
        Commands::Templates(args) => commands::templates::execute(args, &cli.global),
        Commands::Up(args) => commands::up::execute(args, &cli.global).await,
    }
}

/// Log to stderr so tables on stdout stay machine-readable.
fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    if let Err(e) = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
    {
        eprintln!("Failed to initialize tracing: {}", e);
    }
}
