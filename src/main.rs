use anyhow::Result;
use clap::Parser;

mod cli;

use cli::{Cli, Commands};
use pixelsense::config::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let command = match cli.command {
        // works on the file itself and must not fail on a bad value
        Commands::Config(args) => {
            init_logging(cli.verbose, "warn");
            return cli::config::run(args, cli.config.as_deref()).await;
        }
        other => other,
    };

    let config = Config::load_with_override(cli.config.as_deref())?;
    init_logging(cli.verbose, &config.logging.level);

    match command {
        Commands::Serve(args) => cli::serve::run(args, config).await,
        Commands::Session(args) => cli::session::run(args, config).await,
        Commands::Ask(args) => cli::ask::run(args, &config).await,
        Commands::Config(_) => Ok(()),
    }
}

fn init_logging(verbose: bool, configured: &str) {
    let log_level = if verbose { "debug" } else { configured };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();
}
