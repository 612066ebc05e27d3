use anyhow::Result;
use clap::Args;

use pixelsense::config::Config;
use pixelsense::server::Server;

#[derive(Args)]
pub struct ServeArgs {
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind (overrides config)
    #[arg(short, long)]
    pub bind: Option<String>,
}

pub async fn run(args: ServeArgs, mut config: Config) -> Result<()> {
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    if config.inference.api_key.is_empty() {
        tracing::warn!("No inference API key configured; every answer will be an error");
    }
    if config.storage.imgbb_api_key.is_empty() {
        tracing::info!("No imgbb key configured; images are kept in the local temp store");
    }

    let server = Server::new(&config)?;
    server.run().await
}
