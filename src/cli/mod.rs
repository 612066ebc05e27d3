pub mod ask;
pub mod common;
pub mod config;
pub mod serve;
pub mod session;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pixelsense")]
#[command(author, version, about = "Image captioning and visual question answering")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "PIXELSENSE_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the backend HTTP service
    Serve(serve::ServeArgs),

    /// Start an interactive session (upload/capture, save, ask)
    Session(session::SessionArgs),

    /// Caption an image or ask one question about it
    Ask(ask::AskArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}
