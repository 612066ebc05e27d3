use anyhow::Result;
use clap::{Args, Subcommand};

use pixelsense::config::Config;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration (secrets masked)
    Show,

    /// Print the config file path
    Path,

    /// Read a single value, e.g. `inference.model`
    Get { key: String },

    /// Set a single value and write the file
    Set { key: String, value: String },
}

pub async fn run(args: ConfigArgs, config_path: Option<&str>) -> Result<()> {
    let path = match config_path {
        Some(p) => super::common::expand_path(p),
        None => Config::config_path()?,
    };

    match args.command {
        ConfigCommands::Path => println!("{}", path.display()),
        ConfigCommands::Show => {
            let mut config = Config::load_from(&path)?;
            config.inference.api_key = mask(&config.inference.api_key);
            config.storage.imgbb_api_key = mask(&config.storage.imgbb_api_key);
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCommands::Get { key } => {
            let config = Config::load_from(&path)?;
            println!("{}", config.get_value(&key)?);
        }
        ConfigCommands::Set { key, value } => {
            let mut config: Config = if path.exists() {
                toml::from_str(&std::fs::read_to_string(&path)?)?
            } else {
                Config::default()
            };
            config.set_value(&key, &value)?;
            config.validate()?;
            config.save_to(&path)?;
            println!("{} = {}", key, value);
        }
    }

    Ok(())
}

fn mask(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        "********".to_string()
    }
}
