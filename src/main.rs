use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use inventory_gate::comms;
use inventory_gate::config::Config;
use inventory_gate::utils;

#[derive(Parser)]
#[command(name = "inventory", version, about = "Inventory API with rate limiting and bearer-token auth")]
struct AppCli {
    /// Config file path (JSON); environment variables override its values
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Validate configuration and exit
    CheckConfig,
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let config = match path {
        Some(p) => Config::from_file(p)?,
        None => Config::from_env()?,
    };
    if let Err(e) = config.validate() {
        error!("invalid configuration: {}", e);
        return Err(e.into());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init();

    let args = AppCli::parse();
    let config = load_config(args.config.as_deref())?;

    match args.command.unwrap_or(Commands::Serve { port: 8080 }) {
        Commands::Serve { port } => {
            info!("Starting inventory API v{} on port {port}", inventory_gate::VERSION);
            comms::serve(config, port).await?;
        }
        Commands::CheckConfig => {
            info!("configuration OK");
        }
    }

    Ok(())
}
