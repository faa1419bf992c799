use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use loom::config::{apply_env_overrides, LoomConfig};
use loom::server::start_server;

#[derive(Parser)]
#[command(name = "loom", version, about = "Orchestration core for LLM-assisted app generation")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "loom.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestration server
    Serve {
        /// Override the listen port
        #[arg(short, long, env = "LOOM_PORT")]
        port: Option<u16>,

        /// Enable permissive CORS for local frontend development
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = LoomConfig::load(&cli.config)?;
    let env: HashMap<String, String> = std::env::vars().collect();
    apply_env_overrides(&mut config, &env);

    match cli.command {
        Command::Serve { port, dev } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if dev {
                config.server.dev_mode = true;
            }
            start_server(config).await
        }
    }
}
