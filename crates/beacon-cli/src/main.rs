// ABOUTME: Entry point for the beacon binary.
// ABOUTME: Parses the command line, loads config and dispatches to collector, agent or config.

use std::path::PathBuf;

use anyhow::Result;
use beacon_cli::{agent, collector, logging, Config};
use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "beacon")]
#[command(about = "Duplex agent/collector channel with automatic reconnection")]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(short, long, global = true, env = "BEACON_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a collector that accepts agent connections
    Collector {
        /// Address to listen on
        #[arg(short, long, env = "BEACON_LISTEN")]
        listen: Option<String>,

        /// Name reported to agents
        #[arg(long)]
        server_id: Option<String>,
    },

    /// Run an agent that connects to a collector
    Agent {
        /// Collector address
        #[arg(long, env = "BEACON_COLLECTOR")]
        collector: Option<String>,

        /// Application name
        #[arg(long)]
        app_name: Option<String>,

        /// Agent id (defaults to the host name)
        #[arg(long)]
        agent_id: Option<String>,
    },

    /// Config file commands
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a commented default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective config
    Show,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Collector { listen, server_id } => {
            let mut config = Config::resolve(cli.config.as_deref())?;
            if let Some(listen) = listen {
                config.collector.listen = listen;
            }
            if server_id.is_some() {
                config.collector.server_id = server_id;
            }
            collector::run(&config).await
        }
        Commands::Agent {
            collector,
            app_name,
            agent_id,
        } => {
            let mut config = Config::resolve(cli.config.as_deref())?;
            if let Some(collector) = collector {
                config.agent.collector = collector;
            }
            if let Some(app_name) = app_name {
                config.agent.application_name = app_name;
            }
            if agent_id.is_some() {
                config.agent.agent_id = agent_id;
            }
            agent::run(&config).await
        }
        Commands::Config(cmd) => run_config(cmd, cli.config),
    }
}

fn run_config(cmd: ConfigCommands, path: Option<PathBuf>) -> Result<()> {
    let path = path.unwrap_or_else(Config::config_path);
    match cmd {
        ConfigCommands::Init { force } => {
            if Config::init(&path, force)? {
                println!("Wrote {}", path.display());
            } else {
                println!("{} already exists (use --force to overwrite)", path.display());
            }
            Ok(())
        }
        ConfigCommands::Show => {
            let config = if path.exists() {
                Config::load_from(&path)?
            } else {
                Config::default()
            };
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        ConfigCommands::Path => {
            println!("{}", path.display());
            Ok(())
        }
    }
}
