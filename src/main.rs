use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use kbucket::config::{format_config, parse_port_range, Config};
use kbucket::hub::run_hub;
use kbucket::logging::{init_logging, LogConfig, Verbosity};
use kbucket::share::run_share;

#[derive(Parser)]
#[command(name = "kbucket")]
#[command(version)]
#[command(about = "Share directories through a hub and locate files by SHA-1")]
#[command(
    long_about = "A share indexes a local directory and keeps a tunnel open to a hub. The hub answers lookups by content checksum and proxies downloads from connected shares."
)]
struct Cli {
    /// Path to the config file (default: ~/.config/kbucket/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true, env = "DEBUG")]
    debug: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Write the log file as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Share a directory through a hub
    Share(ShareArgs),
    /// Run a hub
    Hub(HubArgs),
    /// Show the effective configuration
    Config,
}

#[derive(Args)]
struct ShareArgs {
    /// Directory to share
    directory: PathBuf,

    /// Hub tunnel address (host:port)
    #[arg(long, env = "KBUCKET_HUB_ADDRESS")]
    hub_address: Option<String>,

    /// Protocol advertised for direct downloads
    #[arg(long, env = "KBUCKET_SHARE_PROTOCOL")]
    protocol: Option<String>,

    /// Host advertised for direct downloads
    #[arg(long, env = "KBUCKET_SHARE_HOST")]
    host: Option<String>,

    /// Ports the content server may use, e.g. 12000-13000
    #[arg(long, env = "KBUCKET_SHARE_PORT_RANGE")]
    port_range: Option<String>,

    /// External program computing fingerprints
    #[arg(long)]
    fingerprint_tool: Option<String>,

    /// Directory with the static web interface
    #[arg(long)]
    web_dir: Option<PathBuf>,
}

#[derive(Args)]
struct HubArgs {
    /// Externally visible base URL of the hub
    #[arg(long, env = "KBUCKET_HUB_URL")]
    url: Option<String>,

    /// HTTP port
    #[arg(long)]
    listen_port: Option<u16>,

    /// Port shares connect to
    #[arg(long)]
    tunnel_port: Option<u16>,

    /// Data directory holding the raw store
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Maximum number of connected shares
    #[arg(long)]
    max_shares: Option<usize>,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    config.context("Failed to load configuration")
}

fn apply_share_args(config: &mut Config, args: &ShareArgs) -> Result<()> {
    let share = &mut config.share;
    if let Some(ref hub_address) = args.hub_address {
        share.hub_address = hub_address.clone();
    }
    if let Some(ref protocol) = args.protocol {
        share.protocol = protocol.clone();
    }
    if let Some(ref host) = args.host {
        share.host = host.clone();
    }
    if let Some(ref port_range) = args.port_range {
        parse_port_range(port_range)?;
        share.port_range = port_range.clone();
    }
    if args.fingerprint_tool.is_some() {
        share.fingerprint_tool = args.fingerprint_tool.clone();
    }
    if args.web_dir.is_some() {
        share.web_dir = args.web_dir.clone();
    }
    Ok(())
}

fn apply_hub_args(config: &mut Config, args: &HubArgs) {
    let hub = &mut config.hub;
    if let Some(ref url) = args.url {
        hub.url = url.clone();
    }
    if let Some(port) = args.listen_port {
        hub.listen_port = port;
    }
    if let Some(port) = args.tunnel_port {
        hub.tunnel_port = port;
    }
    if args.data_dir.is_some() {
        hub.data_dir = args.data_dir.clone();
    }
    if let Some(max_shares) = args.max_shares {
        hub.max_shares = max_shares;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    let _log_guard = init_logging(&LogConfig {
        verbosity: Verbosity::from_debug(cli.debug || config.debug),
        log_file: cli.log_file.clone().or_else(|| config.log_file.clone()),
        json_file: cli.log_json,
    });

    match cli.command {
        Commands::Share(args) => {
            apply_share_args(&mut config, &args)?;
            run_share(args.directory, config.share).await?;
        }
        Commands::Hub(args) => {
            apply_hub_args(&mut config, &args);
            let data_dir = config.hub_data_dir()?;
            run_hub(config.hub, &data_dir).await?;
        }
        Commands::Config => {
            println!("{}", format_config(&config));
        }
    }

    Ok(())
}
