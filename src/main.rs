//! Loophole CLI - expose local servers over secure tunnels.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use loophole::config::{Config, Endpoint};
use loophole::supervisor;
use loophole_auth::TokenStore;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Loophole exposes local servers to the public over secure tunnels.
#[derive(Parser, Debug)]
#[command(name = "loophole")]
#[command(about = "Loophole exposes local servers to the public over secure tunnels.")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Local port to expose
    port: Option<u16>,

    /// Local host to expose
    #[arg(default_value = "127.0.0.1")]
    host: String,

    /// Private key path
    #[arg(short = 'i', long, value_name = "PATH")]
    identity_file: Option<PathBuf>,

    /// Remote gateway URL
    #[arg(long, default_value = "gateway.loophole.host")]
    gateway_url: String,

    /// Remote gateway port
    #[arg(long, default_value_t = 8022)]
    gateway_port: u16,

    /// Custom hostname you want to run the service on
    #[arg(long)]
    hostname: Option<String>,

    /// Render a terminal QR code of the public URL
    #[arg(long)]
    qr: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in via the browser-based device flow
    Login,
    /// Remove the stored login
    Logout,
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

async fn login() -> Result<()> {
    let grant = loophole_auth::register_device().await?;
    let pair = loophole_auth::poll_for_token(&grant.device_code, grant.interval).await?;

    let store = TokenStore::at_default_location()?;
    store.save(&pair)?;

    println!("Logged in successfully");
    Ok(())
}

fn logout() -> Result<()> {
    let store = TokenStore::at_default_location()?;
    store.delete()?;

    println!("Logged out");
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Some(Commands::Login) => login().await,
        Some(Commands::Logout) => logout(),
        None => {
            let port = cli.port.context("Missing argument: port")?;
            if port == 0 {
                bail!("Invalid argument: port: must be between 1 and 65535");
            }

            let identity_file = match cli.identity_file {
                Some(path) => path,
                None => dirs::home_dir()
                    .context("Failed to resolve the home directory")?
                    .join(".ssh")
                    .join("id_rsa"),
            };

            let config = Config {
                local: Endpoint::new(cli.host, port),
                gateway: Endpoint::new(cli.gateway_url, cli.gateway_port),
                identity_file,
                site_id: cli.hostname,
                qr: cli.qr,
            };

            supervisor::run(config).await
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if let Err(err) = run(cli).await {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}
