//! RTDT relay server binary
//!
//! Real-Time Data Transfer relay over UDP

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::OsRng;
use rtdt_crypto::aead::AeadKey;
use rtdt_crypto::kem::KemPrivateKey;
use rtdt_server::Server;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use config::Config;

/// RTDT - real-time session relay
#[derive(Parser)]
#[command(name = "rtdt-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (repeatable), overrides the config file
    #[arg(short, long)]
    listen: Vec<SocketAddr>,

    /// Log level, overrides the config file and RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay (default)
    Run,

    /// Generate a KEM keypair for transport encryption
    Keygen {
        /// Output file for the private key
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Print a random cookie key
    CookieKey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if !cli.listen.is_empty() {
        config.server.listen = cli.listen.iter().map(ToString::to_string).collect();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    config.validate()?;

    // Initialize logging
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(&config).await?,
        Commands::Keygen { output } => generate_keypair(&output)?,
        Commands::CookieKey => {
            println!("{}", AeadKey::generate(&mut OsRng).to_hex());
        }
    }

    Ok(())
}

/// Run the relay until ctrl-c
async fn run_server(config: &Config) -> anyhow::Result<()> {
    let server_config = config.to_server_config()?;
    let server = Server::bind(server_config)
        .await
        .context("starting relay server")?;

    for addr in server.local_addrs() {
        tracing::info!("Relay bound on {addr}");
    }

    let token = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
        }
        token.cancel();
    });

    server.run().await?;
    Ok(())
}

/// Generate a KEM keypair and save the private key
fn generate_keypair(output: &Path) -> anyhow::Result<()> {
    println!("Generating new ML-KEM-768 keypair...");

    let key = KemPrivateKey::generate();

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    key.save(output)
        .with_context(|| format!("writing {}", output.display()))?;

    println!("Public key: {}", key.public_key().to_hex());
    println!("Private key saved to: {}", output.display());
    println!("\nKeep this file secure! It contains your private key.");

    Ok(())
}
