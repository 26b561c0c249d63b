//! gnet - a Gnutella-style overlay node.
//!
//! ```bash
//! # Run with defaults, listening on 0.0.0.0:6346
//! gnet run
//!
//! # Run from a config file, bootstrapping from an extra host
//! gnet --config gnet.toml run --connect 203.0.113.5:6346
//!
//! # Print the default configuration
//! gnet sample-config > gnet.toml
//!
//! # List hosts saved in the host cache database
//! gnet --config gnet.toml hosts
//! ```

mod config;
mod logging;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use gnet_overlay::{current_timestamp, HostCache, HostCategory, Overlay, OverlayDriver};
use tracing::info;

use crate::config::AppConfig;
use crate::logging::LogFormat;

/// Gnutella-style overlay node
#[derive(Parser)]
#[command(name = "gnet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable trace logging (most verbose)
    #[arg(long, global = true)]
    trace: bool,

    /// Log output format, overriding the config file
    #[arg(long, global = true)]
    log_format: Option<CliLogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum CliLogFormat {
    Text,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => LogFormat::Text,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node until interrupted
    Run {
        /// Listen address (overrides config)
        #[arg(long, value_name = "ADDR")]
        listen: Option<SocketAddr>,

        /// Do not accept incoming connections
        #[arg(long)]
        no_listen: bool,

        /// Extra bootstrap host, may be repeated
        #[arg(long, value_name = "HOST:PORT")]
        connect: Vec<String>,

        /// Run as a leaf instead of an ultrapeer
        #[arg(long)]
        leaf: bool,
    },

    /// Print the default configuration
    SampleConfig,

    /// List hosts stored in the host cache database
    Hosts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::SampleConfig = cli.command {
        return cmd_sample_config();
    }

    let config = load_config(&cli)?;
    init_logging(&cli, &config)?;
    config.validate()?;

    match cli.command {
        Commands::Run {
            listen,
            no_listen,
            connect,
            leaf,
        } => cmd_run(config, listen, no_listen, connect, leaf).await,
        Commands::SampleConfig => cmd_sample_config(),
        Commands::Hosts => cmd_hosts(config),
    }
}

fn init_logging(cli: &Cli, config: &AppConfig) -> anyhow::Result<()> {
    let mut log_config = config.logging.to_log_config();
    if cli.trace {
        log_config = log_config.with_level("trace");
    } else if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    if let Some(format) = cli.log_format {
        log_config = log_config.with_format(format.into());
    }
    logging::init(&log_config)?;
    tracing::debug!("Logging initialized");
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    match &cli.config {
        Some(path) => AppConfig::from_file_with_env(path),
        None => {
            let mut config = AppConfig::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }
}

async fn cmd_run(
    mut config: AppConfig,
    listen: Option<SocketAddr>,
    no_listen: bool,
    connect: Vec<String>,
    leaf: bool,
) -> anyhow::Result<()> {
    let overlay_config = &mut config.overlay;
    if let Some(addr) = listen {
        overlay_config.listen_addr = addr;
    }
    if no_listen {
        overlay_config.listen_enabled = false;
    }
    if leaf {
        overlay_config.local.ultrapeer = false;
    }
    overlay_config.known_hosts.extend(connect);

    let overlay = Overlay::new(config.overlay, current_timestamp())?;
    let driver = OverlayDriver::bind(overlay).await?;
    if let Some(addr) = driver.local_addr() {
        info!("Node listening on {}", addr);
    }

    let overlay = driver
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Interrupted, shutting down");
        })
        .await?;

    let stats = overlay.stats();
    info!(
        "Stopped after {} connections ({} handshakes, {} failed), {} messages received, {} routed",
        stats.nodes_added,
        stats.handshakes_completed,
        stats.handshakes_failed,
        stats.messages_received,
        stats.messages_routed,
    );
    Ok(())
}

fn cmd_sample_config() -> anyhow::Result<()> {
    println!("{}", AppConfig::sample_config()?);
    Ok(())
}

fn cmd_hosts(config: AppConfig) -> anyhow::Result<()> {
    let Some(path) = config.overlay.host_cache_db.as_deref() else {
        anyhow::bail!("no host_cache_db configured");
    };
    let cache = HostCache::new_with_db(config.overlay.host_cache, path)?;
    for category in HostCategory::ALL {
        let entries = cache.entries(category);
        if entries.is_empty() {
            continue;
        }
        println!("{} ({}):", category, entries.len());
        for entry in entries {
            println!("  {:<45} last seen {}", entry.addr.to_string(), entry.last_seen);
        }
    }
    Ok(())
}
