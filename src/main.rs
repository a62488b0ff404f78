//! portrelay - Configuration-driven port forwarder
//!
//! Reads a list of forward rules and relays every connection accepted on a
//! rule's source address to its destination.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use tracing::{error, info};
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use portrelay::{config::ConfigManager, shutdown, Engine, EngineSummary};

/// CLI arguments for portrelay
#[derive(Parser, Debug)]
#[command(name = "portrelay")]
#[command(about = "portrelay - Configuration-driven TCP/UDP port forwarder")]
#[command(version)]
#[command(long_about = "
portrelay - Configuration-driven TCP/UDP port forwarder

The configuration is a JSON (or .toml) file:

  {
    \"forward\": [
      { \"src\": \":8080\", \"dst\": \"10.0.0.2:80\", \"type\": \"tcp\", \"label\": \"web\" }
    ],
    \"silent\": false,
    \"disable\": false
  }

Rule keys: src, dst, type (tcp, udp, http, https), label, silent, log, disable.
Placeholders like {{host}} are filled from the --vars file, a flat JSON object
of strings. Unknown placeholders abort startup.

Environment variables:
  RUST_LOG - Log filter, overrides --log-level
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "proxy.json",
        help = "Path to the forward configuration"
    )]
    pub config: PathBuf,

    /// Variables file path
    #[arg(long, help = r#"Path to a JSON variables file, format { "key1": "value1", ... }"#)]
    pub vars: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", help = "Log level")]
    pub log_level: String,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Suppress all output (overrides config file)
    #[arg(long, help = "Suppress all output")]
    pub silent: bool,

    /// Disable all forwarding (overrides config file)
    #[arg(long, help = "Disable all forwarding")]
    pub disable: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Initialize tracing
    let filter = init_tracing(&args)?;

    let mut config = ConfigManager::load_from_file(&args.config, args.vars.as_deref())?;
    config.merge_with_cli_args(args.silent, args.disable);

    if config.silent {
        filter
            .reload(EnvFilter::new("off"))
            .context("Failed to silence logging")?;
    }

    info!(
        "Starting portrelay v{} - Configuration-driven port forwarder",
        env!("CARGO_PKG_VERSION")
    );

    // If validate-config flag is set, just validate and exit
    if args.validate_config {
        info!("✅ Configuration is valid");
        info!("Configuration summary:");
        for rule in &config.forward {
            info!(
                "  {}: {} -> {} ({}{}{}){}",
                rule.label,
                rule.src,
                rule.dst,
                rule.transport,
                if rule.silent { ", silent" } else { "" },
                rule.log
                    .as_ref()
                    .map(|path| format!(", log {}", path.display()))
                    .unwrap_or_default(),
                if rule.disable { " [disabled]" } else { "" }
            );
        }
        if config.disable {
            info!("  Forwarding is disabled globally");
        }
        return Ok(());
    }

    let engine = Engine::from_config(config);
    let run = engine.run();
    tokio::pin!(run);

    // Exiting main drops every listener and relay with the runtime
    tokio::select! {
        summary = &mut run => log_summary(&summary),
        signal = shutdown::wait_for_signal() => match signal {
            Ok(name) => info!("Received {}, shutting down", name),
            Err(e) => {
                error!("Error setting up signal handlers: {}", e);
                log_summary(&run.await);
            }
        },
    }

    Ok(())
}

fn log_summary(summary: &EngineSummary) {
    if summary.globally_disabled {
        info!("Forwarding disabled, nothing to do");
    } else {
        info!(
            "All forwarders stopped ({} started, {} disabled)",
            summary.started, summary.disabled
        );
    }
}

/// Initialize tracing/logging. The returned handle swaps the filter once the
/// configuration is known.
fn init_tracing(args: &CliArgs) -> Result<FilterHandle> {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(handle)
}
