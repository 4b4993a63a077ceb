use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use capgate::{Config, Gateway};

/// MCP capability gateway over Nostr relays.
#[derive(Debug, Parser)]
#[command(name = "capgate", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yml")]
    config_path: PathBuf,

    /// Raise log verbosity to debug.
    #[arg(long)]
    verbose: bool,

    /// Enable interactive mode (built-in tools, relay set may be empty).
    #[arg(long)]
    interactive: bool,

    /// Override the relay set (repeatable).
    #[arg(long = "relay")]
    relays: Vec<String>,

    /// Override the identity secret (64 hex characters).
    #[arg(long)]
    private_key: Option<String>,
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "capgate=debug" } else { "capgate=info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

fn load_config(cli: &Cli) -> capgate::Result<Config> {
    let mut config = Config::load(&cli.config_path)?;
    if !cli.relays.is_empty() {
        config.nostr.relay_urls = cli.relays.clone();
    }
    if let Some(private_key) = &cli.private_key {
        config.nostr.private_key = private_key.clone();
    }
    if cli.interactive {
        config.feature_flags.interactive = true;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            log::error!("initialisation failed: {e}");
            return ExitCode::from(1);
        }
    };

    let gateway = match Gateway::new(config).await {
        Ok(gateway) => gateway,
        Err(e) => {
            log::error!("initialisation failed: {e}");
            return ExitCode::from(1);
        }
    };

    log::info!("gateway identity: {}", gateway.public_key());

    let result = tokio::select! {
        result = gateway.run() => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupt received, shutting down");
            gateway.shutdown().await;
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("gateway terminated: {e}");
            ExitCode::from(1)
        }
    }
}
