use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use parlor_config::{Config, ConfigManager};
use parlor_gateway::{Gateway, GatewayConfig};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod logging;

use logging::{init_logging, resolve_filter, LoggingOptions};

#[derive(Parser, Debug, Clone)]
#[command(name = "parlor-server")]
#[command(about = "Parlor WebSocket chat server")]
#[command(version)]
struct Cli {
    /// Server port (overrides config)
    #[arg(long, short, env = "PORT")]
    port: Option<u16>,

    /// Bind host (overrides config)
    #[arg(long, env = "PARLOR_HOST")]
    host: Option<String>,

    /// Log level (overrides config; RUST_LOG takes precedence)
    #[arg(long, env = "PARLOR_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long, default_value = "false")]
    json_logs: bool,

    /// Config file path
    #[arg(long, env = "PARLOR_CONFIG", default_value = "~/.parlor/config.json")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Inspect or edit the config file
    Config(ConfigArgs),
}

#[derive(Args, Debug, Clone)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand, Debug, Clone)]
enum ConfigCommands {
    /// Print one value
    Get {
        /// Dotted key, e.g. server.port or hub.max_connections
        key: String,
    },
    /// Change one value and save
    Set {
        /// Dotted key, e.g. server.port or hub.max_connections
        key: String,
        value: String,
    },
    /// Print the whole config
    Show,
}

impl Cli {
    fn config_path(&self) -> PathBuf {
        parlor_config::expand_tilde(&self.config).unwrap_or_else(|| PathBuf::from(&self.config))
    }

    /// Apply command-line overrides on top of the file config
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if self.json_logs {
            config.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config_path();

    if let Some(Commands::Config(args)) = &cli.command {
        return handle_config(args.command.clone(), &config_path).await;
    }

    let config_manager = ConfigManager::load(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    let mut config = config_manager.config().clone();
    cli.apply_overrides(&mut config);
    ConfigManager::validate(&config).context("Invalid configuration")?;

    let rust_log = std::env::var("RUST_LOG").ok();
    let _log_guard = init_logging(&LoggingOptions {
        filter: resolve_filter(
            rust_log.as_deref(),
            cli.log_level.as_deref(),
            config.logging.level,
        ),
        json: config.logging.json,
        file: config
            .logging
            .file
            .as_deref()
            .and_then(parlor_config::expand_tilde),
    })?;

    info!("Config loaded from {:?}", config_path);
    info!("Starting Parlor server on {}:{}", config.server.host, config.server.port);
    info!(
        max_connections = config.hub.max_connections,
        send_queue_capacity = config.hub.send_queue_capacity,
        ping_interval_secs = config.hub.ping_interval_secs,
        read_timeout_secs = config.hub.read_timeout_secs,
        "Hub settings"
    );

    let gateway = Gateway::new(GatewayConfig::from(&config));
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    gateway.run(shutdown).await.context("Chat server failed")?;

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn handle_config(command: ConfigCommands, config_path: &Path) -> anyhow::Result<()> {
    let mut manager = ConfigManager::load(config_path).await?;

    match command {
        ConfigCommands::Get { key } => {
            match manager.config().get_value(&key) {
                Some(value) => println!("{}", format!("{} = {}", key, value).green()),
                None => anyhow::bail!("Key not found: {}", key),
            }
        }
        ConfigCommands::Set { key, value } => {
            let mut candidate = manager.config().clone();
            candidate.set_value(&key, &value)?;
            manager.update(|config| *config = candidate).await?;
            println!("{}", format!("Set {} = {}", key, value).green());
        }
        ConfigCommands::Show => {
            println!("{}", format!("Config file: {:?}", manager.path()).cyan().bold());
            println!("{}", serde_json::to_string_pretty(manager.config())?);
        }
    }
    Ok(())
}
