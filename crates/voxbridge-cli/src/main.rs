use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use voxbridge_core::config::{Config, GatewayConfig, LoggingConfig};
use voxbridge_gateway::GatewayState;
use voxbridge_gateway::relay::{spawn_presence_relay, spawn_speaking_broadcast};
use voxbridge_voice::discord::DiscordClient;
use voxbridge_voice::{JoinOutcome, VoiceLinkManager};

/// How long auto-join waits for the guild cache to fill.
const READY_WAIT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "voxbridge",
    about = "Discord voice presence and WebRTC signaling bridge for stream overlays",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to Discord and serve the overlay gateway (default)
    Serve {
        /// Port to listen on (default: 3001)
        #[arg(long, env = "PORT")]
        port: Option<u16>,

        /// Address to bind (default: 0.0.0.0)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration for problems
    Validate,
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose {
            "debug".to_string()
        } else {
            logging.level.clone().unwrap_or_else(|| "info".to_string())
        };
        let directives = std::iter::once(level)
            .chain(logging.filters.iter().cloned())
            .collect::<Vec<_>>()
            .join(",");
        EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (logging.format.as_str(), logging.output.as_str()) {
        ("json", "stdout") => builder.json().with_writer(std::io::stdout).init(),
        ("json", _) => builder.json().with_writer(std::io::stderr).init(),
        (_, "stdout") => builder.with_writer(std::io::stdout).init(),
        _ => builder.with_writer(std::io::stderr).init(),
    }
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        error!(%location, "Panic: {panic_info}");
    }));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);

    let config = Config::load(&config_path)?;

    init_logging(&config.logging(), cli.verbose);
    install_panic_hook();

    match cli.command.unwrap_or(Commands::Serve {
        port: None,
        bind: None,
    }) {
        Commands::Serve { port, bind } => serve(config, port, bind).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    std::process::exit(1);
                }
                println!("Config OK: {}", config_path.display());
            }
        },
    }

    Ok(())
}

async fn serve(mut config: Config, port: Option<u16>, bind: Option<String>) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for w in &warnings {
        warn!("{w}");
    }
    if !errors.is_empty() {
        for e in &errors {
            error!("{e}");
        }
        std::process::exit(1);
    }

    let discord = config.discord();
    let Some(token) = discord.resolve_bot_token() else {
        error!("No Discord bot token configured, refusing to start");
        std::process::exit(1);
    };

    let port = port.unwrap_or_else(|| config.gateway_port());
    if bind.is_some() || config.gateway.is_none() {
        config.gateway = Some(GatewayConfig {
            port,
            bind: bind.or_else(|| config.gateway.as_ref().and_then(|g| g.bind.clone())),
        });
    }
    let config = Arc::new(config);

    info!("Starting VoxBridge v{} on port {port}", env!("CARGO_PKG_VERSION"));

    let client = DiscordClient::start(token, &discord);
    let voice = Arc::new(VoiceLinkManager::new(
        client.platform(),
        client.connector(),
        config.voice(),
    ));

    let state = GatewayState::new(config.clone(), voice.clone());
    #[cfg(feature = "metrics")]
    let state = match voxbridge_gateway::metrics::install_prometheus_recorder() {
        Ok(handle) => state.with_metrics(handle),
        Err(e) => {
            warn!(error = %e, "Failed to install metrics recorder");
            state
        }
    };
    let state = Arc::new(state);

    let cancel = CancellationToken::new();
    spawn_presence_relay(state.clone(), cancel.clone());
    spawn_speaking_broadcast(state.clone(), cancel.clone());

    if let Some(auto_join) = discord.auto_join.clone() {
        let voice = voice.clone();
        let cache = client.platform();
        tokio::spawn(async move {
            if !cache.wait_ready(READY_WAIT).await {
                warn!("Guild cache not ready, attempting auto-join anyway");
            }
            let channel = auto_join.channel_ref();
            match voice.join_channel(channel.clone()).await {
                Ok(JoinOutcome::Joined(_)) => info!(%channel, "Auto-joined voice channel"),
                Ok(JoinOutcome::AlreadyConnected(_)) => {
                    info!(%channel, "Already in auto-join channel")
                }
                Err(e) => warn!(%channel, kind = e.kind(), error = %e, "Auto-join failed"),
            }
        });
    }

    let result = voxbridge_gateway::start_gateway(state, port).await;

    info!("Shutting down");
    voice.leave_all();
    cancel.cancel();
    client.shutdown().await;

    result
}
