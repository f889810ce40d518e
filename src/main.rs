use std::path::PathBuf;

use clap::{Parser, Subcommand};
use frame_relay::OurResult;
use frame_relay::config::{Settings, SourceKind};
use frame_relay::service::FeedService;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "frame-relay")]
#[command(about = "Live camera feed relay with adaptive quality")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Configuration file (defaults to ~/.config/frame-relay.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start capturing and serving feeds
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to
        #[arg(long)]
        port: Option<u16>,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List configured sources
    Sources,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Write the effective configuration to the config file
    Save,
}

#[tokio::main]
async fn main() -> OurResult<()> {
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let default_level = if cli.debug || settings.debug {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if let Err(e) = tracing_subscriber::fmt().with_env_filter(filter).try_init() {
        eprintln!("Failed to set tracing subscriber: {e}");
    }
    debug!("Debug mode enabled");

    match cli.command {
        Commands::Serve { host, port } => serve(settings, host, port).await,
        Commands::Config { action } => handle_config_command(action, &settings, cli.config),
        Commands::Sources => {
            for source in &settings.sources {
                let kind = match &source.kind {
                    SourceKind::Usb { index, .. } => format!("usb camera {index}"),
                    SourceKind::Network { url } => format!("network camera {url}"),
                    SourceKind::TestPattern { width, height } => {
                        format!("test pattern {width}x{height}")
                    }
                };
                println!("{}: {kind}, every {:?}", source.id, source.capture_interval);
            }
            Ok(())
        }
    }
}

async fn serve(mut settings: Settings, host: Option<String>, port: Option<u16>) -> OurResult<()> {
    if let Some(host) = host {
        settings.host = host;
    }
    if let Some(port) = port {
        settings.port = port;
    }

    info!("Frame relay starting up");
    let service = FeedService::with_default_sources(settings)?;
    service.start().await?;
    for source_id in service.settings().source_ids() {
        info!(
            "Feed for {source_id}: {}",
            service.feed_url(&service.settings().host, source_id)
        );
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {e}");
    }
    info!("Shutting down");
    service.stop().await?;
    Ok(())
}

fn handle_config_command(
    action: ConfigAction,
    settings: &Settings,
    path: Option<PathBuf>,
) -> OurResult<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", serde_json::to_string_pretty(settings)?);
            Ok(())
        }
        ConfigAction::Save => {
            let path = path.unwrap_or_else(Settings::get_config_path);
            settings.save(&path)?;
            println!("Configuration written to {}", path.display());
            Ok(())
        }
    }
}
