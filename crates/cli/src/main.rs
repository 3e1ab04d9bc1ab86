mod config_commands;
mod demo_commands;

use std::path::{Path, PathBuf};

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use conveyor_config::ConveyorConfig;

#[derive(Parser)]
#[command(name = "conveyor", about = "Conveyor: message endpoint host")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file to use instead of searching the standard locations.
    #[arg(long, global = true, env = "CONVEYOR_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
    /// Run an order flow through an in-memory endpoint.
    Demo(demo_commands::DemoArgs),
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Load the explicit config file, or discover one.
pub(crate) fn load(path: Option<&Path>) -> anyhow::Result<ConveyorConfig> {
    match path {
        Some(path) => Ok(conveyor_config::load_config(path)?),
        None => Ok(conveyor_config::discover_and_load()),
    }
}

#[cfg(feature = "metrics")]
fn init_metrics(config: &ConveyorConfig) -> anyhow::Result<conveyor_metrics::MetricsHandle> {
    let mut global_labels: Vec<(String, String)> = config
        .metrics
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    global_labels.push(("endpoint".into(), config.endpoint.name.clone()));
    conveyor_metrics::init_metrics(conveyor_metrics::MetricsRecorderConfig {
        enabled: config.metrics.enabled,
        global_labels,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "conveyor starting");

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Config { action } => config_commands::handle_config(action, config_path),
        Commands::Demo(args) => {
            let config = load(config_path)?;
            #[cfg(feature = "metrics")]
            let metrics = init_metrics(&config)?;

            demo_commands::run_demo(args, config).await?;

            #[cfg(feature = "metrics")]
            {
                let rendered = metrics.render();
                if !rendered.is_empty() {
                    println!("\n{rendered}");
                }
            }
            Ok(())
        },
    }
}
