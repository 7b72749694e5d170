use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use opcpool::cli::{cmd_connect, cmd_warm, cmd_watch, OutputFormat};
use opcpool::{config, Core};

#[derive(Parser)]
#[command(name = "opcpool")]
#[command(version, about = "Connection pool for industrial protocol endpoints", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (falls back to OPCPOOL_* environment variables)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Print metrics and events as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the configured minimum of connections and print metrics
    Warm,

    /// Connect to a single endpoint
    Connect {
        /// Endpoint URL (opc.tcp://host:port)
        endpoint: String,
    },

    /// Warm the pool and report metrics and lifecycle events until Ctrl-C
    Watch {
        /// Seconds between metric reports
        #[arg(long, default_value = "10")]
        interval: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Health checks and probes run beside the command, so always multi-threaded
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref())?;
    let core = Core::new(config)?;
    let format = OutputFormat::from_json_flag(cli.json);

    match cli.command {
        Commands::Warm => cmd_warm(&core, format).await?,
        Commands::Connect { endpoint } => cmd_connect(&core, &endpoint, format).await?,
        Commands::Watch { interval } => cmd_watch(&core, interval, format).await?,
    }

    Ok(())
}
