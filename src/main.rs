//! edge-tunnel - CLI entry point

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use edge_tunnel::{Config, Gateway, VERSION};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "edge-tunnel")]
#[command(version = VERSION)]
#[command(about = "WebSocket tunnel gateway")]
struct Args {
    /// Path to configuration file; built-in defaults when omitted
    #[arg(short = 'c', short_alias = 'f', long = "config", env = "EDGE_TUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short = 'l', long = "listen")]
    listen: Option<String>,

    /// User UUID (overrides config and environment)
    #[arg(long = "uuid")]
    uuid: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long = "log-json")]
    log_json: bool,

    /// Write the effective configuration to this path and exit
    #[arg(long = "dump-config")]
    dump_config: Option<PathBuf>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Build optimized tokio runtime for low-latency proxy workloads
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .max_blocking_threads(32)
        .enable_all()
        // Reduce I/O polling overhead - check for new events every 61 ticks
        .event_interval(61)
        // Reduce cross-thread work stealing frequency for better cache locality
        .global_queue_interval(31)
        .thread_name("edge-tunnel-worker")
        .build()?;

    runtime.block_on(async_main(args))
}

async fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };
    config.apply_env();

    if let Some(listen) = &args.listen {
        config.listen = listen.clone();
    }
    if let Some(uuid) = &args.uuid {
        config.uuid = Some(uuid.clone());
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(format!("edge_tunnel={},tower_http=info", level)),
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .try_init()?;
    Ok(())
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    // Logging is configured from the file, so load errors go to stderr
    let config = match load_config(&args).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(config.log_level.as_deref().unwrap_or("info"), args.log_json)?;
    info!("edge-tunnel v{}", VERSION);
    if let Some(path) = &args.config {
        info!("Configuration loaded from: {}", path.display());
    }

    if let Some(path) = &args.dump_config {
        config.save(path).await?;
        info!("Configuration written to: {}", path.display());
        return Ok(());
    }

    // Test mode
    if args.test {
        config.credentials()?;
        info!("Configuration test passed");
        return Ok(());
    }

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to initialize gateway: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
