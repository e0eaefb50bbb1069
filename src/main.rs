//! `carbonlink`: query carbon-cache for cached datapoints of one metric.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use carbonlink_pool::{Carbonlink, CodecKind, Pool, PoolConfig, SingleLink};

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "carbonlink",
    version,
    about = "Fetch not-yet-persisted datapoints from carbon-cache"
)]
struct Cli {
    /// Full metric name (no globs)
    #[arg(long)]
    name: String,

    /// carbonlink address [default: 127.0.0.1:7002]
    #[arg(long, env = "CARBONLINK_ADDRESS")]
    host: Option<String>,

    /// Bucket width in seconds
    #[arg(long, default_value_t = 60)]
    step: i64,

    /// Number of pooled connections; 0 uses a single unpooled connection
    #[arg(long)]
    pool_size: Option<usize>,

    /// Read timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Payload codec: pickle (carbon-cache) or msgpack [default: pickle]
    #[arg(long, env = "CARBONLINK_CODEC")]
    codec: Option<CodecKind>,

    /// TOML config file; flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the result as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PoolConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => PoolConfig::from_env(),
    };
    if let Some(host) = &cli.host {
        config.address = host.clone();
    }
    if let Some(size) = cli.pool_size {
        config.size = size;
    }
    if let Some(ms) = cli.timeout_ms {
        config.timeout = Duration::from_millis(ms);
    }
    if let Some(codec) = cli.codec {
        config.codec = codec;
    }
    config.validate().context("invalid carbonlink settings")?;

    info!(
        addr = %config.address,
        metric = %cli.name,
        step = cli.step,
        codec = %config.codec,
        "Querying carbonlink"
    );

    let link: Box<dyn Carbonlink> = if config.size == 0 {
        Box::new(SingleLink::new(&config)?)
    } else {
        Box::new(Pool::new(&config)?)
    };
    link.start();
    let points = link.query(&cli.name, cli.step);
    link.close();

    if points.is_unavailable() {
        warn!(addr = %config.address, "carbonlink unavailable, no datapoints returned");
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&*points)?);
    } else {
        for (bucket, value) in &points.datapoints {
            println!("{bucket} {value}");
        }
    }
    Ok(())
}
