//! # Pulse Agent Entry Point
//!
//! Runs the telemetry agent as a standalone process: loads the
//! configuration, keeps one foreground session open and drains the request
//! queue until interrupted.

use clap::Parser;
use pulse::{AgentBuilder, AgentConfig, HostLifecycle};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pulse-agent")]
#[command(about = "Client telemetry agent with a crash-safe request queue", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the configured storage directory
    #[arg(short, long)]
    storage_dir: Option<PathBuf>,

    /// Overrides the configured collector URL
    #[arg(long)]
    server_url: Option<String>,

    /// Seconds between status lines
    #[arg(long, default_value_t = 30)]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    println!("=================================================");
    println!("  Pulse Agent - Client Telemetry Queue  ");
    println!("=================================================");
    println!();

    let mut config = match &cli.config {
        Some(path) => AgentConfig::from_json_file(path)?,
        None => AgentConfig::default(),
    }
    .apply_env();
    if let Some(dir) = cli.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(url) = cli.server_url {
        config.server_url = url;
    }

    println!("Starting agent...");
    let agent = match AgentBuilder::new(config).build().await {
        Ok(agent) => agent,
        Err(e) => {
            eprintln!("✗ Failed to start agent: {}", e);
            return Err(e.into());
        }
    };
    println!("✓ Agent started");
    println!("  - Collector: {}", agent.config().base_url());
    println!("  - Storage: {}", agent.config().storage_dir.display());
    println!(
        "  - Device id: {}",
        agent.device_id().unwrap_or_else(|| "<pending>".to_string())
    );
    println!();

    let stats = agent.storage_stats().await;
    println!("Stored Records:");
    println!("  - Total: {} ({} bytes)", stats.records, stats.bytes);
    for (prefix, count) in &stats.by_prefix {
        println!("  - {:<10} {}", prefix, count);
    }
    println!();

    agent.on_foreground_start().await?;

    let mut status = tokio::time::interval(Duration::from_secs(cli.stats_interval.max(1)));
    status.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = status.tick() => {
                let net = agent.network_stats();
                println!(
                    "queue={} delivered={} rejected={} retried={}",
                    agent.queue_len().await,
                    net.delivered,
                    net.rejected,
                    net.retried
                );
            }
        }
    }

    println!();
    println!("Interrupted, flushing...");
    agent.on_foreground_stop().await?;
    if let Err(e) = agent.flush().await {
        eprintln!("✗ Final flush failed: {}", e);
    }
    let left = agent.queue_len().await;
    agent.stop(false).await?;

    println!("=================================================");
    println!("  Agent Shut Down ({} requests left queued)", left);
    println!("=================================================");

    Ok(())
}
