//! # Queue Viewer CLI
//!
//! Inspects an agent storage directory without starting an agent.
//!
//! Usage:
//!   queue_viewer stats
//!   queue_viewer list [--prefix request] [--limit N]
//!   queue_viewer show <prefix> <id>
//!   queue_viewer requests [--limit N]

use clap::{Parser, Subcommand};
use pulse::consent::ConsentRecord;
use pulse::crash::CrashReport;
use pulse::identity::IdentityRecord;
use pulse::remote_config::RemoteConfigStore;
use pulse::request::Request;
use pulse::session::Session;
use pulse::storage::{BlobStore, Storable};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "queue_viewer")]
#[command(about = "Inspect the records a Pulse agent keeps on disk", long_about = None)]
struct Cli {
    /// Path to the storage directory
    #[arg(short, long, default_value = "pulse-data")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record counts per prefix
    Stats,

    /// List record names, oldest first
    List {
        /// Only records with this prefix
        #[arg(short, long)]
        prefix: Option<String>,

        /// Maximum number of records to show
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Decode and print one record
    Show {
        /// Record prefix (request, session, crash, consent, config, remote_config)
        prefix: String,

        /// Record id
        id: i64,
    },

    /// Print queued requests as they would be sent
    Requests {
        /// Maximum number of requests to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

fn main() -> Result<(), String> {
    let cli = Cli::parse();
    let store = BlobStore::open(&cli.dir).map_err(|e| e.to_string())?;

    match cli.command {
        Commands::Stats => {
            let stats = store.stats().map_err(|e| e.to_string())?;
            println!("📊 Storage Statistics ({})\n", cli.dir.display());
            println!("Records:  {}", stats.records);
            println!("Bytes:    {}", stats.bytes);
            for (prefix, count) in &stats.by_prefix {
                println!("  {:<10} {}", prefix, count);
            }
        }

        Commands::List { prefix, limit } => {
            let mut entries = store.entries().map_err(|e| e.to_string())?;
            if let Some(prefix) = &prefix {
                entries.retain(|(p, _)| p == prefix);
            }
            entries.sort_by_key(|(_, id)| *id);
            println!("📋 {} records:\n", entries.len());
            for (prefix, id) in entries.into_iter().take(limit) {
                println!("{}_{}", prefix, id);
            }
        }

        Commands::Show { prefix, id } => {
            let Some(data) = store.read(&prefix, id).map_err(|e| e.to_string())? else {
                println!("❌ Record '{}_{}' not found", prefix, id);
                return Ok(());
            };
            print_record(&prefix, id, &data)?;
        }

        Commands::Requests { limit } => {
            let ids = store.ids(Request::PREFIX).map_err(|e| e.to_string())?;
            println!("📤 {} queued requests:\n", ids.len());
            for id in ids.into_iter().take(limit) {
                let Some(data) = store.read(Request::PREFIX, id).map_err(|e| e.to_string())?
                else {
                    continue;
                };
                match Request::restore(id, &data) {
                    Ok(request) => print_request_summary(&request),
                    Err(e) => println!("⚠️  request_{} unreadable: {}\n", id, e),
                }
            }
        }
    }

    Ok(())
}

fn print_request_summary(request: &Request) {
    let feature = request
        .feature()
        .map(|f| f.name().to_string())
        .unwrap_or_else(|| "-".to_string());
    let attachment = request
        .attachment()
        .map(|a| format!(" | +{} ({} bytes)", a.name, a.data.len()))
        .unwrap_or_default();
    println!("{} | {}{}", request.id(), feature, attachment);
    println!("   ↳ {}", request.params.to_query());
    println!();
}

fn print_record(prefix: &str, id: i64, data: &[u8]) -> Result<(), String> {
    println!("═══════════════════════════════════════════════════════════");
    println!("{}_{} ({} bytes)", prefix, id, data.len());
    println!("═══════════════════════════════════════════════════════════\n");

    match prefix {
        p if p == Request::PREFIX => {
            let request = Request::restore(id, data).map_err(|e| e.to_string())?;
            print_request_summary(&request);
        }
        p if p == Session::PREFIX => {
            let session = Session::restore(id, data).map_err(|e| e.to_string())?;
            println!("State:        {:?}", session.state());
            println!("Began:        {:?}", session.began());
            println!("Updated:      {:?}", session.updated());
            println!("Ended:        {:?}", session.ended());
            println!("Device id:    {}", session.device_id().unwrap_or("-"));
            println!("Pending:      {} events", session.pending_events().len());
            for event in session.pending_events() {
                println!("   {}", event);
            }
        }
        p if p == CrashReport::PREFIX => {
            let report = CrashReport::restore(id, data).map_err(|e| e.to_string())?;
            let pretty = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
            println!("{}", pretty);
        }
        p if p == ConsentRecord::PREFIX => {
            let record = ConsentRecord::restore(id, data).map_err(|e| e.to_string())?;
            for (feature, granted) in &record.flags {
                println!("{:<14} {}", feature.name(), if *granted { "✅" } else { "🚫" });
            }
        }
        p if p == IdentityRecord::PREFIX => {
            let record = IdentityRecord::restore(id, data).map_err(|e| e.to_string())?;
            println!("{:#?}", record);
        }
        p if p == RemoteConfigStore::PREFIX => {
            let store = RemoteConfigStore::restore(id, data).map_err(|e| e.to_string())?;
            for (key, value) in &store.values {
                println!("{:<20} {}", key, value);
            }
        }
        _ => println!("{}", String::from_utf8_lossy(data)),
    }

    println!("\n═══════════════════════════════════════════════════════════\n");
    Ok(())
}
