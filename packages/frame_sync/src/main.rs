use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use frame_sync::SyncConfig;
use frame_sync::sim::{self, SimOptions};
use tracing::info;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "frame-sync-sim")]
#[command(about = "Run a sidebar and guest documents through a full annotation sync")]
struct Cli {
    /// Config file (defaults to ./frame-sync.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of guest documents
    #[arg(short, long, default_value = "3")]
    guests: usize,

    /// Number of annotations to load
    #[arg(short, long, default_value = "20")]
    annotations: usize,

    /// Seconds to wait for each step before giving up
    #[arg(long, default_value = "5")]
    step_timeout: u64,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "frame_sync=debug,frame_rpc=debug"
    } else {
        "frame_sync=info,frame_rpc=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config = SyncConfig::load(cli.config.as_deref())?;
    info!(
        guests = cli.guests,
        annotations = cli.annotations,
        call_timeout_ms = config.bridge.call_timeout.as_millis() as u64,
        "starting simulation"
    );

    let report = sim::run(SimOptions {
        guests: cli.guests,
        annotations: cli.annotations,
        config,
        step_timeout: Duration::from_secs(cli.step_timeout),
    })
    .await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("frames connected:  {}", report.frames_connected);
        println!("annotations:       {}", report.annotations);
        println!("in guests:         {}", report.in_frame);
        println!("anchored/orphaned: {}/{}", report.anchored, report.orphaned);
        match report.public_count {
            Some(count) => println!("public count:      {count}"),
            None => println!("public count:      (not reported)"),
        }
        println!("anchor updates:    {}", report.anchor_updates);
        if let Some(tag) = &report.deleted {
            println!("deleted:           {tag}");
        }
    }
    Ok(())
}
