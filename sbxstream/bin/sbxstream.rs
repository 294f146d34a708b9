use std::path::PathBuf;

use clap::Parser;
use tokio_tungstenite::connect_async;
use tracing::Level;

use sbxstream::{stream_url, Forwarder, WsSink, DEFAULT_EVENTS_DIR, POLL_INTERVAL, RECONNECT_BACKOFF};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// sbxstream - forwards sandbox exec output to the control plane
#[derive(Debug, Parser)]
#[command(name = "sbxstream", author, about, version)]
struct SbxStreamArgs {
    /// The sandbox this pod belongs to (the namespace name)
    #[arg(long, env = "SBX_SANDBOX_ID")]
    sandbox_id: String,

    /// Base URL of the control plane
    #[arg(long, env = "SBX_STREAM_ENDPOINT")]
    endpoint: String,

    /// Directory holding the per-exec event files
    #[arg(long, env = "SBX_EVENTS_DIR", default_value = DEFAULT_EVENTS_DIR)]
    events_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = SbxStreamArgs::parse();
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let url = stream_url(&args.endpoint, &args.sandbox_id)?;
    if let Err(err) = tokio::fs::create_dir_all(&args.events_dir).await {
        tracing::warn!("create events dir {}: {}", args.events_dir.display(), err);
    }

    tracing::info!(
        "forwarding {} to {}",
        args.events_dir.display(),
        url.as_str()
    );

    // Per-exec offsets and flags live in the forwarder, outside the
    // connection loop, so reconnects never rewind or repeat events.
    let mut forwarder = Forwarder::new(args.sandbox_id.clone(), args.events_dir.clone());
    loop {
        match connect_async(url.as_str()).await {
            Result::Ok((ws, _)) => {
                tracing::debug!("connected to {}", url.as_str());
                let mut sink = WsSink::new(ws);
                loop {
                    if let Err(err) = forwarder.pump(&mut sink).await {
                        tracing::debug!("pump: {}", err);
                        break;
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
            Err(err) => {
                tracing::debug!("dial {}: {}", url.as_str(), err);
            }
        }
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}
