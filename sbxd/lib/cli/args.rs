use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use tracing::Level;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// sbxd - control plane for short-lived command-execution sandboxes
#[derive(Debug, Parser)]
#[command(name = "sbxd", author, about, version)]
pub struct SbxdArgs {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub addr: SocketAddr,

    /// Path to the YAML configuration file (overrides SBXD_CONFIG)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SbxdArgs {
    /// Initialize logging system with INFO or DEBUG level based on verbose flag
    pub fn init_logging(&self) {
        let level = if self.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        };

        tracing_subscriber::fmt().with_max_level(level).init();
    }
}
