//! Shared state for the HTTP server.

use std::sync::Arc;

use getset::Getters;

use crate::{
    exec::ExecRegistry, management::SandboxManager, metrics::Metrics, stream::StreamHub,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// State shared across all request handlers.
#[derive(Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ServerState {
    /// The sandbox facade.
    manager: SandboxManager,

    /// The exec registry.
    registry: Arc<ExecRegistry>,

    /// The stream hub.
    hub: Arc<StreamHub>,

    /// The metric sink.
    metrics: Arc<Metrics>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ServerState {
    /// Bundles the shared components.
    pub fn new(
        manager: SandboxManager,
        registry: Arc<ExecRegistry>,
        hub: Arc<StreamHub>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            manager,
            registry,
            hub,
            metrics,
        }
    }
}
