use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::interval;

use crate::{
    config::{ALLOCATED_LABEL, SANDBOX_NAMESPACE_PREFIX},
    orchestrator::Orchestrator,
};

use super::SandboxManager;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How often the idle reaper scans sandbox namespaces.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxManager {
    /// The idle-sandbox reaper loop: one scan every 30 seconds. Errors are
    /// swallowed; the next tick retries.
    pub async fn run_idle_reaper(&self) {
        let mut tick = interval(REAP_INTERVAL);
        tick.tick().await;
        loop {
            tick.tick().await;
            self.reap_once().await;
        }
    }

    /// Deletes every sandbox namespace (except those explicitly labeled
    /// `sbx.allocated=false`) whose last exec, or creation time when it never
    /// ran anything, is older than the idle TTL.
    pub(super) async fn reap_once(&self) {
        let ttl = self.config.idle_ttl();
        if ttl.is_zero() {
            return;
        }
        let ttl = match chrono::Duration::from_std(ttl) {
            Result::Ok(ttl) => ttl,
            Err(_) => return,
        };
        let namespaces = match self.orchestrator.list_namespaces(None).await {
            Result::Ok(namespaces) => namespaces,
            Err(err) => {
                tracing::warn!("idle reaper list: {}", err);
                return;
            }
        };
        let now = Utc::now();
        for ns in namespaces {
            if !ns.name.starts_with(SANDBOX_NAMESPACE_PREFIX) {
                continue;
            }
            if ns.label(ALLOCATED_LABEL) == Some("false") {
                continue;
            }
            let last = match ns.last_exec_unix() {
                Some(unix) if unix != 0 => DateTime::from_timestamp(unix, 0),
                _ => None,
            };
            let last = match last.or(ns.created_at) {
                Some(last) => last,
                None => continue,
            };
            let idle = now - last;
            if idle > ttl {
                if self.orchestrator.delete_namespace(&ns.name).await.is_ok() {
                    tracing::info!("reaped sandbox namespace={} idle={}", ns.name, idle);
                }
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
