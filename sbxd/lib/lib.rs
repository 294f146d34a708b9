//! `sbxd` is the control plane for short-lived command-execution sandboxes
//! backed by a Kubernetes cluster.
//!
//! # Overview
//!
//! sbxd provisions sandboxes as namespaces holding a single `sandbox` pod,
//! keeps a warm pool of pre-provisioned instances sized to recent demand,
//! runs commands inside sandboxes synchronously or as detached async execs,
//! and fans exec output out to WebSocket subscribers in real time.
//!
//! # Architecture
//!
//! - **Orchestrator adapter**: capability surface over the cluster
//!   (namespaces, pods, PVCs, remote exec) with a typed failure taxonomy.
//! - **Stream hub**: per-sandbox ring buffer plus subscriber fan-out with
//!   snapshot-on-subscribe semantics and hub-global sequence numbers.
//! - **Exec registry**: per-exec state machines with cancellation, timeout
//!   classification, and bounded retention.
//! - **Warm pool**: a reconciliation loop that autosizes a set of ready
//!   namespaces and resolves concurrent claims optimistically.
//! - **Management**: the sandbox facade coordinating the above, plus the
//!   idle-sandbox reaper.
//! - **Server**: the HTTP/WebSocket API surface.
//!
//! # Modules
//!
//! - [`cli`] - Command-line interface and argument parsing
//! - [`config`] - Configuration loading, env overrides and defaults
//! - [`exec`] - Exec registry and runner
//! - [`management`] - Sandbox facade and idle reaper
//! - [`metrics`] - Counter/gauge sink exposed at `/metrics`
//! - [`orchestrator`] - Cluster capability surface and its kube-backed impl
//! - [`pool`] - Warm pool reconciler and claim path
//! - [`server`] - HTTP router, handlers and WebSocket endpoints
//! - [`stream`] - Per-sandbox event ring buffer and fan-out
//! - [`utils`] - Id generation, shell quoting, duration/age helpers

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cli;
pub mod config;
pub mod exec;
pub mod management;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod server;
pub mod stream;
pub mod utils;

pub use error::*;
