//! `sbxstream` is the in-pod sidecar agent of the sbx control plane.
//!
//! Execs dispatched in sidecar stream mode redirect their output into
//! append-only files under a shared events directory. This agent tails that
//! directory, turns file growth into exec events, and ships them to the
//! control plane's ingest WebSocket, reconnecting with backoff when the
//! connection drops.

#![warn(missing_docs)]

mod error;
mod forwarder;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use error::*;
pub use forwarder::*;
