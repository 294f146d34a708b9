//! `sbxapi` holds the wire types shared by the sbx control plane, the
//! in-pod stream forwarder, and API clients: request/response bodies for the
//! sandbox and exec endpoints, and the exec event frames carried over the
//! stream and ingest WebSockets.

#![warn(missing_docs)]

mod event;
mod types;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use event::*;
pub use types::*;
