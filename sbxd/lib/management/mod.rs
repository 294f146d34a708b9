//! Sandbox lifecycle entry points used by the server handlers: create with
//! warm claim, status, listing, delete, exec dispatch, and the idle reaper.

mod reaper;
mod sandbox;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use sandbox::*;
