//! In-process pub/sub for exec events: a per-sandbox bounded ring buffer
//! with subscriber fan-out and hub-global sequence numbers.

mod hub;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use hub::*;
