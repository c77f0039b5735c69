//! Logging setup shared by the `wt` binaries.
//!
//! The core library only emits `tracing` events; installing a subscriber is
//! left to whichever process embeds it.

pub mod logging;
