//! Podcast Host Service
//!
//! Configuration and session wiring for a single host process. The `host`
//! binary is a thin wrapper around this library.

pub mod config;
pub mod session;
