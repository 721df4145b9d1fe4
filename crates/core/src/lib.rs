//! Core of the podcast host fleet: the shared coordination primitives, the
//! per-host turn-taking state machine, the audio activity gate, and the
//! producer that publishes episodes.

pub mod audit;
pub mod gate;
pub mod generator;
pub mod media;
pub mod persona;
pub mod producer;
pub mod store;
pub mod topic;
pub mod transcript;
pub mod turn;
