//! LooseLine: wallet ledger and bet settlement for a sports betting service.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod api;
pub mod clock;
pub mod config;
pub mod engine;
pub mod events;
pub mod storage;
pub mod types;
