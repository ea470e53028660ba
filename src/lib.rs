//! SWEEPER — locked-token watcher and sweeper
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod error;
pub mod types;
pub mod ledger;
pub mod pricing;
pub mod events;
pub mod storage;
pub mod engine;
pub mod dashboard;
