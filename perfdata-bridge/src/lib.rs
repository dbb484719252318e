//! Perfdata bridge
//!
//! Watches a Nagios perfdata spool directory and forwards every measure it
//! finds to a Gnocchi metric store, creating the resources the store does
//! not know yet.

pub mod batch;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod identity;
pub mod perfdata;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod service;
pub mod store;
pub mod units;

pub use config::BridgeConfig;
pub use service::BridgeService;
