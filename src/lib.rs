//! Core library for the dex-collector project.
//!
//! Polls constant-product and concentrated-liquidity pools through a pool
//! of RPC endpoints, normalises their state into prices and depth curves,
//! and hands the records to a persistence sink in batches.

pub mod cache;
pub mod config;
pub mod depth;
pub mod dex;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod rpc;
pub mod store;
pub mod utils;
