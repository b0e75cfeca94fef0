//! Concurrent token-claim runner: an encrypted account queue, a per-account
//! claim pipeline with bounded retries, and batched delivery of per-account
//! reports.

pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod notify;
pub mod pipeline;
pub mod retry;
pub mod rpc;
pub mod scheduler;
pub mod swap;
pub mod wallet;

pub use error::{Error, Result};
