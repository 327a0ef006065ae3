//! syncbox library
//!
//! Per-user file synchronization over a small binary TCP protocol: a daemon
//! keeping one flat directory per account, and a client that reconciles a
//! local directory with it by content checksum.

pub mod auth;
pub mod checksum;
pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod fs_enum;
pub mod inventory;
pub mod logger;
pub mod progress;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod sync;
