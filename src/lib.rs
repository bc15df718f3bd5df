//! onionlink library crate
//!
//! Launches a bundled Tor daemon, drives it over the control protocol, and
//! keeps a v3 onion service published with its identity persisted locally.
//!
//! # Modules
//!
//! - [`config`] - Configuration loading and validation
//! - [`crypto`] - Ed25519 service identity and v3 address derivation
//! - [`control`] - Control-port transport, commands, connection state machine
//! - [`process`] - Bundled tor child supervision
//! - [`service`] - Hidden-service identity, targets, publication status
//! - [`manager`] - Top-level facade, event bus, persistence
//! - [`friends`] - Friend-server polling worker
//! - [`util`] - Time, randomization, byte-stream helpers

#![allow(dead_code)] // Public API surface exceeds what the binary exercises
#![allow(clippy::uninlined_format_args)] // Format string style preference
#![allow(clippy::new_without_default)] // Explicit new() is fine

pub mod config;
pub mod control;
pub mod crypto;
pub mod error;
pub mod friends;
pub mod logging;
pub mod manager;
pub mod process;
pub mod service;
pub mod util;

pub use error::{Error, Result};
pub use manager::{TorManager, TorManagerEvent};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
