//! Configuration loading and validation
//!
//! Handles TOML configuration parsing with strict validation.
//! No runtime mutation - configuration is immutable after load.

#![allow(unused_imports)] // Re-exports for public API

pub mod file;
mod validation;

pub use file::{load_config, load_from_path};
pub use validation::validate;

use serde::Deserialize;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub tor: TorConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub friends: FriendsConfig,
}

/// Bundled Tor daemon settings
#[derive(Debug, Clone, Deserialize)]
pub struct TorConfig {
    /// Explicit tor executable; searched for when absent.
    pub executable: Option<PathBuf>,
    /// Where the daemon keeps its state (also holds torrc, default_torrc,
    /// control_port).
    pub data_dir: PathBuf,
    /// Where private_key and hostname are persisted.
    pub hidden_service_dir: PathBuf,
}

/// The single hidden service and its local target
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Port exposed on the onion address
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    /// Local address incoming connections are handed to
    #[serde(default = "default_target_address")]
    pub target_address: String,
    #[serde(default = "default_target_port")]
    pub target_port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_port: default_service_port(),
            target_address: default_target_address(),
            target_port: default_target_port(),
        }
    }
}

fn default_service_port() -> u16 {
    9878
}
fn default_target_address() -> String {
    "127.0.0.1".to_string()
}
fn default_target_port() -> u16 {
    7934
}

/// Friend-server polling
#[derive(Debug, Clone, Deserialize)]
pub struct FriendsConfig {
    /// Onion address of the friend server; polling is disabled when unset.
    pub server_address: Option<String>,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// SOCKS proxy; normally the bundled tor's own listener.
    #[serde(default = "default_proxy_address")]
    pub proxy_address: String,
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    /// How many peers we are aiming for.
    #[serde(default = "default_wanted_friends")]
    pub wanted_friends: u32,
}

impl Default for FriendsConfig {
    fn default() -> Self {
        Self {
            server_address: None,
            server_port: default_server_port(),
            proxy_address: default_proxy_address(),
            proxy_port: default_proxy_port(),
            wanted_friends: default_wanted_friends(),
        }
    }
}

fn default_server_port() -> u16 {
    2017
}
fn default_proxy_address() -> String {
    "127.0.0.1".to_string()
}
fn default_proxy_port() -> u16 {
    9050
}
fn default_wanted_friends() -> u32 {
    10
}
