//! Request serialization and reply parsing for the control commands we speak

#![allow(unused_imports)] // Re-exports for public API

pub mod auth;
pub mod conf;
pub mod onion;
pub mod protocolinfo;

pub use auth::{choose_method, safecookie_client_hash, safecookie_server_hash, AuthChallenge, AuthMethod, Authenticate};
pub use conf::{ConfValues, GetConf, SetConf, SetEvents, TakeOwnership};
pub use onion::{AddOnion, AddOnionReply};
pub use protocolinfo::{ProtocolInfo, ProtocolInfoReply};
