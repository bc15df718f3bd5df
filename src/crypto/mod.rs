//! Cryptographic primitives for v3 Onion Services
//!
//! Handles the long-lived ed25519 service identity. All crypto operations
//! are isolated here - no IO beyond loading the key file.

#![allow(unused_imports)] // Re-exports for public API

pub mod keys;

pub use keys::{KeyType, OnionKey, KEY_BLOB_HEADER};
