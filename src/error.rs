//! Error taxonomy for the Tor subsystem.
//!
//! Transport-level failures (`ConnectionLost`, `ProtocolViolation`) tear the
//! control connection down; everything else is reported to the caller of the
//! operation that failed.

use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No tor executable on any search path.
    #[error("cannot find a tor executable")]
    ExecutableMissing,

    /// Data directory cannot be created or written.
    #[error("cannot write data location {0}: {1}")]
    DataDirUnwritable(PathBuf, #[source] io::Error),

    /// Child exited before becoming ready, or died after.
    #[error("tor process failed: {0}")]
    ProcessFailed(String),

    /// TCP connect to the control port failed after the process was ready.
    #[error("control port connection failed: {0}")]
    ControlConnectFailed(#[source] io::Error),

    /// No acceptable auth method, or authentication rejected.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Malformed reply, out-of-order reply, unexpected event payload.
    #[error("control protocol violation: {0}")]
    ProtocolViolation(String),

    /// Control socket closed mid-session.
    #[error("control connection lost")]
    ConnectionLost,

    /// ADD_ONION refused by Tor.
    #[error("hidden service publication refused: {0}")]
    ServicePublishFailed(String),

    /// private_key file unreadable or malformed.
    #[error("cannot load service key: {0}")]
    KeyLoadFailed(String),
}
