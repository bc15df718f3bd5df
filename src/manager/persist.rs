//! On-disk persistence for the hidden-service identity
//!
//! The key is the node's address; a torn write would cost it permanently.
//! Writes go through a temporary file in the same directory, fsync, then
//! rename, so a crash leaves either the old or the new file intact.

use crate::crypto::OnionKey;
use crate::error::{Error, Result};
use std::io::Write;
use std::path::Path;

pub const PRIVATE_KEY_FILE: &str = "private_key";
pub const HOSTNAME_FILE: &str = "hostname";

/// Write `contents` to `path` atomically.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// Persist the key as a single `ED25519-V3:<base64>` line.
pub fn save_private_key(hs_dir: &Path, key: &OnionKey) -> Result<()> {
    let path = hs_dir.join(PRIVATE_KEY_FILE);
    let line = format!("{}\n", key.to_key_blob());
    write_atomic(&path, line.as_bytes())
        .map_err(|e| Error::DataDirUnwritable(path, e))
}

/// Persist `<serviceid>.onion`, LF-terminated.
pub fn save_hostname(hs_dir: &Path, hostname: &str) -> Result<()> {
    let path = hs_dir.join(HOSTNAME_FILE);
    let line = format!("{}\n", hostname);
    write_atomic(&path, line.as_bytes())
        .map_err(|e| Error::DataDirUnwritable(path, e))
}

/// Load a previously persisted key, if any.
pub fn load_private_key(hs_dir: &Path) -> Option<Result<OnionKey>> {
    let path = hs_dir.join(PRIVATE_KEY_FILE);
    if !path.exists() {
        return None;
    }
    Some(OnionKey::from_file(&path))
}
