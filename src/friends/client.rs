//! Friend-server client contract and SOCKS5 plumbing
//!
//! The wire protocol spoken to the friend server belongs to the host
//! application; the requester only needs the blocking contract below plus
//! a way to reach the server through Tor's SOCKS proxy.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Blocking friend-server client. Implementations are driven from the
/// requester's worker thread, never from the manager loop.
pub trait FsClient: Send + Sync {
    /// Ask the server for up to `count` peer invitations, returning each
    /// short-invite certificate with whether our own invite was accepted.
    fn request_friends(
        &self,
        server_address: &str,
        server_port: u16,
        proxy_address: &str,
        proxy_port: u16,
        count: u32,
        passphrase: Option<&str>,
    ) -> io::Result<HashMap<String, bool>>;

    /// Probe whether the server is reachable through the proxy.
    fn check_connection(
        &self,
        server_address: &str,
        server_port: u16,
        proxy_address: &str,
        proxy_port: u16,
        timeout: Duration,
    ) -> bool {
        socks5_connect(proxy_address, proxy_port, server_address, server_port, timeout).is_ok()
    }
}

/// Open a TCP stream to `target` through a SOCKS5 proxy, domain-name
/// addressing, no proxy auth.
pub fn socks5_connect(
    proxy_address: &str,
    proxy_port: u16,
    target_address: &str,
    target_port: u16,
    timeout: Duration,
) -> io::Result<TcpStream> {
    let proxy = (proxy_address, proxy_port);
    let addr = std::net::ToSocketAddrs::to_socket_addrs(&proxy)?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "proxy address unresolvable"))?;
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    // Greeting: version 5, one method, no auth.
    stream.write_all(&[0x05, 0x01, 0x00])?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method)?;
    if method != [0x05, 0x00] {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "proxy rejected our authentication methods",
        ));
    }

    if target_address.len() > 255 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "target hostname too long for SOCKS5",
        ));
    }

    // CONNECT, domain-name address type.
    let mut request = vec![0x05, 0x01, 0x00, 0x03, target_address.len() as u8];
    request.extend_from_slice(target_address.as_bytes());
    request.extend_from_slice(&target_port.to_be_bytes());
    stream.write_all(&request)?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    if header[1] != 0x00 {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("SOCKS5 connect failed: {}", socks5_error(header[1])),
        ));
    }

    // Drain the bound address so the caller starts at the payload.
    let skip = match header[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            len[0] as usize
        },
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown SOCKS5 address type {}", other),
            ))
        },
    };
    let mut rest = vec![0u8; skip + 2];
    stream.read_exact(&mut rest)?;

    Ok(stream)
}

fn socks5_error(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Scripted client: hands out a fixed invite batch per campaign and
    /// records how often it was asked.
    pub struct ScriptedClient {
        pub batches: Mutex<Vec<HashMap<String, bool>>>,
        pub campaigns: Mutex<u32>,
    }

    impl ScriptedClient {
        pub fn new(batches: Vec<HashMap<String, bool>>) -> Self {
            Self {
                batches: Mutex::new(batches),
                campaigns: Mutex::new(0),
            }
        }
    }

    impl FsClient for ScriptedClient {
        fn request_friends(
            &self,
            _server_address: &str,
            _server_port: u16,
            _proxy_address: &str,
            _proxy_port: u16,
            _count: u32,
            _passphrase: Option<&str>,
        ) -> io::Result<HashMap<String, bool>> {
            *self.campaigns.lock().unwrap() += 1;
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                Ok(HashMap::new())
            } else {
                Ok(batches.remove(0))
            }
        }
    }
}
