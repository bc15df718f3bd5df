//! AUTHENTICATE and the SAFECOOKIE challenge/response

use crate::control::command::{find_arg, quote_arg, split_quoted, Reply};
use crate::error::{Error, Result};
use data_encoding::{HEXLOWER, HEXUPPER_PERMISSIVE};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HMAC keys fixed by the control-port specification.
const CLIENT_HASH_KEY: &[u8] = b"Tor safe cookie authentication controller-to-server hash";
const SERVER_HASH_KEY: &[u8] = b"Tor safe cookie authentication server-to-controller hash";

/// Authentication methods Tor can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Null,
    HashedPassword,
    Cookie,
    SafeCookie,
}

impl AuthMethod {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "NULL" => Some(Self::Null),
            "HASHEDPASSWORD" => Some(Self::HashedPassword),
            "COOKIE" => Some(Self::Cookie),
            "SAFECOOKIE" => Some(Self::SafeCookie),
            _ => None,
        }
    }
}

/// Pick the strongest advertised method.
///
/// SAFECOOKIE never exposes the secret on the wire, HASHEDPASSWORD only
/// works when we launched the process ourselves, plain COOKIE leaks the
/// cookie to a MITM, NULL is a last resort.
pub fn choose_method(advertised: &[AuthMethod]) -> Option<AuthMethod> {
    const PREFERENCE: [AuthMethod; 4] = [
        AuthMethod::SafeCookie,
        AuthMethod::HashedPassword,
        AuthMethod::Cookie,
        AuthMethod::Null,
    ];
    PREFERENCE.into_iter().find(|m| advertised.contains(m))
}

/// AUTHCHALLENGE SAFECOOKIE request.
pub struct AuthChallenge {
    pub client_nonce: [u8; 32],
}

#[derive(Debug, Clone)]
pub struct AuthChallengeReply {
    pub server_hash: Vec<u8>,
    pub server_nonce: Vec<u8>,
}

impl AuthChallenge {
    pub fn new() -> Self {
        Self {
            client_nonce: crate::util::rand::random_bytes(),
        }
    }

    pub fn line(&self) -> String {
        format!(
            "AUTHCHALLENGE SAFECOOKIE {}",
            HEXLOWER.encode(&self.client_nonce)
        )
    }

    pub fn parse(reply: &Reply) -> Result<AuthChallengeReply> {
        reply.require_ok(Error::AuthFailed)?;

        let line = reply
            .lines
            .iter()
            .find(|l| l.text.starts_with("AUTHCHALLENGE "))
            .ok_or_else(|| Error::ProtocolViolation("AUTHCHALLENGE reply missing payload".into()))?;
        let tokens = split_quoted(&line.text);

        let decode = |key: &str| -> Result<Vec<u8>> {
            let hex = find_arg(&tokens, key)
                .ok_or_else(|| Error::ProtocolViolation(format!("AUTHCHALLENGE missing {}", key)))?;
            HEXUPPER_PERMISSIVE
                .decode(hex.as_bytes())
                .map_err(|_| Error::ProtocolViolation(format!("AUTHCHALLENGE bad hex in {}", key)))
        };

        Ok(AuthChallengeReply {
            server_hash: decode("SERVERHASH")?,
            server_nonce: decode("SERVERNONCE")?,
        })
    }
}

/// The hash we present to the server.
pub fn safecookie_client_hash(
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> [u8; 32] {
    safecookie_hmac(CLIENT_HASH_KEY, cookie, client_nonce, server_nonce)
}

/// The hash the server must have presented to us.
pub fn safecookie_server_hash(
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> [u8; 32] {
    safecookie_hmac(SERVER_HASH_KEY, cookie, client_nonce, server_nonce)
}

fn safecookie_hmac(key: &[u8], cookie: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(cookie);
    mac.update(client_nonce);
    mac.update(server_nonce);
    mac.finalize().into_bytes().into()
}

/// AUTHENTICATE request, one variant per negotiated method.
pub enum Authenticate {
    /// No credentials configured.
    Null,
    /// The original control password, quoted.
    Password(String),
    /// Contents of the cookie file, hex-encoded.
    Cookie(Vec<u8>),
    /// The SAFECOOKIE client hash, hex-encoded.
    SafeCookie([u8; 32]),
}

impl Authenticate {
    pub fn line(&self) -> String {
        match self {
            Self::Null => "AUTHENTICATE".to_string(),
            Self::Password(pw) => format!("AUTHENTICATE {}", quote_arg(pw)),
            Self::Cookie(cookie) => format!("AUTHENTICATE {}", HEXLOWER.encode(cookie)),
            Self::SafeCookie(hash) => format!("AUTHENTICATE {}", HEXLOWER.encode(hash)),
        }
    }

    pub fn parse(reply: &Reply) -> Result<()> {
        reply.require_ok(Error::AuthFailed)
    }
}
