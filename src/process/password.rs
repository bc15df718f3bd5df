//! HashedControlPassword computation
//!
//! Tor hashes control passwords with the OpenPGP iterated S2K scheme
//! (RFC 4880 §3.7.1.3) using SHA-1 and a fixed iteration specifier, and
//! expects the result as `16:<hex(salt || specifier || digest)>`.

use data_encoding::{HEXLOWER, HEXUPPER};
use sha1::{Digest, Sha1};

/// Iteration count specifier Tor always uses: (16 + 0) << (6 + 6) bytes.
const S2K_SPECIFIER: u8 = 0x60;

/// Random password handed to the child on its command line, hex-encoded so
/// it survives quoting anywhere.
pub fn generate_control_password() -> String {
    HEXLOWER.encode(&crate::util::rand::random_bytes::<16>())
}

/// The `HashedControlPassword` value for `password`.
pub fn hashed_control_password(password: &str) -> String {
    hashed_control_password_with_salt(password, &crate::util::rand::random_bytes::<8>())
}

pub fn hashed_control_password_with_salt(password: &str, salt: &[u8; 8]) -> String {
    let digest = s2k_sha1(password.as_bytes(), salt, S2K_SPECIFIER);

    let mut specifier = Vec::with_capacity(8 + 1 + 20);
    specifier.extend_from_slice(salt);
    specifier.push(S2K_SPECIFIER);
    specifier.extend_from_slice(&digest);

    format!("16:{}", HEXUPPER.encode(&specifier))
}

/// Iterated-salted SHA-1: hash `salt || secret` repeatedly until `count`
/// bytes have been consumed, truncating the final repetition.
fn s2k_sha1(secret: &[u8], salt: &[u8; 8], specifier: u8) -> [u8; 20] {
    let count = (16 + (specifier & 15) as usize) << ((specifier >> 4) + 6);

    let mut block = Vec::with_capacity(salt.len() + secret.len());
    block.extend_from_slice(salt);
    block.extend_from_slice(secret);

    let mut hasher = Sha1::new();
    let mut remaining = count;
    while remaining > 0 {
        if remaining >= block.len() {
            hasher.update(&block);
            remaining -= block.len();
        } else {
            hasher.update(&block[..remaining]);
            remaining = 0;
        }
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_shape() {
        let hash = hashed_control_password_with_salt("secret", &[1, 2, 3, 4, 5, 6, 7, 8]);
        // "16:" + hex(8-byte salt + specifier + 20-byte digest)
        assert!(hash.starts_with("16:"));
        assert_eq!(hash.len(), 3 + 2 * 29);
        assert!(hash[3..].chars().all(|c| c.is_ascii_hexdigit()));
        assert!(hash[3..].starts_with("010203040506070860"));
    }

    #[test]
    fn deterministic_per_salt() {
        let salt_a = [0u8; 8];
        let salt_b = [1u8; 8];
        assert_eq!(
            hashed_control_password_with_salt("pw", &salt_a),
            hashed_control_password_with_salt("pw", &salt_a)
        );
        assert_ne!(
            hashed_control_password_with_salt("pw", &salt_a),
            hashed_control_password_with_salt("pw", &salt_b)
        );
        assert_ne!(
            hashed_control_password_with_salt("pw", &salt_a),
            hashed_control_password_with_salt("other", &salt_a)
        );
    }

    #[test]
    fn iteration_count_is_tors() {
        // specifier 0x60 must hash 65536 bytes
        let c = S2K_SPECIFIER;
        let count = (16 + (c & 15) as usize) << ((c >> 4) + 6);
        assert_eq!(count, 65536);
    }

    #[test]
    fn generated_passwords_are_hex_and_unique() {
        let a = generate_control_password();
        let b = generate_control_password();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
