//! Key derivation and handshake digests
//!
//! The session key is a SHA-256 digest of the handshake password
//! concatenated with the encryption password. It both authenticates the
//! challenge/response handshake and keys the packet cipher.

use super::KEY_LEN;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ring::digest::{digest, SHA256};

/// Derive the session key from `pass ‖ enc_pass`.
pub fn derive_session_key(pass: &str, enc_pass: &str) -> [u8; KEY_LEN] {
    let mut input = Vec::with_capacity(pass.len() + enc_pass.len());
    input.extend_from_slice(pass.as_bytes());
    input.extend_from_slice(enc_pass.as_bytes());

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(digest(&SHA256, &input).as_ref());
    key
}

/// Digest proving possession of the session key for a given challenge.
///
/// Returned base64-encoded, ready for the handshake JSON.
pub fn auth_digest(challenge: &str, session_key: &[u8; KEY_LEN]) -> String {
    let mut input = Vec::with_capacity(challenge.len() + KEY_LEN);
    input.extend_from_slice(challenge.as_bytes());
    input.extend_from_slice(session_key);

    BASE64.encode(digest(&SHA256, &input).as_ref())
}

/// Generate a random base64 challenge string.
pub fn new_challenge() -> String {
    let mut raw = [0u8; 16];
    super::random_bytes(&mut raw);
    BASE64.encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_deterministic() {
        let key1 = derive_session_key("pass", "encpass");
        let key2 = derive_session_key("pass", "encpass");
        assert_eq!(key1, key2);

        // Either password changing changes the key.
        assert_ne!(key1, derive_session_key("other", "encpass"));
        assert_ne!(key1, derive_session_key("pass", "other"));
    }

    #[test]
    fn test_auth_digest() {
        let key = derive_session_key("pass", "");
        let digest1 = auth_digest("challenge", &key);
        let digest2 = auth_digest("challenge", &key);
        assert_eq!(digest1, digest2);

        assert_ne!(digest1, auth_digest("other-challenge", &key));
        assert_ne!(digest1, auth_digest("challenge", &derive_session_key("x", "")));
    }

    #[test]
    fn test_new_challenge_unique() {
        assert_ne!(new_challenge(), new_challenge());
    }
}
