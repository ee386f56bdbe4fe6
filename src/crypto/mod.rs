//! Cryptographic primitives for the tunnel
//!
//! This module provides:
//! - SHA-256 key derivation from the shared passwords
//! - Challenge/response digests for the handshake
//! - The counted packet cipher with its re-key barrier
//! - Secure random number generation

pub mod cipher;
pub mod kdf;

pub use cipher::{PacketCipher, ENC_ALWAYS, ENC_NEVER};
pub use kdf::{auth_digest, derive_session_key};

/// Length of the derived session key in bytes
pub const KEY_LEN: usize = 32;

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("Failed to generate random bytes");
}
