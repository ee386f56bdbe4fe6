//! Counted packet cipher
//!
//! NORMAL payloads are run through a ChaCha20 keystream, one cipher instance
//! per transport connection. Every [`RESET_INTERVAL`] processed packets the
//! keystream is re-derived from the session key and the packet index (the
//! reset barrier), so both ends advance in lockstep and a replaced transport
//! connection restarts from a known state.
//!
//! The `enc_count` budget bounds how many packets on one connection are
//! transformed at all: -1 is unbounded, 0 disables the cipher, N leaves the
//! remainder of the connection in cleartext once spent. Both ends run the
//! same budget, so they fall back to cleartext at the same packet.

use super::KEY_LEN;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;

/// `enc_count` value for "encrypt every packet".
pub const ENC_ALWAYS: i64 = -1;

/// `enc_count` value for "no encryption".
pub const ENC_NEVER: i64 = 0;

/// Packets between keystream re-derivations.
pub const RESET_INTERVAL: u64 = 30;

/// One direction of the crypt envelope.
pub struct PacketCipher {
    key: [u8; KEY_LEN],
    cipher: ChaCha20,
    /// Packets processed on this transport connection.
    count: u64,
    /// Remaining encryption budget; negative means unbounded.
    remaining: i64,
}

impl PacketCipher {
    /// Create the cipher for a fresh transport connection.
    ///
    /// Returns `None` when `enc_count` disables encryption outright.
    pub fn new(session_key: &[u8; KEY_LEN], enc_count: i64) -> Option<Self> {
        if enc_count == ENC_NEVER {
            return None;
        }
        Some(Self {
            key: *session_key,
            cipher: keystream_at(session_key, 0),
            count: 0,
            remaining: enc_count,
        })
    }

    /// Transform one NORMAL payload in place.
    ///
    /// Encrypt and decrypt are the same operation; the two ends stay in sync
    /// because each transforms exactly the NORMAL payloads, in order.
    pub fn process(&mut self, buf: &mut [u8]) {
        if self.remaining == 0 {
            return;
        }
        if self.count % RESET_INTERVAL == 0 {
            self.cipher = keystream_at(&self.key, self.count / RESET_INTERVAL);
        }
        self.cipher.apply_keystream(buf);
        self.count += 1;
        if self.remaining > 0 {
            self.remaining -= 1;
        }
    }
}

/// Keystream for the barrier block starting at packet `block * RESET_INTERVAL`.
fn keystream_at(key: &[u8; KEY_LEN], block: u64) -> ChaCha20 {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&block.to_be_bytes());
    ChaCha20::new(key.into(), &nonce.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::derive_session_key;

    fn pair() -> (PacketCipher, PacketCipher) {
        let key = derive_session_key("pass", "encpass");
        (
            PacketCipher::new(&key, ENC_ALWAYS).unwrap(),
            PacketCipher::new(&key, ENC_ALWAYS).unwrap(),
        )
    }

    #[test]
    fn test_roundtrip_lockstep() {
        let (mut enc, mut dec) = pair();

        // Run well past the reset barrier; every packet must survive the
        // round trip, including the ones crossing a re-key.
        for no in 0..(3 * RESET_INTERVAL + 7) {
            let original: Vec<u8> = (0..100).map(|i| (no as u8).wrapping_add(i)).collect();
            let mut buf = original.clone();
            enc.process(&mut buf);
            assert_ne!(buf, original, "packet {} left in cleartext", no);
            dec.process(&mut buf);
            assert_eq!(buf, original, "packet {} corrupted", no);
        }
    }

    #[test]
    fn test_rekey_at_barrier() {
        let (mut enc, _) = pair();
        let key = derive_session_key("pass", "encpass");

        // Skip to the first packet of the second block; a fresh cipher
        // starting at that block must produce identical output.
        let mut buf = [0u8; 32];
        for _ in 0..RESET_INTERVAL {
            let mut tmp = [0u8; 32];
            enc.process(&mut tmp);
        }
        enc.process(&mut buf);

        let mut fresh = keystream_at(&key, 1);
        let mut expect = [0u8; 32];
        fresh.apply_keystream(&mut expect);
        assert_eq!(buf, expect);
    }

    #[test]
    fn test_enc_count_budget() {
        let key = derive_session_key("pass", "encpass");
        let mut enc = PacketCipher::new(&key, 2).unwrap();
        let mut dec = PacketCipher::new(&key, 2).unwrap();

        for no in 0..4 {
            let original = [0x5au8; 16];
            let mut buf = original;
            enc.process(&mut buf);
            if no < 2 {
                assert_ne!(buf, original);
            } else {
                // Budget spent on both sides; payload passes untouched.
                assert_eq!(buf, original);
            }
            dec.process(&mut buf);
            assert_eq!(buf, original);
        }
    }

    #[test]
    fn test_enc_never_disables() {
        let key = derive_session_key("pass", "encpass");
        assert!(PacketCipher::new(&key, ENC_NEVER).is_none());
    }

    #[test]
    fn test_fresh_connection_restarts_state() {
        let key = derive_session_key("pass", "encpass");
        let mut first = PacketCipher::new(&key, ENC_ALWAYS).unwrap();
        let mut second = PacketCipher::new(&key, ENC_ALWAYS).unwrap();

        // A replacement connection starts from the same derived state, so a
        // receiver with a fresh cipher decodes it from packet one.
        let mut a = *b"reconnected payload bytes!";
        let mut b = a;
        first.process(&mut a);
        second.process(&mut b);
        assert_eq!(a, b);
    }
}
