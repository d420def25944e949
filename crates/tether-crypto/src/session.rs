//! AEAD session.
//!
//! Encrypts whole command payloads with ChaCha20-Poly1305. The wire envelope
//! is `nonce (12) ‖ ciphertext ‖ tag (16)`; the nonce is the direction's salt
//! XORed with a little-endian send counter, so the receiver recovers the
//! counter from the prefix and enforces monotonicity before touching the
//! ciphertext. Counters are direction-local and never reused; crossing 2^63
//! ends the session.

use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// AEAD key size (ChaCha20-Poly1305).
pub const KEY_SIZE: usize = 32;

/// Nonce prefix carried before each ciphertext.
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size.
pub const TAG_SIZE: usize = 16;

/// Bytes an encrypted payload grows by: nonce prefix plus tag.
pub const AEAD_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Counters past this are fatal; well before the nonce space wraps.
const COUNTER_LIMIT: u64 = 1 << 63;

/// Key material for one direction: an AEAD key and a nonce salt.
///
/// Zeroized on drop.
pub struct DirectionKeys {
    key: [u8; KEY_SIZE],
    salt: [u8; NONCE_SIZE],
}

impl DirectionKeys {
    /// Bundle a derived key and nonce salt.
    #[must_use]
    pub fn new(key: [u8; KEY_SIZE], salt: [u8; NONCE_SIZE]) -> Self {
        Self { key, salt }
    }
}

impl Drop for DirectionKeys {
    fn drop(&mut self) {
        self.key.zeroize();
        self.salt.zeroize();
    }
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never reaches logs.
        f.debug_struct("DirectionKeys").finish_non_exhaustive()
    }
}

/// An established encrypted session.
///
/// Owned by the connection; dropped (and thereby zeroized) on disconnect or
/// on any crypto failure.
#[derive(Debug)]
pub struct CryptoSession {
    tx: DirectionKeys,
    tx_counter: u64,
    rx: DirectionKeys,
    rx_counter: u64,
}

impl CryptoSession {
    /// Build a session from per-direction keys. `tx` protects what this side
    /// sends; `rx` verifies what it receives.
    #[must_use]
    pub fn new(tx: DirectionKeys, rx: DirectionKeys) -> Self {
        Self { tx, tx_counter: 0, rx, rx_counter: 0 }
    }

    /// Number of payloads encrypted so far.
    #[must_use]
    pub fn tx_counter(&self) -> u64 {
        self.tx_counter
    }

    /// Next receive counter the session will accept.
    #[must_use]
    pub fn rx_counter(&self) -> u64 {
        self.rx_counter
    }

    /// Encrypt one payload, producing `nonce ‖ ciphertext ‖ tag`.
    ///
    /// # Errors
    ///
    /// [`CryptoError::CounterExhausted`] once the send counter reaches 2^63.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.tx_counter >= COUNTER_LIMIT {
            return Err(CryptoError::CounterExhausted);
        }

        let nonce = nonce_for(&self.tx.salt, self.tx_counter);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.tx.key));
        let Ok(ciphertext) = cipher.encrypt(Nonce::from_slice(&nonce), plaintext) else {
            unreachable!("ChaCha20-Poly1305 encryption cannot fail with valid inputs");
        };

        self.tx_counter += 1;

        let mut wire = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&ciphertext);
        Ok(wire)
    }

    /// Decrypt one `nonce ‖ ciphertext ‖ tag` envelope.
    ///
    /// The counter recovered from the nonce prefix must not reuse or rewind a
    /// previously accepted value. A forward gap is accepted — on an in-order
    /// transport it means the peer discarded an outbound payload, which the
    /// peer is entitled to do.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::CiphertextTooShort`] for an envelope under 28 bytes
    /// - [`CryptoError::NonceRegression`] on counter reuse or regression
    /// - [`CryptoError::CounterExhausted`] past the counter limit
    /// - [`CryptoError::DecryptFailed`] on tag mismatch or a nonce prefix not
    ///   derived from this session's salt
    pub fn decrypt(&mut self, wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if wire.len() < AEAD_OVERHEAD {
            return Err(CryptoError::CiphertextTooShort { len: wire.len() });
        }

        let (prefix, ciphertext) = wire.split_at(NONCE_SIZE);

        let mut counter_bytes = [0u8; 8];
        for (byte, (nonce, salt)) in
            counter_bytes.iter_mut().zip(prefix.iter().zip(self.rx.salt.iter()))
        {
            *byte = nonce ^ salt;
        }
        if prefix[8..] != self.rx.salt[8..] {
            return Err(CryptoError::DecryptFailed);
        }
        let counter = u64::from_le_bytes(counter_bytes);

        if counter >= COUNTER_LIMIT {
            return Err(CryptoError::CounterExhausted);
        }
        if counter < self.rx_counter {
            return Err(CryptoError::NonceRegression {
                expected: self.rx_counter,
                received: counter,
            });
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.rx.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(prefix), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)?;

        // Only advance after authentication; garbage must not burn counters.
        self.rx_counter = counter + 1;
        Ok(plaintext)
    }
}

/// Construct a nonce: salt with the counter XORed into the first 8 bytes.
fn nonce_for(salt: &[u8; NONCE_SIZE], counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = *salt;
    for (byte, counter_byte) in nonce.iter_mut().zip(counter.to_le_bytes()) {
        *byte ^= counter_byte;
    }
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(seed: u8) -> DirectionKeys {
        DirectionKeys::new([seed; KEY_SIZE], [seed.wrapping_add(1); NONCE_SIZE])
    }

    /// A matched client/server pair: what one sends the other can read.
    fn session_pair() -> (CryptoSession, CryptoSession) {
        let client = CryptoSession::new(keys(1), keys(2));
        let server = CryptoSession::new(keys(2), keys(1));
        (client, server)
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (mut client, mut server) = session_pair();

        let wire = client.encrypt(b"hello").unwrap();
        assert_eq!(wire.len(), 5 + AEAD_OVERHEAD);
        assert_eq!(server.decrypt(&wire).unwrap(), b"hello");
    }

    #[test]
    fn empty_payload_roundtrip() {
        let (mut client, mut server) = session_pair();
        let wire = client.encrypt(b"").unwrap();
        assert_eq!(server.decrypt(&wire).unwrap(), b"");
    }

    #[test]
    fn counters_advance_per_direction() {
        let (mut client, mut server) = session_pair();

        for i in 0..4 {
            assert_eq!(client.tx_counter(), i);
            let wire = client.encrypt(b"ping").unwrap();
            server.decrypt(&wire).unwrap();
        }
        assert_eq!(client.tx_counter(), 4);
        assert_eq!(server.rx_counter(), 4);
        assert_eq!(server.tx_counter(), 0);
    }

    #[test]
    fn nonces_never_repeat() {
        let (mut client, _) = session_pair();
        let a = client.encrypt(b"same plaintext").unwrap();
        let b = client.encrypt(b"same plaintext").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a[NONCE_SIZE..], b[NONCE_SIZE..]);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let (mut client, mut server) = session_pair();

        let wire = client.encrypt(b"payload").unwrap();
        for bit in 0..8 {
            let mut mangled = wire.clone();
            let last = mangled.len() - 1;
            mangled[last] ^= 1 << bit;
            assert_eq!(server.decrypt(&mangled), Err(CryptoError::DecryptFailed));
        }
        // The unmodified envelope still decrypts: failures burned no counter.
        assert_eq!(server.decrypt(&wire).unwrap(), b"payload");
    }

    #[test]
    fn counter_reuse_is_rejected() {
        let (mut client, mut server) = session_pair();

        let first = client.encrypt(b"one").unwrap();
        server.decrypt(&first).unwrap();

        // A rewound sender (fresh session, same keys) reproduces counter 0.
        let (mut rewound, _) = session_pair();
        let replayed = rewound.encrypt(b"two").unwrap();
        assert_eq!(
            server.decrypt(&replayed),
            Err(CryptoError::NonceRegression { expected: 1, received: 0 })
        );
    }

    #[test]
    fn forward_counter_gap_is_accepted() {
        let (mut client, mut server) = session_pair();

        let _dropped = client.encrypt(b"never sent").unwrap();
        let wire = client.encrypt(b"delivered").unwrap();

        assert_eq!(server.decrypt(&wire).unwrap(), b"delivered");
        assert_eq!(server.rx_counter(), 2);
    }

    #[test]
    fn foreign_salt_is_rejected() {
        let (mut client, _) = session_pair();
        let mut other = CryptoSession::new(keys(9), keys(8));

        let wire = client.encrypt(b"hello").unwrap();
        assert!(other.decrypt(&wire).is_err());
    }

    #[test]
    fn short_envelope_is_rejected() {
        let (_, mut server) = session_pair();
        assert_eq!(
            server.decrypt(&[0u8; AEAD_OVERHEAD - 1]),
            Err(CryptoError::CiphertextTooShort { len: AEAD_OVERHEAD - 1 })
        );
    }

    #[test]
    fn nonce_construction_xors_low_bytes() {
        let salt = [0xAA; NONCE_SIZE];
        let nonce = nonce_for(&salt, 0x0102_0304_0506_0708);
        assert_eq!(&nonce[..8], &[
            0xAA ^ 0x08,
            0xAA ^ 0x07,
            0xAA ^ 0x06,
            0xAA ^ 0x05,
            0xAA ^ 0x04,
            0xAA ^ 0x03,
            0xAA ^ 0x02,
            0xAA ^ 0x01,
        ]);
        assert_eq!(&nonce[8..], &[0xAA; 4]);
    }
}
