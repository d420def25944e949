//! Crypto error types.

use thiserror::Error;

/// Errors from the handshake and the AEAD session.
///
/// Every variant is fatal to the session: the caller tears down the
/// handshake or established session, zeroises key material, and (on the
/// peripheral) waits for a fresh key exchange.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// A handshake message had the wrong size for its step.
    #[error("handshake step {step} message of {actual} bytes, expected {expected}")]
    MalformedStep {
        /// Handshake step (1–4)
        step: u8,
        /// Expected message size
        expected: usize,
        /// Received message size
        actual: usize,
    },

    /// A handshake message arrived in a state that does not expect it.
    #[error("handshake message out of order at step {step}")]
    OutOfOrder {
        /// Handshake step (1–4) of the unexpected message
        step: u8,
    },

    /// The peer presented an identity key other than the pinned one.
    #[error("peer identity key does not match the pinned key")]
    IdentityMismatch,

    /// The pinned identity bytes are not a valid Ed25519 public key.
    #[error("pinned identity key is not a valid Ed25519 public key")]
    InvalidIdentityKey,

    /// The peripheral's transcript signature did not verify.
    #[error("handshake signature verification failed")]
    SignatureInvalid,

    /// A confirmation tag did not verify.
    #[error("handshake confirmation tag mismatch")]
    ConfirmationFailed,

    /// The peer's ephemeral public key produced a non-contributory shared
    /// secret (low-order point).
    #[error("peer ephemeral public key is of low order")]
    WeakPeerKey,

    /// Ciphertext shorter than nonce prefix plus tag.
    #[error("ciphertext of {len} bytes is shorter than the AEAD envelope")]
    CiphertextTooShort {
        /// Received ciphertext length
        len: usize,
    },

    /// Authentication tag mismatch or malformed nonce prefix.
    #[error("decryption failed")]
    DecryptFailed,

    /// The peer reused or rewound its nonce counter.
    #[error("nonce counter regression: expected at least {expected}, got {received}")]
    NonceRegression {
        /// Lowest counter the receiver would accept
        expected: u64,
        /// Counter recovered from the nonce prefix
        received: u64,
    },

    /// A direction counter passed 2^63; the session must end.
    #[error("nonce counter exhausted")]
    CounterExhausted,
}
