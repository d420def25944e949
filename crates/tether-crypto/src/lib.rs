//! Tether session cryptography.
//!
//! End-to-end confidentiality and integrity for command payloads carried over
//! the framed channel. All functions are pure — random bytes must be provided
//! by the caller, which keeps the handshake deterministic under test and
//! leaves RNG policy to the session layer.
//!
//! # Key Lifecycle
//!
//! A three-round handshake over control containers establishes one
//! [`CryptoSession`] per connection. The peripheral proves its identity with
//! a long-term Ed25519 key; both sides contribute ephemeral X25519 keys and
//! nonces, and every derived secret dies with the session.
//!
//! ```text
//! Step 1  client  → server   client ephemeral pk ‖ client nonce
//! Step 2  server  → client   server ephemeral pk ‖ identity pk ‖ nonce ‖ signature
//! Step 3  client  → server   client confirmation tag
//! Step 4  server  → client   server confirmation tag
//!
//! X25519(eph, eph) ── HKDF-SHA-256(transcript) ──► per-direction AEAD keys,
//!                                                  nonce salts, confirm keys
//! ```
//!
//! The AEAD is ChaCha20-Poly1305 with counter-derived nonces: each direction
//! keeps a monotonically increasing counter XORed into its salt, so nonces
//! never repeat within a session and a receiver can reject replay or
//! regression by counter alone.
//!
//! # Security
//!
//! - Identity: the client verifies the peripheral's Step 2 signature against
//!   a pinned 32-byte identity public key. The client holds no long-term key;
//!   its confirmation tag proves possession of the ephemeral.
//! - Forward secrecy: session keys derive from ephemeral X25519 keys that are
//!   zeroized when the handshake state or session drops.
//! - Failure is fatal: a bad signature, confirmation tag, AEAD tag, or nonce
//!   counter tears the session down. A peer that produced one bad tag is not
//!   trusted to produce good ones.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod error;
pub mod kx;
pub mod session;

pub use error::CryptoError;
pub use kx::{
    ClientKeyExchange, HandshakeStep, STEP1_SIZE, STEP2_SIZE, STEP3_SIZE, STEP4_SIZE,
    ServerKeyExchange,
};
pub use session::{AEAD_OVERHEAD, CryptoSession, DirectionKeys, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
