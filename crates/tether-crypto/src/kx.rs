//! Three-round authenticated key exchange.
//!
//! Both sides are pure state machines: the session layer feeds them the raw
//! payloads of key-exchange control containers plus fresh random bytes, and
//! gets back the next message to send or an established [`CryptoSession`].
//! Any failure zeroises partial material (ephemeral secrets and derived keys
//! drop-zeroize) and returns the machine to idle.
//!
//! Message layouts (sizes in bytes):
//!
//! ```text
//! Step 1 (48):  client_eph_pk[32] ‖ client_nonce[16]
//! Step 2 (144): server_eph_pk[32] ‖ identity_pk[32] ‖ server_nonce[16] ‖ sig[64]
//! Step 3 (32):  HMAC-SHA-256(c2p confirm key, transcript)
//! Step 4 (32):  HMAC-SHA-256(p2c confirm key, transcript)
//! ```
//!
//! The transcript is `client_eph_pk ‖ server_eph_pk ‖ client_nonce ‖
//! server_nonce`; it salts the HKDF schedule and is what both confirmation
//! tags cover. The Step 2 signature additionally covers the identity key, so
//! a pinned-key client detects substitution before deriving anything.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroize;

use crate::{
    error::CryptoError,
    session::{CryptoSession, DirectionKeys, KEY_SIZE, NONCE_SIZE},
};

type HmacSha256 = Hmac<Sha256>;

/// X25519 public key size.
const PUBKEY_SIZE: usize = 32;

/// Handshake nonce size.
const KX_NONCE_SIZE: usize = 16;

/// Ed25519 signature size.
const SIG_SIZE: usize = 64;

/// Confirmation tag size.
const CONFIRM_SIZE: usize = 32;

/// Size of step 1: client ephemeral key and nonce.
pub const STEP1_SIZE: usize = PUBKEY_SIZE + KX_NONCE_SIZE;

/// Size of step 2: server ephemeral key, identity key, nonce, signature.
pub const STEP2_SIZE: usize = PUBKEY_SIZE + PUBKEY_SIZE + KX_NONCE_SIZE + SIG_SIZE;

/// Size of step 3: client confirmation tag.
pub const STEP3_SIZE: usize = CONFIRM_SIZE;

/// Size of step 4: server confirmation tag.
pub const STEP4_SIZE: usize = CONFIRM_SIZE;

/// Transcript both sides derive keys from.
const TRANSCRIPT_SIZE: usize = 2 * PUBKEY_SIZE + 2 * KX_NONCE_SIZE;

/// Domain separator for the step 2 identity signature.
const SIGNATURE_LABEL: &[u8] = b"tether kx v1 step2";

/// A derived confirmation key; zeroized on drop.
struct ConfirmKey([u8; CONFIRM_SIZE]);

impl Drop for ConfirmKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Everything HKDF produces for one session.
///
/// No `Drop` impl of its own — each field zeroizes itself — so the direction
/// keys can be moved out into a [`CryptoSession`].
struct SessionSecrets {
    c2p: DirectionKeys,
    p2c: DirectionKeys,
    confirm_c2p: ConfirmKey,
    confirm_p2c: ConfirmKey,
}

/// Peripheral-side handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// No exchange in progress.
    Idle,
    /// Step 2 sent; waiting for the client's confirmation tag.
    AwaitingConfirmation,
    /// Step 4 produced; the session has been handed out.
    Done,
}

enum ServerState {
    Idle,
    AwaitingConfirmation { secrets: Box<SessionSecrets>, transcript: [u8; TRANSCRIPT_SIZE] },
    Done,
}

/// Peripheral side of the key exchange.
///
/// Holds the long-term Ed25519 identity across sessions; everything else is
/// per-exchange and dies on [`reset`](Self::reset) or error.
pub struct ServerKeyExchange {
    identity: SigningKey,
    state: ServerState,
}

impl ServerKeyExchange {
    /// Create from the peripheral's 32-byte Ed25519 seed.
    #[must_use]
    pub fn new(identity_secret: &[u8; 32]) -> Self {
        Self { identity: SigningKey::from_bytes(identity_secret), state: ServerState::Idle }
    }

    /// The identity public key clients pin.
    #[must_use]
    pub fn identity_public_key(&self) -> [u8; 32] {
        self.identity.verifying_key().to_bytes()
    }

    /// Current handshake progress.
    #[must_use]
    pub fn step(&self) -> HandshakeStep {
        match self.state {
            ServerState::Idle => HandshakeStep::Idle,
            ServerState::AwaitingConfirmation { .. } => HandshakeStep::AwaitingConfirmation,
            ServerState::Done => HandshakeStep::Done,
        }
    }

    /// Abandon any exchange in progress.
    pub fn reset(&mut self) {
        self.state = ServerState::Idle;
    }

    /// Process step 1 and produce step 2.
    ///
    /// Always starts a fresh exchange, discarding any partial one — the
    /// session layer refuses re-initiation while a session is active, so a
    /// new step 1 here means the client restarted.
    ///
    /// `ephemeral_secret` and `server_nonce` must be fresh random bytes.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::MalformedStep`] for a step 1 of the wrong size
    /// - [`CryptoError::WeakPeerKey`] for a low-order client key
    pub fn handle_step1(
        &mut self,
        step1: &[u8],
        ephemeral_secret: [u8; 32],
        server_nonce: [u8; KX_NONCE_SIZE],
    ) -> Result<[u8; STEP2_SIZE], CryptoError> {
        self.state = ServerState::Idle;

        if step1.len() != STEP1_SIZE {
            return Err(CryptoError::MalformedStep {
                step: 1,
                expected: STEP1_SIZE,
                actual: step1.len(),
            });
        }

        let mut client_pk = [0u8; PUBKEY_SIZE];
        client_pk.copy_from_slice(&step1[..PUBKEY_SIZE]);
        let mut client_nonce = [0u8; KX_NONCE_SIZE];
        client_nonce.copy_from_slice(&step1[PUBKEY_SIZE..]);

        let mut seed = ephemeral_secret;
        let secret = StaticSecret::from(seed);
        seed.zeroize();
        let server_pk = PublicKey::from(&secret);
        let shared = secret.diffie_hellman(&PublicKey::from(client_pk));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakPeerKey);
        }

        let identity_pk = self.identity_public_key();
        let transcript =
            build_transcript(&client_pk, server_pk.as_bytes(), &client_nonce, &server_nonce);
        let secrets = derive_secrets(&shared, &transcript);

        let signature = self.identity.sign(&signed_message(
            &client_pk,
            &client_nonce,
            server_pk.as_bytes(),
            &identity_pk,
            &server_nonce,
        ));

        let mut step2 = [0u8; STEP2_SIZE];
        step2[..PUBKEY_SIZE].copy_from_slice(server_pk.as_bytes());
        step2[PUBKEY_SIZE..2 * PUBKEY_SIZE].copy_from_slice(&identity_pk);
        step2[2 * PUBKEY_SIZE..2 * PUBKEY_SIZE + KX_NONCE_SIZE].copy_from_slice(&server_nonce);
        step2[2 * PUBKEY_SIZE + KX_NONCE_SIZE..].copy_from_slice(&signature.to_bytes());

        self.state =
            ServerState::AwaitingConfirmation { secrets: Box::new(secrets), transcript };
        Ok(step2)
    }

    /// Verify step 3 and produce step 4 plus the established session.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::OutOfOrder`] if no step 2 is outstanding
    /// - [`CryptoError::MalformedStep`] / [`CryptoError::ConfirmationFailed`]
    ///   for a bad tag; the exchange resets to idle
    pub fn handle_step3(
        &mut self,
        step3: &[u8],
    ) -> Result<([u8; STEP4_SIZE], CryptoSession), CryptoError> {
        let state = std::mem::replace(&mut self.state, ServerState::Idle);
        let ServerState::AwaitingConfirmation { secrets, transcript } = state else {
            return Err(CryptoError::OutOfOrder { step: 3 });
        };

        if step3.len() != STEP3_SIZE {
            return Err(CryptoError::MalformedStep {
                step: 3,
                expected: STEP3_SIZE,
                actual: step3.len(),
            });
        }
        verify_confirm_tag(&secrets.confirm_c2p, &transcript, step3)?;

        let step4 = confirm_tag(&secrets.confirm_p2c, &transcript);
        let session = CryptoSession::new(secrets.p2c, secrets.c2p);

        self.state = ServerState::Done;
        Ok((step4, session))
    }
}

impl std::fmt::Debug for ServerKeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKeyExchange").field("step", &self.step()).finish_non_exhaustive()
    }
}

#[derive(Default)]
enum ClientState {
    #[default]
    Idle,
    AwaitingStep2 { secret: StaticSecret, client_nonce: [u8; KX_NONCE_SIZE] },
    AwaitingStep4 { secrets: Box<SessionSecrets>, transcript: [u8; TRANSCRIPT_SIZE] },
    Done,
}

/// Central side of the key exchange.
#[derive(Default)]
pub struct ClientKeyExchange {
    state: ClientState,
}

impl ClientKeyExchange {
    /// Create an idle exchange.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The handshake completed and the session was handed out.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self.state, ClientState::Done)
    }

    /// Abandon any exchange in progress.
    pub fn reset(&mut self) {
        self.state = ClientState::Idle;
    }

    /// Start an exchange, producing step 1.
    ///
    /// `ephemeral_secret` and `client_nonce` must be fresh random bytes.
    #[must_use]
    pub fn initiate(
        &mut self,
        ephemeral_secret: [u8; 32],
        client_nonce: [u8; KX_NONCE_SIZE],
    ) -> [u8; STEP1_SIZE] {
        let mut seed = ephemeral_secret;
        let secret = StaticSecret::from(seed);
        seed.zeroize();
        let public = PublicKey::from(&secret);

        let mut step1 = [0u8; STEP1_SIZE];
        step1[..PUBKEY_SIZE].copy_from_slice(public.as_bytes());
        step1[PUBKEY_SIZE..].copy_from_slice(&client_nonce);

        self.state = ClientState::AwaitingStep2 { secret, client_nonce };
        step1
    }

    /// Verify step 2 against the pinned identity and produce step 3.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::OutOfOrder`] if [`initiate`](Self::initiate) was not
    ///   called
    /// - [`CryptoError::IdentityMismatch`] if the presented identity key is
    ///   not the pinned one
    /// - [`CryptoError::SignatureInvalid`] if the transcript signature fails
    /// - [`CryptoError::WeakPeerKey`] for a low-order server key
    pub fn handle_step2(
        &mut self,
        step2: &[u8],
        pinned_identity: &[u8; 32],
    ) -> Result<[u8; STEP3_SIZE], CryptoError> {
        let state = std::mem::replace(&mut self.state, ClientState::Idle);
        let ClientState::AwaitingStep2 { secret, client_nonce } = state else {
            return Err(CryptoError::OutOfOrder { step: 2 });
        };

        if step2.len() != STEP2_SIZE {
            return Err(CryptoError::MalformedStep {
                step: 2,
                expected: STEP2_SIZE,
                actual: step2.len(),
            });
        }

        let mut server_pk = [0u8; PUBKEY_SIZE];
        server_pk.copy_from_slice(&step2[..PUBKEY_SIZE]);
        let mut identity_pk = [0u8; PUBKEY_SIZE];
        identity_pk.copy_from_slice(&step2[PUBKEY_SIZE..2 * PUBKEY_SIZE]);
        let mut server_nonce = [0u8; KX_NONCE_SIZE];
        server_nonce
            .copy_from_slice(&step2[2 * PUBKEY_SIZE..2 * PUBKEY_SIZE + KX_NONCE_SIZE]);
        let mut sig_bytes = [0u8; SIG_SIZE];
        sig_bytes.copy_from_slice(&step2[2 * PUBKEY_SIZE + KX_NONCE_SIZE..]);

        if identity_pk != *pinned_identity {
            return Err(CryptoError::IdentityMismatch);
        }
        let verifying_key = VerifyingKey::from_bytes(pinned_identity)
            .map_err(|_| CryptoError::InvalidIdentityKey)?;

        let client_pk = PublicKey::from(&secret).to_bytes();
        verifying_key
            .verify_strict(
                &signed_message(&client_pk, &client_nonce, &server_pk, &identity_pk, &server_nonce),
                &Signature::from_bytes(&sig_bytes),
            )
            .map_err(|_| CryptoError::SignatureInvalid)?;

        let shared = secret.diffie_hellman(&PublicKey::from(server_pk));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakPeerKey);
        }

        let transcript = build_transcript(&client_pk, &server_pk, &client_nonce, &server_nonce);
        let secrets = derive_secrets(&shared, &transcript);
        let step3 = confirm_tag(&secrets.confirm_c2p, &transcript);

        self.state = ClientState::AwaitingStep4 { secrets: Box::new(secrets), transcript };
        Ok(step3)
    }

    /// Verify step 4 and hand out the established session.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::OutOfOrder`] if step 3 was not produced
    /// - [`CryptoError::MalformedStep`] / [`CryptoError::ConfirmationFailed`]
    ///   for a bad tag; the exchange resets to idle
    pub fn handle_step4(&mut self, step4: &[u8]) -> Result<CryptoSession, CryptoError> {
        let state = std::mem::replace(&mut self.state, ClientState::Idle);
        let ClientState::AwaitingStep4 { secrets, transcript } = state else {
            return Err(CryptoError::OutOfOrder { step: 4 });
        };

        if step4.len() != STEP4_SIZE {
            return Err(CryptoError::MalformedStep {
                step: 4,
                expected: STEP4_SIZE,
                actual: step4.len(),
            });
        }
        verify_confirm_tag(&secrets.confirm_p2c, &transcript, step4)?;

        self.state = ClientState::Done;
        Ok(CryptoSession::new(secrets.c2p, secrets.p2c))
    }
}

impl std::fmt::Debug for ClientKeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let step = match self.state {
            ClientState::Idle => "Idle",
            ClientState::AwaitingStep2 { .. } => "AwaitingStep2",
            ClientState::AwaitingStep4 { .. } => "AwaitingStep4",
            ClientState::Done => "Done",
        };
        f.debug_struct("ClientKeyExchange").field("step", &step).finish_non_exhaustive()
    }
}

fn build_transcript(
    client_pk: &[u8; PUBKEY_SIZE],
    server_pk: &[u8; PUBKEY_SIZE],
    client_nonce: &[u8; KX_NONCE_SIZE],
    server_nonce: &[u8; KX_NONCE_SIZE],
) -> [u8; TRANSCRIPT_SIZE] {
    let mut transcript = [0u8; TRANSCRIPT_SIZE];
    transcript[..32].copy_from_slice(client_pk);
    transcript[32..64].copy_from_slice(server_pk);
    transcript[64..80].copy_from_slice(client_nonce);
    transcript[80..].copy_from_slice(server_nonce);
    transcript
}

fn signed_message(
    client_pk: &[u8; PUBKEY_SIZE],
    client_nonce: &[u8; KX_NONCE_SIZE],
    server_pk: &[u8; PUBKEY_SIZE],
    identity_pk: &[u8; PUBKEY_SIZE],
    server_nonce: &[u8; KX_NONCE_SIZE],
) -> Vec<u8> {
    let mut message =
        Vec::with_capacity(SIGNATURE_LABEL.len() + 3 * PUBKEY_SIZE + 2 * KX_NONCE_SIZE);
    message.extend_from_slice(SIGNATURE_LABEL);
    message.extend_from_slice(client_pk);
    message.extend_from_slice(client_nonce);
    message.extend_from_slice(server_pk);
    message.extend_from_slice(identity_pk);
    message.extend_from_slice(server_nonce);
    message
}

/// Expand the shared secret into the full key schedule.
fn derive_secrets(shared: &SharedSecret, transcript: &[u8; TRANSCRIPT_SIZE]) -> SessionSecrets {
    let hkdf = Hkdf::<Sha256>::new(Some(transcript), shared.as_bytes());

    let mut c2p_key = [0u8; KEY_SIZE];
    let mut p2c_key = [0u8; KEY_SIZE];
    let mut c2p_salt = [0u8; NONCE_SIZE];
    let mut p2c_salt = [0u8; NONCE_SIZE];
    let mut confirm_c2p = [0u8; CONFIRM_SIZE];
    let mut confirm_p2c = [0u8; CONFIRM_SIZE];

    for (info, okm) in [
        (&b"tether c2p key"[..], &mut c2p_key[..]),
        (&b"tether p2c key"[..], &mut p2c_key[..]),
        (&b"tether c2p nonce"[..], &mut c2p_salt[..]),
        (&b"tether p2c nonce"[..], &mut p2c_salt[..]),
        (&b"tether c2p confirm"[..], &mut confirm_c2p[..]),
        (&b"tether p2c confirm"[..], &mut confirm_p2c[..]),
    ] {
        let Ok(()) = hkdf.expand(info, okm) else {
            unreachable!("requested lengths are valid HKDF-SHA-256 outputs");
        };
    }

    SessionSecrets {
        c2p: DirectionKeys::new(c2p_key, c2p_salt),
        p2c: DirectionKeys::new(p2c_key, p2c_salt),
        confirm_c2p: ConfirmKey(confirm_c2p),
        confirm_p2c: ConfirmKey(confirm_p2c),
    }
}

fn confirm_tag(key: &ConfirmKey, transcript: &[u8; TRANSCRIPT_SIZE]) -> [u8; CONFIRM_SIZE] {
    let Ok(mut mac) = HmacSha256::new_from_slice(&key.0) else {
        unreachable!("HMAC-SHA-256 accepts any key length");
    };
    mac.update(transcript);
    mac.finalize().into_bytes().into()
}

fn verify_confirm_tag(
    key: &ConfirmKey,
    transcript: &[u8; TRANSCRIPT_SIZE],
    tag: &[u8],
) -> Result<(), CryptoError> {
    let Ok(mut mac) = HmacSha256::new_from_slice(&key.0) else {
        unreachable!("HMAC-SHA-256 accepts any key length");
    };
    mac.update(transcript);
    mac.verify_slice(tag).map_err(|_| CryptoError::ConfirmationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTITY_SECRET: [u8; 32] = [0x42; 32];

    /// Run the full handshake with fixed randomness; returns both sessions.
    fn handshake() -> (CryptoSession, CryptoSession) {
        let mut server = ServerKeyExchange::new(&IDENTITY_SECRET);
        let mut client = ClientKeyExchange::new();
        let identity = server.identity_public_key();

        let step1 = client.initiate([0x11; 32], [0x22; 16]);
        let step2 = server.handle_step1(&step1, [0x33; 32], [0x44; 16]).unwrap();
        let step3 = client.handle_step2(&step2, &identity).unwrap();
        let (step4, server_session) = server.handle_step3(&step3).unwrap();
        let client_session = client.handle_step4(&step4).unwrap();

        assert_eq!(server.step(), HandshakeStep::Done);
        assert!(client.is_done());
        (client_session, server_session)
    }

    #[test]
    fn handshake_establishes_matching_sessions() {
        let (mut client, mut server) = handshake();

        let request = client.encrypt(b"request").unwrap();
        assert_eq!(server.decrypt(&request).unwrap(), b"request");

        let response = server.encrypt(b"response").unwrap();
        assert_eq!(client.decrypt(&response).unwrap(), b"response");
    }

    #[test]
    fn directions_are_keyed_independently() {
        let (mut client, server) = handshake();

        // A client→server envelope must not decrypt as server→client.
        let wire = client.encrypt(b"one way").unwrap();
        assert!(client.decrypt(&wire).is_err());
        let _ = server;
    }

    #[test]
    fn wrong_pinned_identity_is_rejected() {
        let mut server = ServerKeyExchange::new(&IDENTITY_SECRET);
        let mut client = ClientKeyExchange::new();

        let step1 = client.initiate([0x11; 32], [0x22; 16]);
        let step2 = server.handle_step1(&step1, [0x33; 32], [0x44; 16]).unwrap();

        let other_identity = ServerKeyExchange::new(&[0x99; 32]).identity_public_key();
        assert_eq!(
            client.handle_step2(&step2, &other_identity),
            Err(CryptoError::IdentityMismatch)
        );
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let mut server = ServerKeyExchange::new(&IDENTITY_SECRET);
        let mut client = ClientKeyExchange::new();
        let identity = server.identity_public_key();

        let step1 = client.initiate([0x11; 32], [0x22; 16]);
        let mut step2 = server.handle_step1(&step1, [0x33; 32], [0x44; 16]).unwrap();
        step2[STEP2_SIZE - 1] ^= 0x01;

        assert_eq!(client.handle_step2(&step2, &identity), Err(CryptoError::SignatureInvalid));
    }

    #[test]
    fn tampered_confirmation_resets_server() {
        let mut server = ServerKeyExchange::new(&IDENTITY_SECRET);
        let mut client = ClientKeyExchange::new();
        let identity = server.identity_public_key();

        let step1 = client.initiate([0x11; 32], [0x22; 16]);
        let step2 = server.handle_step1(&step1, [0x33; 32], [0x44; 16]).unwrap();
        let mut step3 = client.handle_step2(&step2, &identity).unwrap();
        step3[0] ^= 0xFF;

        assert!(matches!(server.handle_step3(&step3), Err(CryptoError::ConfirmationFailed)));
        assert_eq!(server.step(), HandshakeStep::Idle);
    }

    #[test]
    fn out_of_order_messages_are_rejected() {
        let mut server = ServerKeyExchange::new(&IDENTITY_SECRET);
        assert!(matches!(
            server.handle_step3(&[0u8; STEP3_SIZE]),
            Err(CryptoError::OutOfOrder { step: 3 })
        ));

        let mut client = ClientKeyExchange::new();
        assert_eq!(
            client.handle_step2(&[0u8; STEP2_SIZE], &[0u8; 32]),
            Err(CryptoError::OutOfOrder { step: 2 })
        );
        assert!(matches!(
            client.handle_step4(&[0u8; STEP4_SIZE]),
            Err(CryptoError::OutOfOrder { step: 4 })
        ));
    }

    #[test]
    fn malformed_step1_is_rejected() {
        let mut server = ServerKeyExchange::new(&IDENTITY_SECRET);
        let result = server.handle_step1(&[0u8; 10], [0x33; 32], [0x44; 16]);
        assert_eq!(
            result,
            Err(CryptoError::MalformedStep { step: 1, expected: STEP1_SIZE, actual: 10 })
        );
        assert_eq!(server.step(), HandshakeStep::Idle);
    }

    #[test]
    fn low_order_client_key_is_rejected() {
        let mut server = ServerKeyExchange::new(&IDENTITY_SECRET);
        let mut step1 = [0u8; STEP1_SIZE];
        // All-zero ephemeral public key: X25519 output is all zeros.
        step1[PUBKEY_SIZE..].copy_from_slice(&[0x22; 16]);
        assert_eq!(
            server.handle_step1(&step1, [0x33; 32], [0x44; 16]),
            Err(CryptoError::WeakPeerKey)
        );
    }

    #[test]
    fn fresh_step1_restarts_a_stale_exchange() {
        let mut server = ServerKeyExchange::new(&IDENTITY_SECRET);
        let mut client = ClientKeyExchange::new();
        let identity = server.identity_public_key();

        // First attempt stalls after step 2.
        let stale = client.initiate([0x11; 32], [0x22; 16]);
        server.handle_step1(&stale, [0x33; 32], [0x44; 16]).unwrap();
        assert_eq!(server.step(), HandshakeStep::AwaitingConfirmation);

        // Client restarts; the whole exchange completes on fresh material.
        let step1 = client.initiate([0x55; 32], [0x66; 16]);
        let step2 = server.handle_step1(&step1, [0x77; 32], [0x88; 16]).unwrap();
        let step3 = client.handle_step2(&step2, &identity).unwrap();
        let (step4, mut server_session) = server.handle_step3(&step3).unwrap();
        let mut client_session = client.handle_step4(&step4).unwrap();

        let wire = client_session.encrypt(b"after restart").unwrap();
        assert_eq!(server_session.decrypt(&wire).unwrap(), b"after restart");
    }

    #[test]
    fn rewound_sender_is_rejected_by_established_peer() {
        // Deterministic inputs: running the handshake twice yields identical
        // key schedules, so a "rewound" client is literally a fresh session.
        let (mut client_a, mut server) = handshake();
        let (mut client_b, _) = handshake();

        server.decrypt(&client_a.encrypt(b"one").unwrap()).unwrap();
        server.decrypt(&client_a.encrypt(b"two").unwrap()).unwrap();

        let replay = client_b.encrypt(b"stale counter").unwrap();
        assert_eq!(
            server.decrypt(&replay),
            Err(CryptoError::NonceRegression { expected: 2, received: 0 })
        );
    }
}
