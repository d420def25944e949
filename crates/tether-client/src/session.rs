//! Client session.
//!
//! One [`ClientSession`] per connection. The transport driver pumps inbound
//! notifications into [`handle_notification`](ClientSession::handle_notification)
//! (synchronous, constant-time demux); callers issue RPC operations through
//! the async methods, each bounded by a timeout. The protocol paces one call
//! at a time — the single pending-call slot mirrors that, and a second
//! concurrent call fails fast with [`ClientError::Busy`].
//!
//! Waits are one-shot channels resolved by the demux path: a completed
//! response resolves the pending call, a control/error frame fails it with
//! the decoded code, and control replies (capabilities, timeout, key
//! exchange) resolve their dedicated waiters.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use tokio::sync::oneshot;

use tether_crypto::{ClientKeyExchange, CryptoSession};
use tether_proto::{
    Assembler, Capabilities, CommandPacket, CommandType, Container, ControlCommand, ErrorCode,
    FeedResult, decode_timeout_ms, serialize_command, split_and_send,
};

use crate::{error::ClientError, transport::ClientTransport};

/// Default bound on an RPC call's response wait.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on each handshake / control round trip.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default reassembly capacity for inbound responses.
pub const DEFAULT_ASSEMBLER_BUF_SIZE: usize = 4096;

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on an RPC call's response wait.
    pub call_timeout: Duration,

    /// Bound on each capability/timeout/key-exchange round trip.
    pub control_timeout: Duration,

    /// Largest logical response payload the session will reassemble.
    pub assembler_buf_size: usize,

    /// Pinned 32-byte Ed25519 identity of the peripheral. Required for
    /// [`ClientSession::perform_key_exchange`].
    pub server_identity: Option<[u8; 32]>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            assembler_buf_size: DEFAULT_ASSEMBLER_BUF_SIZE,
            server_identity: None,
        }
    }
}

/// An in-flight call waiting for its response.
struct PendingCall {
    method: String,
    tx: oneshot::Sender<Result<Vec<u8>, ClientError>>,
}

/// Claim on the pending-call slot; redeem with
/// [`ClientSession::wait_response`].
#[derive(Debug)]
pub struct ResponseTicket {
    rx: oneshot::Receiver<Result<Vec<u8>, ClientError>>,
}

type StreamHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
type StreamEndHandler = Arc<dyn Fn() + Send + Sync>;

/// Demux state behind the session mutex.
struct SessionState {
    assembler: Assembler,
    crypto: Option<CryptoSession>,
    capabilities: Option<Capabilities>,
    server_timeout_ms: Option<u16>,
    pending: Option<PendingCall>,
    caps_waiter: Option<oneshot::Sender<Vec<u8>>>,
    timeout_waiter: Option<oneshot::Sender<Vec<u8>>>,
    kx_waiter: Option<oneshot::Sender<Vec<u8>>>,
    stream_handlers: HashMap<String, StreamHandler>,
    stream_end_handler: Option<StreamEndHandler>,
    lost: bool,
}

/// Central-side protocol session.
pub struct ClientSession {
    transport: Arc<dyn ClientTransport>,
    config: ClientConfig,
    transaction_counter: AtomicU8,
    state: Mutex<SessionState>,
}

impl ClientSession {
    /// Create a session over a connected transport.
    #[must_use]
    pub fn new(transport: Arc<dyn ClientTransport>, config: ClientConfig) -> Self {
        let assembler = Assembler::new(config.assembler_buf_size);
        Self {
            transport,
            config,
            transaction_counter: AtomicU8::new(0),
            state: Mutex::new(SessionState {
                assembler,
                crypto: None,
                capabilities: None,
                server_timeout_ms: None,
                pending: None,
                caps_waiter: None,
                timeout_waiter: None,
                kx_waiter: None,
                stream_handlers: HashMap::new(),
                stream_end_handler: None,
                lost: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next outbound transaction id (wrapping `u8`).
    #[must_use]
    pub fn next_transaction_id(&self) -> u8 {
        self.transaction_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// An encrypted session is established.
    #[must_use]
    pub fn encryption_active(&self) -> bool {
        self.lock().crypto.is_some()
    }

    /// Capabilities from the last successful
    /// [`request_capabilities`](Self::request_capabilities).
    #[must_use]
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.lock().capabilities
    }

    /// Server timeout from the last successful
    /// [`query_timeout`](Self::query_timeout).
    #[must_use]
    pub fn server_timeout_ms(&self) -> Option<u16> {
        self.lock().server_timeout_ms
    }

    // ── Inbound demux ────────────────────────────────────────────────────

    /// Process one inbound container (the transport's notification
    /// callback). Constant-time: parses, routes, copies.
    pub fn handle_notification(&self, bytes: &[u8]) {
        let container = match Container::parse(bytes) {
            Ok(container) => container,
            Err(e) => {
                tracing::warn!(error = %e, "notification parse failed");
                return;
            },
        };

        match container {
            Container::Control { command, payload, .. } => self.on_control(command, payload),
            data => self.on_data(&data),
        }
    }

    /// The transport dropped: fail everything outstanding and zeroise keys.
    pub fn connection_lost(&self) {
        let mut state = self.lock();
        state.lost = true;
        state.assembler.reset();
        state.crypto = None;
        state.caps_waiter = None;
        state.timeout_waiter = None;
        state.kx_waiter = None;
        if let Some(pending) = state.pending.take() {
            let _ = pending.tx.send(Err(ClientError::TransportLost));
        }
    }

    fn on_control(&self, command: u8, payload: &[u8]) {
        match ControlCommand::from_raw(command) {
            Some(ControlCommand::Error) => {
                let error = match payload.first().copied() {
                    Some(raw) => match ErrorCode::from_raw(raw) {
                        Some(code) => ClientError::Remote { code },
                        None => ClientError::RemoteUnknown { raw },
                    },
                    None => ClientError::RemoteUnknown { raw: 0 },
                };
                tracing::warn!(error = %error, "peer reported an error");
                if let Some(pending) = self.lock().pending.take() {
                    let _ = pending.tx.send(Err(error));
                }
            },

            Some(ControlCommand::Capabilities) => {
                if let Some(waiter) = self.lock().caps_waiter.take() {
                    let _ = waiter.send(payload.to_vec());
                } else {
                    tracing::debug!("unsolicited capabilities reply");
                }
            },

            Some(ControlCommand::Timeout) => {
                if let Some(waiter) = self.lock().timeout_waiter.take() {
                    let _ = waiter.send(payload.to_vec());
                }
            },

            Some(ControlCommand::KeyExchange) => {
                if let Some(waiter) = self.lock().kx_waiter.take() {
                    let _ = waiter.send(payload.to_vec());
                } else {
                    tracing::debug!("unsolicited key exchange reply");
                }
            },

            Some(ControlCommand::StreamEndP2c) => {
                let handler = self.lock().stream_end_handler.clone();
                if let Some(handler) = handler {
                    handler();
                }
            },

            Some(other) => {
                tracing::debug!(command = ?other, "control command not addressed to a central");
            },

            None => tracing::debug!(command, "ignoring reserved control command"),
        }
    }

    fn on_data(&self, container: &Container<'_>) {
        // Everything under one lock: feed, decrypt, resolve. The stream
        // callback is the exception — cloned out and invoked lock-free so it
        // may call back into the session.
        let mut state = self.lock();

        let assembled = match state.assembler.feed(container) {
            Ok(FeedResult::Incomplete) => return,
            Ok(FeedResult::Complete) => state.assembler.payload().to_vec(),
            Err(e) => {
                tracing::warn!(error = %e, "framing error; assembler reset");
                return;
            },
        };
        state.assembler.reset();

        let payload = match state.crypto.as_mut() {
            Some(session) => match session.decrypt(&assembled) {
                Ok(plain) => plain,
                Err(e) => {
                    // Fatal: the encrypted channel is no longer trustworthy.
                    tracing::warn!(error = %e, "response decryption failed; dropping session");
                    state.crypto = None;
                    if let Some(pending) = state.pending.take() {
                        let _ = pending.tx.send(Err(ClientError::Crypto(e)));
                    }
                    return;
                },
            },
            None => assembled,
        };

        let packet = match CommandPacket::parse(&payload) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(error = %e, "response command parse failed");
                return;
            },
        };
        if packet.cmd_type != CommandType::Response {
            tracing::warn!("ignoring inbound request packet");
            return;
        }

        let name = String::from_utf8_lossy(packet.name).into_owned();

        if let Some(pending) = state.pending.take() {
            let result = if pending.method == name {
                Ok(packet.data.to_vec())
            } else {
                Err(ClientError::NameMismatch { expected: pending.method.clone(), got: name })
            };
            let _ = pending.tx.send(result);
            return;
        }

        if let Some(handler) = state.stream_handlers.get(&name).cloned() {
            let body = packet.data.to_vec();
            drop(state);
            handler(body);
            return;
        }

        tracing::warn!(method = %name, "unsolicited response");
    }

    // ── Outbound operations ──────────────────────────────────────────────

    /// Claim the pending-call slot for a response to `method`.
    ///
    /// Used directly when the response is triggered by something other than
    /// a request — the upload-stream summary arrives after a stream-end
    /// control frame, so the waiter must be registered before sending it.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Busy`] if a call is already in flight
    /// - [`ClientError::TransportLost`] after
    ///   [`connection_lost`](Self::connection_lost)
    pub fn expect_response(&self, method: &str) -> Result<ResponseTicket, ClientError> {
        let mut state = self.lock();
        if state.lost {
            return Err(ClientError::TransportLost);
        }
        if state.pending.is_some() {
            return Err(ClientError::Busy);
        }

        let (tx, rx) = oneshot::channel();
        state.pending = Some(PendingCall { method: method.to_string(), tx });
        Ok(ResponseTicket { rx })
    }

    /// Wait (bounded) for the response claimed by `ticket`.
    ///
    /// # Errors
    ///
    /// The call's failure: a peer-reported error, a name mismatch, a crypto
    /// failure, [`ClientError::Timeout`], or [`ClientError::TransportLost`].
    pub async fn wait_response(&self, ticket: ResponseTicket) -> Result<Vec<u8>, ClientError> {
        match tokio::time::timeout(self.config.call_timeout, ticket.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::TransportLost),
            Err(_) => {
                self.lock().pending = None;
                Err(ClientError::Timeout("rpc response"))
            },
        }
    }

    /// Issue one RPC call and wait for its response body.
    ///
    /// Serializes the command, enforces the peer's request cap when known,
    /// encrypts when a session is active, fragments, sends, and waits with a
    /// bounded timeout. The response's method name must echo the request's.
    ///
    /// # Errors
    ///
    /// [`ClientError`] for local validation, transport, crypto, timeout, or
    /// peer-reported failures.
    pub async fn call(&self, method: &str, request: &[u8]) -> Result<Vec<u8>, ClientError> {
        let ticket = self.expect_response(method)?;
        if let Err(e) = self.send_request(method, request) {
            self.lock().pending = None;
            return Err(e);
        }
        self.wait_response(ticket).await
    }

    /// Send a request without claiming a response (client-push stream
    /// element, or the initiation of a server-push stream).
    ///
    /// # Errors
    ///
    /// Local validation or transport failure; nothing is awaited.
    pub fn send_request(&self, method: &str, request: &[u8]) -> Result<(), ClientError> {
        let mut command = Vec::new();
        serialize_command(CommandType::Request, method.as_bytes(), request, &mut command)?;

        let payload = {
            let mut state = self.lock();
            if state.lost {
                return Err(ClientError::TransportLost);
            }
            if let Some(caps) = &state.capabilities {
                let max = caps.max_request_payload_size;
                if max > 0 && command.len() > usize::from(max) {
                    return Err(ClientError::RequestTooLarge { len: command.len(), max });
                }
            }
            match state.crypto.as_mut() {
                Some(session) => session.encrypt(&command)?,
                None => command,
            }
        };

        let transaction_id = self.next_transaction_id();
        split_and_send(transaction_id, &payload, self.transport.mtu(), |frame| {
            self.transport.write(frame)
        })?;
        Ok(())
    }

    /// End a client-push stream.
    ///
    /// # Errors
    ///
    /// Transport failure.
    pub fn stream_upload_end(&self) -> Result<(), ClientError> {
        let transaction_id = self.next_transaction_id();
        self.send_control(transaction_id, ControlCommand::StreamEndC2p, &[])
    }

    /// Fetch the peripheral's capability record.
    ///
    /// A 4-byte legacy reply decodes with encryption unknown → off. The
    /// record is cached for request-cap enforcement.
    ///
    /// # Errors
    ///
    /// Transport failure, malformed reply, or [`ClientError::Timeout`].
    pub async fn request_capabilities(&self) -> Result<Capabilities, ClientError> {
        let rx = {
            let mut state = self.lock();
            if state.lost {
                return Err(ClientError::TransportLost);
            }
            if state.caps_waiter.is_some() {
                return Err(ClientError::Busy);
            }
            let (tx, rx) = oneshot::channel();
            state.caps_waiter = Some(tx);
            rx
        };

        let transaction_id = self.next_transaction_id();
        self.send_control(transaction_id, ControlCommand::Capabilities, &[])?;

        let payload = match tokio::time::timeout(self.config.control_timeout, rx).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(_)) => return Err(ClientError::TransportLost),
            Err(_) => {
                self.lock().caps_waiter = None;
                return Err(ClientError::Timeout("capabilities reply"));
            },
        };

        let caps = Capabilities::decode(&payload)?;
        self.lock().capabilities = Some(caps);
        Ok(caps)
    }

    /// Ask the peripheral for its configured RPC timeout, in milliseconds.
    ///
    /// # Errors
    ///
    /// Transport failure, malformed reply, or [`ClientError::Timeout`].
    pub async fn query_timeout(&self) -> Result<u16, ClientError> {
        let rx = {
            let mut state = self.lock();
            if state.lost {
                return Err(ClientError::TransportLost);
            }
            if state.timeout_waiter.is_some() {
                return Err(ClientError::Busy);
            }
            let (tx, rx) = oneshot::channel();
            state.timeout_waiter = Some(tx);
            rx
        };

        let transaction_id = self.next_transaction_id();
        self.send_control(transaction_id, ControlCommand::Timeout, &[])?;

        let payload = match tokio::time::timeout(self.config.control_timeout, rx).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(_)) => return Err(ClientError::TransportLost),
            Err(_) => {
                self.lock().timeout_waiter = None;
                return Err(ClientError::Timeout("timeout reply"));
            },
        };

        let timeout_ms = decode_timeout_ms(&payload)?;
        self.lock().server_timeout_ms = Some(timeout_ms);
        Ok(timeout_ms)
    }

    /// Run the three-round key exchange and switch the session to encrypted
    /// operation.
    ///
    /// Requires [`ClientConfig::server_identity`]; each round trip is
    /// bounded by [`ClientConfig::control_timeout`].
    ///
    /// # Errors
    ///
    /// - [`ClientError::IdentityRequired`] without a pinned identity
    /// - [`ClientError::Crypto`] for any handshake failure
    /// - [`ClientError::Timeout`] if the peripheral stops responding
    pub async fn perform_key_exchange(&self) -> Result<(), ClientError> {
        let identity = self.config.server_identity.ok_or(ClientError::IdentityRequired)?;

        let mut ephemeral = [0u8; 32];
        let mut nonce = [0u8; 16];
        if getrandom::fill(&mut ephemeral).is_err() || getrandom::fill(&mut nonce).is_err() {
            return Err(ClientError::RngUnavailable);
        }

        let mut kx = ClientKeyExchange::new();
        let step1 = kx.initiate(ephemeral, nonce);
        ephemeral.fill(0);
        let step2 = self.kx_round(&step1).await?;
        let step3 = kx.handle_step2(&step2, &identity)?;
        let step4 = self.kx_round(&step3).await?;
        let session = kx.handle_step4(&step4)?;

        self.lock().crypto = Some(session);
        tracing::info!("end-to-end encryption established");
        Ok(())
    }

    async fn kx_round(&self, message: &[u8]) -> Result<Vec<u8>, ClientError> {
        let rx = {
            let mut state = self.lock();
            if state.lost {
                return Err(ClientError::TransportLost);
            }
            if state.kx_waiter.is_some() {
                return Err(ClientError::Busy);
            }
            let (tx, rx) = oneshot::channel();
            state.kx_waiter = Some(tx);
            rx
        };

        let transaction_id = self.next_transaction_id();
        self.send_control(transaction_id, ControlCommand::KeyExchange, message)?;

        match tokio::time::timeout(self.config.control_timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(ClientError::TransportLost),
            Err(_) => {
                self.lock().kx_waiter = None;
                Err(ClientError::Timeout("key exchange reply"))
            },
        }
    }

    /// Deliver each response of a server-push stream for `method` to
    /// `callback`, until the stream-end frame.
    pub fn register_server_stream_handler(
        &self,
        method: &str,
        callback: impl Fn(Vec<u8>) + Send + Sync + 'static,
    ) {
        self.lock().stream_handlers.insert(method.to_string(), Arc::new(callback));
    }

    /// Remove the stream handler for `method`.
    pub fn clear_server_stream_handler(&self, method: &str) {
        self.lock().stream_handlers.remove(method);
    }

    /// Invoke `callback` when a peripheral-to-central stream ends.
    pub fn set_stream_end_handler(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.lock().stream_end_handler = Some(Arc::new(callback));
    }

    fn send_control(
        &self,
        transaction_id: u8,
        command: ControlCommand,
        payload: &[u8],
    ) -> Result<(), ClientError> {
        let mut buf = [0u8; tether_proto::CONTROL_HEADER_SIZE + 255];
        let n = Container::control(transaction_id, command, payload).serialize(&mut buf)?;
        self.transport.write(&buf[..n])?;
        Ok(())
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("encryption_active", &self.encryption_active())
            .finish_non_exhaustive()
    }
}
