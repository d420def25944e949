//! Peripheral service: the receive path.
//!
//! One [`Service`] per connection slot. The transport driver calls
//! [`Service::on_frame`] for every inbound container; the method only ever
//! does constant-time work — parse, answer control frames inline, copy into
//! the assembler, and hand completed requests to the dispatch worker. The
//! worker is a dedicated thread behind a capacity-1 channel: the Rust
//! rendering of the firmware's single request-work slot and work queue. The
//! protocol paces requests (a client waits for its response), so a request
//! arriving while the worker is busy is a peer bug and is dropped with a
//! warning rather than overwriting the slot.
//!
//! Lifecycle: [`connection_opened`](Service::connection_opened) resets the
//! assembler, transaction counter, and all crypto state;
//! [`connection_closed`](Service::connection_closed) does the same so key
//! material never survives a disconnect.

use std::sync::{Arc, mpsc};

use zeroize::Zeroize;

use tether_crypto::{HandshakeStep, ServerKeyExchange};
use tether_proto::{
    Assembler, CAPABILITY_ENCRYPTION_SUPPORTED, Capabilities, Container, ControlCommand,
    ErrorCode, FeedResult, encode_timeout_ms,
};

use crate::{
    config::ServerConfig,
    dispatch::Dispatcher,
    error::ServerError,
    handler::HandlerRegistry,
    sender::ServiceHandle,
    transport::Notify,
};

/// One assembled request on its way to the dispatch worker.
struct RequestJob {
    transaction_id: u8,
    payload: Vec<u8>,
}

/// Callback invoked when the client ends a central-to-peripheral stream.
type StreamEndHandler = Box<dyn Fn(u8) + Send>;

/// Peripheral-side protocol service.
pub struct Service {
    config: ServerConfig,
    handle: ServiceHandle,
    assembler: Assembler,
    kx: Option<ServerKeyExchange>,
    work_tx: mpsc::SyncSender<RequestJob>,
    stream_end_handler: Option<StreamEndHandler>,
}

impl Service {
    /// Build a service and spawn its dispatch worker.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Config`] for a malformed identity key
    /// - [`ServerError::Io`] if the worker thread cannot be spawned
    pub fn new(
        config: ServerConfig,
        transport: Arc<dyn Notify>,
        registry: HandlerRegistry,
    ) -> Result<Self, ServerError> {
        let kx = match &config.identity_key {
            Some(hex_key) => Some(load_identity(hex_key)?),
            None => None,
        };
        if let Some(kx) = &kx {
            tracing::info!(
                identity = %hex::encode(kx.identity_public_key()),
                "encryption enabled"
            );
        }

        let handle = ServiceHandle::new(transport);
        let dispatcher = Dispatcher::new(registry, handle.clone(), &config);

        let (work_tx, work_rx) = mpsc::sync_channel::<RequestJob>(1);
        let mut builder = std::thread::Builder::new().name("tether-dispatch".to_string());
        if let Some(stack_size) = config.work_stack_size {
            builder = builder.stack_size(stack_size);
        }
        // The worker exits when the service (and with it `work_tx`) drops.
        let _worker = builder.spawn(move || {
            while let Ok(job) = work_rx.recv() {
                dispatcher.process_request(job.transaction_id, &job.payload);
            }
        })?;

        let assembler = Assembler::new(config.assembler_buf_size);
        Ok(Self { config, handle, assembler, kx, work_tx, stream_end_handler: None })
    }

    /// Outbound facilities, for stream handlers and their callbacks.
    #[must_use]
    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    /// Register the callback for
    /// [`ControlCommand::StreamEndC2p`] frames.
    pub fn set_stream_end_handler(&mut self, handler: impl Fn(u8) + Send + 'static) {
        self.stream_end_handler = Some(Box::new(handler));
    }

    /// Capability record reported to clients.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_request_payload_size: u16::try_from(self.config.assembler_buf_size)
                .unwrap_or(u16::MAX),
            max_response_payload_size: u16::try_from(self.config.max_response_payload_size)
                .unwrap_or(u16::MAX),
            flags: if self.kx.is_some() { CAPABILITY_ENCRYPTION_SUPPORTED } else { 0 },
        }
    }

    /// A peer connected: start the session from a clean slate.
    pub fn connection_opened(&mut self) {
        tracing::info!("connected");
        self.reset_session_state();
    }

    /// The peer disconnected: drop all session state and key material.
    pub fn connection_closed(&mut self) {
        tracing::info!("disconnected");
        self.reset_session_state();
    }

    fn reset_session_state(&mut self) {
        self.assembler.reset();
        self.handle.clear_session();
        self.handle.reset_transaction_counter();
        if let Some(kx) = self.kx.as_mut() {
            kx.reset();
        }
    }

    /// Process one inbound container.
    ///
    /// Framing errors are recovered locally (assembler reset, warning log)
    /// and are silent to the peer.
    pub fn on_frame(&mut self, bytes: &[u8]) {
        let container = match Container::parse(bytes) {
            Ok(container) => container,
            Err(e) => {
                tracing::warn!(error = %e, "container parse failed");
                return;
            },
        };

        match container {
            Container::Control { transaction_id, command, payload } => {
                self.on_control(transaction_id, command, payload);
            },
            data => self.on_data(&data),
        }
    }

    /// Control fast path: handled inline, never via the work queue.
    fn on_control(&mut self, transaction_id: u8, command: u8, payload: &[u8]) {
        match ControlCommand::from_raw(command) {
            Some(ControlCommand::Timeout) => {
                let reply = encode_timeout_ms(self.config.timeout_ms);
                if let Err(e) =
                    self.handle.send_control(transaction_id, ControlCommand::Timeout, &reply)
                {
                    tracing::warn!(error = %e, "timeout reply failed");
                }
            },

            Some(ControlCommand::Capabilities) => {
                let caps = self.capabilities().encode();
                if let Err(e) =
                    self.handle.send_control(transaction_id, ControlCommand::Capabilities, &caps)
                {
                    tracing::warn!(error = %e, "capabilities reply failed");
                }
            },

            Some(ControlCommand::StreamEndC2p) => {
                if let Some(callback) = &self.stream_end_handler {
                    callback(transaction_id);
                }
            },

            Some(ControlCommand::KeyExchange) => {
                self.on_key_exchange(transaction_id, payload);
            },

            Some(other) => {
                tracing::debug!(command = ?other, "control command not addressed to a peripheral");
            },

            None => {
                tracing::debug!(command, "ignoring reserved control command");
            },
        }
    }

    fn on_key_exchange(&mut self, transaction_id: u8, payload: &[u8]) {
        let Some(kx) = self.kx.as_mut() else {
            tracing::warn!("key exchange attempted but encryption is disabled");
            return;
        };
        if self.handle.encryption_active() {
            tracing::warn!("key exchange rejected: encryption already active");
            return;
        }

        if kx.step() == HandshakeStep::AwaitingConfirmation {
            match kx.handle_step3(payload) {
                Ok((step4, session)) => {
                    if let Err(e) = self.handle.send_control_retried(
                        transaction_id,
                        ControlCommand::KeyExchange,
                        &step4,
                    ) {
                        tracing::error!(error = %e, "key exchange step 4 send failed");
                        return;
                    }
                    self.handle.install_session(session);
                    tracing::info!("end-to-end encryption established");
                },
                Err(e) => tracing::warn!(error = %e, "key exchange confirmation failed"),
            }
        } else {
            let mut ephemeral = [0u8; 32];
            let mut nonce = [0u8; 16];
            if getrandom::fill(&mut ephemeral).is_err() || getrandom::fill(&mut nonce).is_err() {
                tracing::error!("system rng unavailable; key exchange aborted");
                return;
            }

            let result = kx.handle_step1(payload, ephemeral, nonce);
            ephemeral.zeroize();
            match result {
                Ok(step2) => {
                    if let Err(e) = self.handle.send_control_retried(
                        transaction_id,
                        ControlCommand::KeyExchange,
                        &step2,
                    ) {
                        tracing::error!(error = %e, "key exchange step 2 send failed");
                    }
                },
                Err(e) => tracing::warn!(error = %e, "key exchange step 1 failed"),
            }
        }
    }

    fn on_data(&mut self, container: &Container<'_>) {
        match self.assembler.feed(container) {
            Ok(FeedResult::Incomplete) => {},

            Ok(FeedResult::Complete) => {
                let transaction_id = container.transaction_id();
                let payload = if self.kx.is_some() {
                    if self.handle.encryption_active() {
                        match self.handle.decrypt(self.assembler.payload()) {
                            Ok(plain) => plain,
                            Err(e) => {
                                // Crypto failures are fatal to the session: a
                                // peer that produced one bad tag is not
                                // trusted to produce good ones.
                                tracing::warn!(error = %e, "decryption failed; tearing down session");
                                self.teardown_crypto();
                                self.assembler.reset();
                                return;
                            },
                        }
                    } else {
                        tracing::warn!("rejecting unencrypted payload (encryption required)");
                        if let Err(e) = self
                            .handle
                            .send_error(transaction_id, ErrorCode::NotEncryptedWhenRequired)
                        {
                            tracing::warn!(error = %e, "error frame send failed");
                        }
                        self.assembler.reset();
                        return;
                    }
                } else {
                    self.assembler.payload().to_vec()
                };
                self.assembler.reset();

                match self.work_tx.try_send(RequestJob { transaction_id, payload }) {
                    Ok(()) => {},
                    Err(mpsc::TrySendError::Full(_)) => {
                        tracing::warn!(
                            transaction_id,
                            "request dropped: dispatch worker still busy"
                        );
                    },
                    Err(mpsc::TrySendError::Disconnected(_)) => {
                        tracing::error!("dispatch worker is gone");
                    },
                }
            },

            Err(e) => {
                tracing::warn!(error = %e, "framing error; assembler reset");
            },
        }
    }

    fn teardown_crypto(&mut self) {
        self.handle.clear_session();
        if let Some(kx) = self.kx.as_mut() {
            kx.reset();
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("encryption_configured", &self.kx.is_some())
            .field("encryption_active", &self.handle.encryption_active())
            .finish_non_exhaustive()
    }
}

fn load_identity(hex_key: &str) -> Result<ServerKeyExchange, ServerError> {
    let mut decoded = hex::decode(hex_key)
        .map_err(|e| ServerError::Config(format!("identity key is not valid hex: {e}")))?;
    if decoded.len() != 32 {
        decoded.zeroize();
        return Err(ServerError::Config(format!(
            "identity key must be 64 hex chars, got {}",
            hex_key.len()
        )));
    }

    let mut seed = [0u8; 32];
    seed.copy_from_slice(&decoded);
    decoded.zeroize();
    let kx = ServerKeyExchange::new(&seed);
    seed.zeroize();
    Ok(kx)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use tether_crypto::ClientKeyExchange;
    use tether_proto::{
        CommandPacket, CommandType, decode_timeout_ms, serialize_command, split_and_send,
    };

    use super::*;
    use crate::{
        handler::{
            CommandHandler, HandlerError, HandlerOutcome, RequestContext, ResponseSink,
        },
        transport::{Notify, NotifyError},
    };

    #[derive(Default)]
    struct RecordingTransport {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl Notify for RecordingTransport {
        fn notify(&self, frame: &[u8]) -> Result<(), NotifyError> {
            self.frames.lock().unwrap().push(frame.to_vec());
            Ok(())
        }

        fn mtu(&self) -> u16 {
            247
        }
    }

    impl RecordingTransport {
        fn frames(&self) -> Vec<Vec<u8>> {
            self.frames.lock().unwrap().clone()
        }

        /// Wait for the dispatch worker to emit at least `n` frames.
        fn wait_for_frames(&self, n: usize) -> Vec<Vec<u8>> {
            for _ in 0..200 {
                let frames = self.frames();
                if frames.len() >= n {
                    return frames;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            panic!("timed out waiting for {n} outbound frames");
        }
    }

    struct UpperEcho;

    impl CommandHandler for UpperEcho {
        fn handle(
            &self,
            _ctx: &RequestContext<'_>,
            request: &[u8],
            out: &mut dyn ResponseSink,
        ) -> Result<HandlerOutcome, HandlerError> {
            let upper: Vec<u8> = request.iter().map(u8::to_ascii_uppercase).collect();
            out.write_all(&upper)?;
            Ok(HandlerOutcome::Reply)
        }
    }

    fn service_with(config: ServerConfig) -> (Service, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let mut registry = HandlerRegistry::new();
        registry.register("shout", Arc::new(UpperEcho));
        let service = Service::new(config, transport.clone(), registry).unwrap();
        (service, transport)
    }

    fn control_frame(transaction_id: u8, command: ControlCommand, payload: &[u8]) -> Vec<u8> {
        let mut buf = [0u8; 300];
        let n = Container::control(transaction_id, command, payload).serialize(&mut buf).unwrap();
        buf[..n].to_vec()
    }

    fn request_frames(transaction_id: u8, name: &str, body: &[u8]) -> Vec<Vec<u8>> {
        let mut cmd = Vec::new();
        serialize_command(CommandType::Request, name.as_bytes(), body, &mut cmd).unwrap();
        let mut frames = Vec::new();
        split_and_send::<NotifyError, _>(transaction_id, &cmd, 247, |f| {
            frames.push(f.to_vec());
            Ok(())
        })
        .unwrap();
        frames
    }

    #[test]
    fn capabilities_query_is_answered_inline() {
        let (mut service, transport) = service_with(ServerConfig::default());

        service.on_frame(&control_frame(3, ControlCommand::Capabilities, &[]));

        let frames = transport.frames();
        assert_eq!(frames.len(), 1);
        let Container::Control { transaction_id, command, payload } =
            Container::parse(&frames[0]).unwrap()
        else {
            panic!("expected control reply");
        };
        assert_eq!(transaction_id, 3);
        assert_eq!(ControlCommand::from_raw(command), Some(ControlCommand::Capabilities));

        let caps = Capabilities::decode(payload).unwrap();
        assert_eq!(caps.max_request_payload_size, 4096);
        assert_eq!(caps.max_response_payload_size, 4096);
        assert!(!caps.supports_encryption());
    }

    #[test]
    fn capabilities_advertise_encryption_when_configured() {
        let config = ServerConfig {
            identity_key: Some("11".repeat(32)),
            ..ServerConfig::default()
        };
        let (service, _transport) = service_with(config);
        assert!(service.capabilities().supports_encryption());
    }

    #[test]
    fn timeout_query_echoes_configured_timeout() {
        let config = ServerConfig { timeout_ms: 200, ..ServerConfig::default() };
        let (mut service, transport) = service_with(config);

        service.on_frame(&control_frame(5, ControlCommand::Timeout, &[]));

        let frames = transport.frames();
        let Container::Control { payload, .. } = Container::parse(&frames[0]).unwrap() else {
            panic!("expected control reply");
        };
        assert_eq!(decode_timeout_ms(payload), Ok(200));
    }

    #[test]
    fn request_is_dispatched_and_answered() {
        let (mut service, transport) = service_with(ServerConfig::default());

        for frame in request_frames(7, "shout", b"quiet") {
            service.on_frame(&frame);
        }

        let frames = transport.wait_for_frames(1);
        let response = Container::parse(&frames[0]).unwrap();
        assert_eq!(response.transaction_id(), 7);
        let packet = CommandPacket::parse(response.payload()).unwrap();
        assert_eq!(packet.cmd_type, CommandType::Response);
        assert_eq!(packet.name, b"shout");
        assert_eq!(packet.data, b"QUIET");
    }

    #[test]
    fn stream_end_callback_fires() {
        let (mut service, _transport) = service_with(ServerConfig::default());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        service.set_stream_end_handler(move |tid| sink.lock().unwrap().push(tid));

        service.on_frame(&control_frame(9, ControlCommand::StreamEndC2p, &[]));
        assert_eq!(*seen.lock().unwrap(), vec![9]);
    }

    #[test]
    fn malformed_container_is_ignored() {
        let (mut service, transport) = service_with(ServerConfig::default());
        service.on_frame(&[0x00, 0x00, 0b1000_0000, 0x00]);
        assert!(transport.frames().is_empty());
    }

    #[test]
    fn unencrypted_request_is_rejected_when_encryption_required() {
        let config = ServerConfig {
            identity_key: Some("22".repeat(32)),
            ..ServerConfig::default()
        };
        let (mut service, transport) = service_with(config);

        for frame in request_frames(1, "shout", b"hi") {
            service.on_frame(&frame);
        }

        let frames = transport.frames();
        assert_eq!(frames.len(), 1);
        let Container::Control { command, payload, .. } =
            Container::parse(&frames[0]).unwrap()
        else {
            panic!("expected error frame");
        };
        assert_eq!(ControlCommand::from_raw(command), Some(ControlCommand::Error));
        assert_eq!(payload, [ErrorCode::NotEncryptedWhenRequired.raw()]);
    }

    #[test]
    fn key_exchange_establishes_encrypted_dispatch() {
        let config = ServerConfig {
            identity_key: Some("33".repeat(32)),
            ..ServerConfig::default()
        };
        let (mut service, transport) = service_with(config);
        service.connection_opened();

        let identity = {
            let seed = [0x33u8; 32];
            ServerKeyExchange::new(&seed).identity_public_key()
        };

        // Drive the client side of the handshake against the service.
        let mut client_kx = ClientKeyExchange::new();
        let step1 = client_kx.initiate([0x01; 32], [0x02; 16]);
        service.on_frame(&control_frame(0, ControlCommand::KeyExchange, &step1));

        let step2_frame = transport.frames().pop().unwrap();
        let Container::Control { payload: step2, .. } =
            Container::parse(&step2_frame).unwrap()
        else {
            panic!("expected step 2");
        };
        let step3 = client_kx.handle_step2(step2, &identity).unwrap();
        service.on_frame(&control_frame(0, ControlCommand::KeyExchange, &step3));

        let step4_frame = transport.frames().pop().unwrap();
        let Container::Control { payload: step4, .. } =
            Container::parse(&step4_frame).unwrap()
        else {
            panic!("expected step 4");
        };
        let mut session = client_kx.handle_step4(step4).unwrap();

        // A fresh key exchange is now refused.
        let refused_before = transport.frames().len();
        service.on_frame(&control_frame(0, ControlCommand::KeyExchange, &step1));
        assert_eq!(transport.frames().len(), refused_before);

        // An encrypted request round-trips.
        let mut cmd = Vec::new();
        serialize_command(CommandType::Request, b"shout", b"psst", &mut cmd).unwrap();
        let ciphertext = session.encrypt(&cmd).unwrap();
        let mut frames = Vec::new();
        split_and_send::<NotifyError, _>(1, &ciphertext, 247, |f| {
            frames.push(f.to_vec());
            Ok(())
        })
        .unwrap();
        for frame in frames {
            service.on_frame(&frame);
        }

        let outbound = transport.wait_for_frames(refused_before + 1);
        let response = Container::parse(&outbound[outbound.len() - 1]).unwrap();
        let plain = session.decrypt(response.payload()).unwrap();
        let packet = CommandPacket::parse(&plain).unwrap();
        assert_eq!(packet.data, b"PSST");
    }
}
