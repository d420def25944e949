//! Request dispatch engine.
//!
//! Runs on the dispatch worker, one assembled (and already decrypted) request
//! at a time: parse the command envelope, look up the handler, invoke it in
//! two passes. Pass 1 writes into a counting sink to learn the response size
//! — rejected against the configured cap before a single response byte hits
//! the wire. Pass 2 encodes for real:
//!
//! - **Plain sessions** stream straight into outbound containers through a
//!   [`FrameWriter`]; no response-sized buffer exists anywhere.
//! - **Encrypted sessions** must stage the whole command payload first — the
//!   AEAD needs the complete plaintext and appends a trailing tag — then the
//!   ciphertext goes through the one-shot splitter.
//!
//! Failures are reported to the client as control/error frames; the session
//! itself survives anything a handler can do.

use tether_proto::{
    CommandPacket, CommandType, ErrorCode, FrameWriter, serialize_header,
};

use crate::{
    config::ServerConfig,
    handler::{
        HandlerError, HandlerOutcome, HandlerRegistry, RequestContext, ResponseSink, SinkError,
    },
    sender::ServiceHandle,
    transport::NotifyError,
};

/// Counts bytes and discards them (pass 1).
#[derive(Default)]
struct SizingSink {
    written: usize,
}

impl ResponseSink for SizingSink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        self.written += bytes.len();
        Ok(())
    }
}

/// Stages the full command payload for encryption (pass 2, encrypted path).
struct StagingSink {
    buf: Vec<u8>,
    capacity: usize,
}

impl StagingSink {
    fn new(buf: Vec<u8>, capacity: usize) -> Self {
        Self { buf, capacity }
    }
}

impl ResponseSink for StagingSink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        if self.buf.len() + bytes.len() > self.capacity {
            return Err(SinkError::new(format!(
                "staging buffer full ({} bytes)",
                self.capacity
            )));
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }
}

/// Feeds outbound containers as bytes arrive (pass 2, plain path).
struct StreamingSink<'a, F> {
    writer: &'a mut FrameWriter<F>,
}

impl<F> ResponseSink for StreamingSink<'_, F>
where
    F: FnMut(&[u8]) -> Result<(), NotifyError>,
{
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        self.writer.write(bytes).map_err(SinkError::new)
    }
}

fn code_for(error: &HandlerError) -> ErrorCode {
    match error {
        HandlerError::Decode(_) => ErrorCode::DecodeFailed,
        HandlerError::Failed(_) | HandlerError::Sink(_) => ErrorCode::HandlerFailed,
    }
}

/// Two-pass request dispatcher.
pub(crate) struct Dispatcher {
    registry: HandlerRegistry,
    handle: ServiceHandle,
    max_response_payload_size: usize,
    staging_capacity: usize,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: HandlerRegistry,
        handle: ServiceHandle,
        config: &ServerConfig,
    ) -> Self {
        Self {
            registry,
            handle,
            max_response_payload_size: config.max_response_payload_size,
            staging_capacity: config.assembler_buf_size,
        }
    }

    /// Dispatch one assembled, decrypted request payload.
    ///
    /// Never fails upward: every failure mode is logged and, where the
    /// protocol defines one, reported to the client as a control/error frame.
    pub(crate) fn process_request(&self, transaction_id: u8, payload: &[u8]) {
        let packet = match CommandPacket::parse(payload) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(error = %e, "request command parse failed");
                self.report(transaction_id, ErrorCode::DecodeFailed);
                return;
            },
        };

        if packet.cmd_type != CommandType::Request {
            tracing::warn!("expected request, got response packet");
            self.report(transaction_id, ErrorCode::DecodeFailed);
            return;
        }

        let name = String::from_utf8_lossy(packet.name).into_owned();
        let Some(handler) = self.registry.lookup(packet.name) else {
            tracing::warn!(command = %name, "unknown command");
            self.report(transaction_id, ErrorCode::UnknownCommand);
            return;
        };

        let ctx = RequestContext::new(transaction_id, &self.handle);

        // Pass 1: size the response without producing it.
        let mut sizing = SizingSink::default();
        match handler.handle(&ctx, packet.data, &mut sizing) {
            Ok(HandlerOutcome::SkipResponse) => return,
            Ok(HandlerOutcome::Reply) => {},
            Err(e) => {
                tracing::warn!(command = %name, error = %e, "handler sizing pass failed");
                self.report(transaction_id, code_for(&e));
                return;
            },
        }

        let body_size = sizing.written;
        let total_length = CommandPacket::wire_size(packet.name.len(), body_size);
        let too_large = total_length > self.max_response_payload_size;
        let Ok(total_u16) = u16::try_from(total_length) else {
            tracing::warn!(command = %name, total_length, "response exceeds u16 framing limit");
            self.report(transaction_id, ErrorCode::ResponseTooLarge);
            return;
        };
        if too_large {
            tracing::warn!(
                command = %name,
                total_length,
                max = self.max_response_payload_size,
                "response too large"
            );
            self.report(transaction_id, ErrorCode::ResponseTooLarge);
            return;
        }

        // INVARIANT: body_size <= total_length <= u16::MAX, checked above.
        let body_u16 = body_size as u16;

        if self.handle.encryption_active() {
            self.respond_encrypted(&ctx, handler, &packet, &name, body_u16);
        } else {
            self.respond_streaming(&ctx, handler, &packet, &name, total_u16, body_u16);
        }
    }

    /// Pass 2, encrypted: stage, encrypt, split.
    fn respond_encrypted(
        &self,
        ctx: &RequestContext<'_>,
        handler: &dyn crate::handler::CommandHandler,
        packet: &CommandPacket<'_>,
        name: &str,
        body_size: u16,
    ) {
        let mut plain = Vec::with_capacity(
            CommandPacket::wire_size(packet.name.len(), usize::from(body_size)),
        );
        if let Err(e) = serialize_header(CommandType::Response, packet.name, body_size, &mut plain)
        {
            tracing::error!(command = %name, error = %e, "response header build failed");
            self.report(ctx.transaction_id, ErrorCode::HandlerFailed);
            return;
        }

        let mut sink = StagingSink::new(plain, self.staging_capacity);
        if let Err(e) = handler.handle(ctx, packet.data, &mut sink) {
            tracing::warn!(command = %name, error = %e, "handler encode pass failed");
            self.report(ctx.transaction_id, code_for(&e));
            return;
        }

        let expected = CommandPacket::wire_size(packet.name.len(), usize::from(body_size));
        if sink.buf.len() != expected {
            tracing::error!(
                command = %name,
                sized = expected,
                encoded = sink.buf.len(),
                "handler was not deterministic across passes"
            );
            self.report(ctx.transaction_id, ErrorCode::HandlerFailed);
            return;
        }

        if let Err(e) = self.handle.send_command_response(ctx.transaction_id, &sink.buf) {
            tracing::error!(command = %name, error = %e, "encrypted response send failed");
        }
    }

    /// Pass 2, plain: stream containers as the handler encodes.
    fn respond_streaming(
        &self,
        ctx: &RequestContext<'_>,
        handler: &dyn crate::handler::CommandHandler,
        packet: &CommandPacket<'_>,
        name: &str,
        total_length: u16,
        body_size: u16,
    ) {
        let handle = self.handle.clone();
        let mut writer = match FrameWriter::new(
            ctx.transaction_id,
            total_length,
            handle.mtu(),
            move |frame: &[u8]| handle.send_with_retry(frame),
        ) {
            Ok(writer) => writer,
            Err(e) => {
                tracing::error!(error = %e, "response stream setup failed");
                self.report(ctx.transaction_id, ErrorCode::HandlerFailed);
                return;
            },
        };

        let mut header = Vec::with_capacity(4 + packet.name.len());
        if let Err(e) = serialize_header(CommandType::Response, packet.name, body_size, &mut header)
        {
            tracing::error!(command = %name, error = %e, "response header build failed");
            self.report(ctx.transaction_id, ErrorCode::HandlerFailed);
            return;
        }
        if let Err(e) = writer.write(&header) {
            tracing::error!(command = %name, error = %e, "response header send failed");
            return;
        }

        let mut sink = StreamingSink { writer: &mut writer };
        if let Err(e) = handler.handle(ctx, packet.data, &mut sink) {
            // Containers may already be on the wire; the client's call fails
            // on the error frame and its assembler resets on the next first
            // container.
            tracing::warn!(command = %name, error = %e, "handler encode pass failed");
            self.report(ctx.transaction_id, code_for(&e));
            return;
        }

        if let Err(e) = writer.finish() {
            tracing::error!(command = %name, error = %e, "response stream flush failed");
        }
    }

    fn report(&self, transaction_id: u8, code: ErrorCode) {
        if let Err(e) = self.handle.send_error(transaction_id, code) {
            tracing::error!(error = %e, ?code, "failed to send error frame");
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("registry", &self.registry).finish_non_exhaustive()
    }
}
