//! Bundled RPC handlers.
//!
//! The method set the reference peripheral ships: an echo, a bulk write
//! sink, a bounded flash read, and the two stream demonstrations
//! (peripheral-push `counter_stream`, central-push `counter_upload`).
//! Request and response bodies are CBOR-encoded structs; the protocol core
//! treats them as opaque bytes, so a deployment with different methods drops
//! this module entirely.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use tether_proto::{CommandType, serialize_command};

use crate::{
    handler::{
        CommandHandler, HandlerError, HandlerOutcome, HandlerRegistry, RequestContext,
        ResponseSink, SinkWriter,
    },
    sender::ServiceHandle,
};

/// Largest flash read a single request may ask for.
const MAX_FLASH_READ_SIZE: u32 = 8192;

/// Largest count a `counter_stream` request may ask for.
const MAX_COUNTER_STREAM_COUNT: u32 = 10_000;

// ── Message bodies ───────────────────────────────────────────────────────

/// `echo` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoRequest {
    /// Text to echo back.
    pub message: String,
}

/// `echo` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoResponse {
    /// The request text, unchanged.
    pub message: String,
}

/// `data_write` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataWriteRequest {
    /// Opaque bytes; the handler only counts them.
    pub data: Vec<u8>,
}

/// `data_write` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataWriteResponse {
    /// Number of bytes received.
    pub length: u32,
}

/// `flash_read` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashReadRequest {
    /// Byte offset to read from.
    pub address: u32,
    /// Bytes to read.
    pub length: u32,
}

/// `flash_read` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashReadResponse {
    /// Echoed read offset.
    pub address: u32,
    /// The bytes read.
    pub data: Vec<u8>,
}

/// `counter_stream` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterStreamRequest {
    /// Number of stream responses to produce.
    pub count: u32,
}

/// One `counter_stream` stream response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterStreamResponse {
    /// Position in the stream, from 0.
    pub seq: u32,
    /// `seq * 10`.
    pub value: i32,
}

/// One `counter_upload` stream request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterUploadRequest {
    /// Position in the upload stream.
    pub seq: u32,
    /// Arbitrary client value.
    pub value: i32,
}

/// `counter_upload` summary response, sent after the stream ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterUploadResponse {
    /// Requests received since the previous stream end.
    pub received_count: u32,
}

fn decode_request<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, HandlerError> {
    ciborium::from_reader(bytes).map_err(|e| HandlerError::Decode(e.to_string()))
}

fn encode_response<T: Serialize>(
    value: &T,
    out: &mut dyn ResponseSink,
) -> Result<(), HandlerError> {
    ciborium::into_writer(value, SinkWriter(out))
        .map_err(|e| HandlerError::Failed(e.to_string()))
}

/// Serialize a self-managed response command for `method`.
fn stream_response_bytes<T: Serialize>(method: &str, value: &T) -> Result<Vec<u8>, HandlerError> {
    let mut body = Vec::new();
    ciborium::into_writer(value, &mut body).map_err(|e| HandlerError::Failed(e.to_string()))?;

    let mut command = Vec::new();
    serialize_command(CommandType::Response, method.as_bytes(), &body, &mut command)
        .map_err(|e| HandlerError::Failed(e.to_string()))?;
    Ok(command)
}

// ── echo ─────────────────────────────────────────────────────────────────

/// Echoes the request message back.
#[derive(Debug, Default)]
pub struct EchoHandler;

impl CommandHandler for EchoHandler {
    fn handle(
        &self,
        _ctx: &RequestContext<'_>,
        request: &[u8],
        out: &mut dyn ResponseSink,
    ) -> Result<HandlerOutcome, HandlerError> {
        let req: EchoRequest = decode_request(request)?;
        tracing::info!(message = %req.message, "echo");

        encode_response(&EchoResponse { message: req.message }, out)?;
        Ok(HandlerOutcome::Reply)
    }
}

// ── data_write ───────────────────────────────────────────────────────────

/// Accepts a blob and reports how many bytes arrived.
#[derive(Debug, Default)]
pub struct DataWriteHandler;

impl CommandHandler for DataWriteHandler {
    fn handle(
        &self,
        _ctx: &RequestContext<'_>,
        request: &[u8],
        out: &mut dyn ResponseSink,
    ) -> Result<HandlerOutcome, HandlerError> {
        let req: DataWriteRequest = decode_request(request)?;
        let length = req.data.len() as u32;
        tracing::info!(length, "data write");

        encode_response(&DataWriteResponse { length }, out)?;
        Ok(HandlerOutcome::Reply)
    }
}

// ── flash_read ───────────────────────────────────────────────────────────

/// Flash read failure reported by a backend.
#[derive(Debug, Error)]
#[error("flash read failed at {address:#010x}: {reason}")]
pub struct FlashError {
    /// Offset the read started at.
    pub address: u32,
    /// Backend-specific description.
    pub reason: String,
}

/// Byte-addressable read-only storage behind `flash_read`.
///
/// Reads must be repeatable: the dispatcher invokes the handler twice per
/// request and both passes must produce identical bytes.
pub trait FlashBackend: Send + Sync {
    /// Device size in bytes.
    fn size(&self) -> u32;

    /// Fill `out` starting at `address`. Bounds are pre-checked by the
    /// handler.
    ///
    /// # Errors
    ///
    /// [`FlashError`] on a device-level failure.
    fn read(&self, address: u32, out: &mut [u8]) -> Result<(), FlashError>;
}

/// In-memory [`FlashBackend`] with a deterministic fill pattern.
#[derive(Debug)]
pub struct MemFlash {
    data: Vec<u8>,
}

impl MemFlash {
    /// A device of `size` bytes where byte `i` is `i & 0xFF`.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self { data: (0..size).map(|i| (i & 0xFF) as u8).collect() }
    }
}

impl FlashBackend for MemFlash {
    fn size(&self) -> u32 {
        self.data.len() as u32
    }

    fn read(&self, address: u32, out: &mut [u8]) -> Result<(), FlashError> {
        let start = address as usize;
        let slice = self
            .data
            .get(start..start + out.len())
            .ok_or_else(|| FlashError { address, reason: "out of bounds".to_string() })?;
        out.copy_from_slice(slice);
        Ok(())
    }
}

/// Reads a bounded range from a [`FlashBackend`].
pub struct FlashReadHandler {
    backend: Arc<dyn FlashBackend>,
    /// Highest address (exclusive) reads may touch; 0 means unbounded.
    max_address: u32,
}

impl FlashReadHandler {
    /// Wrap `backend`, optionally restricting reads below `max_address`.
    #[must_use]
    pub fn new(backend: Arc<dyn FlashBackend>, max_address: u32) -> Self {
        Self { backend, max_address }
    }
}

impl CommandHandler for FlashReadHandler {
    fn handle(
        &self,
        _ctx: &RequestContext<'_>,
        request: &[u8],
        out: &mut dyn ResponseSink,
    ) -> Result<HandlerOutcome, HandlerError> {
        let req: FlashReadRequest = decode_request(request)?;
        tracing::info!(address = req.address, length = req.length, "flash read");

        if req.length > MAX_FLASH_READ_SIZE {
            return Err(HandlerError::Failed(format!(
                "read of {} bytes exceeds maximum {MAX_FLASH_READ_SIZE}",
                req.length
            )));
        }

        // u64 arithmetic sidesteps address + length wrap-around.
        let end = u64::from(req.address) + u64::from(req.length);
        if self.max_address > 0 && req.length > 0 && end > u64::from(self.max_address) {
            return Err(HandlerError::Failed(format!(
                "read past configured limit {:#010x}",
                self.max_address
            )));
        }
        if req.length > 0 && end > u64::from(self.backend.size()) {
            return Err(HandlerError::Failed(format!(
                "read past end of device ({} bytes)",
                self.backend.size()
            )));
        }

        let mut data = vec![0u8; req.length as usize];
        self.backend
            .read(req.address, &mut data)
            .map_err(|e| HandlerError::Failed(e.to_string()))?;

        encode_response(&FlashReadResponse { address: req.address, data }, out)?;
        Ok(HandlerOutcome::Reply)
    }
}

impl std::fmt::Debug for FlashReadHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashReadHandler")
            .field("max_address", &self.max_address)
            .finish_non_exhaustive()
    }
}

// ── counter_stream (peripheral → central) ────────────────────────────────

/// Streams `count` responses, each in its own transaction, then a
/// stream-end control frame.
#[derive(Debug, Default)]
pub struct CounterStreamHandler;

impl CommandHandler for CounterStreamHandler {
    fn handle(
        &self,
        ctx: &RequestContext<'_>,
        request: &[u8],
        _out: &mut dyn ResponseSink,
    ) -> Result<HandlerOutcome, HandlerError> {
        let req: CounterStreamRequest = decode_request(request)?;
        tracing::info!(count = req.count, "counter stream");

        if req.count > MAX_COUNTER_STREAM_COUNT {
            return Err(HandlerError::Failed(format!(
                "count {} exceeds maximum {MAX_COUNTER_STREAM_COUNT}",
                req.count
            )));
        }

        let handle = ctx.handle();
        for seq in 0..req.count {
            let response =
                CounterStreamResponse { seq, value: (seq * 10) as i32 };
            let command = stream_response_bytes("counter_stream", &response)?;
            let transaction_id = handle.next_transaction_id();
            handle
                .send_command_response(transaction_id, &command)
                .map_err(|e| HandlerError::Failed(e.to_string()))?;
        }

        let transaction_id = handle.next_transaction_id();
        handle.send_stream_end(transaction_id).map_err(|e| HandlerError::Failed(e.to_string()))?;

        Ok(HandlerOutcome::SkipResponse)
    }
}

// ── counter_upload (central → peripheral) ────────────────────────────────

/// Accumulates upload requests; the summary goes out when the client sends
/// the stream-end control frame.
#[derive(Debug, Default)]
pub struct CounterUploadHandler {
    received: AtomicU32,
}

impl CounterUploadHandler {
    /// Create an idle accumulator.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Requests received since the last stream end.
    #[must_use]
    pub fn received(&self) -> u32 {
        self.received.load(Ordering::Relaxed)
    }

    /// Callback for [`Service::set_stream_end_handler`]: sends the summary
    /// response and resets the counter.
    ///
    /// [`Service::set_stream_end_handler`]: crate::Service::set_stream_end_handler
    pub fn stream_end_responder(
        self: &Arc<Self>,
        handle: ServiceHandle,
    ) -> impl Fn(u8) + Send + 'static {
        let this = Arc::clone(self);
        move |_transaction_id| {
            let received_count = this.received.swap(0, Ordering::SeqCst);
            tracing::info!(received_count, "upload stream ended; sending summary");

            let command =
                match stream_response_bytes("counter_upload", &CounterUploadResponse {
                    received_count,
                }) {
                    Ok(command) => command,
                    Err(e) => {
                        tracing::error!(error = %e, "upload summary encode failed");
                        return;
                    },
                };

            let transaction_id = handle.next_transaction_id();
            if let Err(e) = handle.send_command_response(transaction_id, &command) {
                tracing::error!(error = %e, "upload summary send failed");
            }
        }
    }
}

impl CommandHandler for CounterUploadHandler {
    fn handle(
        &self,
        _ctx: &RequestContext<'_>,
        request: &[u8],
        _out: &mut dyn ResponseSink,
    ) -> Result<HandlerOutcome, HandlerError> {
        let req: CounterUploadRequest = decode_request(request)?;
        let total = self.received.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(seq = req.seq, value = req.value, total, "counter upload");

        // Individual stream requests get no response.
        Ok(HandlerOutcome::SkipResponse)
    }
}

/// Register the bundled method set.
///
/// Returns the upload accumulator so the caller can wire its
/// [`stream_end_responder`](CounterUploadHandler::stream_end_responder) into
/// the service.
pub fn install_defaults(
    registry: &mut HandlerRegistry,
    flash: Arc<dyn FlashBackend>,
    max_flash_address: u32,
) -> Arc<CounterUploadHandler> {
    registry.register("echo", Arc::new(EchoHandler));
    registry.register("data_write", Arc::new(DataWriteHandler));
    registry.register("flash_read", Arc::new(FlashReadHandler::new(flash, max_flash_address)));
    registry.register("counter_stream", Arc::new(CounterStreamHandler));

    let upload = CounterUploadHandler::new();
    registry.register("counter_upload", upload.clone());
    upload
}
