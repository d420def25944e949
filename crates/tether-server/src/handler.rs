//! Handler contract and registry.
//!
//! A handler receives the raw request body and a byte sink for its response
//! body. The dispatcher invokes it twice per request: once against a counting
//! sink to learn the response size, then against a sink that fills outbound
//! containers (or a staging buffer when encryption is on). Handlers must
//! therefore be **deterministic and idempotent across the two invocations** —
//! read-only with respect to the bytes they produce. Handlers that manage
//! their own replies (stream handlers) return
//! [`HandlerOutcome::SkipResponse`] from the first invocation and the second
//! never happens.

use std::sync::Arc;

use thiserror::Error;

use crate::sender::ServiceHandle;

/// Error from a response sink: the transport or staging buffer gave out.
#[derive(Debug, Error)]
#[error("response sink failed: {reason}")]
pub struct SinkError {
    reason: String,
}

impl SinkError {
    /// Wrap an underlying failure.
    #[must_use]
    pub fn new(reason: impl std::fmt::Display) -> Self {
        Self { reason: reason.to_string() }
    }
}

/// Byte sink a handler writes its response body into.
pub trait ResponseSink {
    /// Append `bytes` to the response body.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SinkError>;
}

/// Adapter exposing a [`ResponseSink`] as [`std::io::Write`], for encoders
/// that expect one (the bundled handlers feed `ciborium` through this).
pub struct SinkWriter<'a>(pub &'a mut dyn ResponseSink);

impl std::io::Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write_all(buf).map_err(std::io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// What a handler did with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The response body was written to the sink; the dispatcher frames and
    /// sends it.
    Reply,
    /// The handler produced its own replies (or none); the dispatcher sends
    /// nothing.
    SkipResponse,
}

/// Handler failure, translated to a control/error frame by the dispatcher.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The request body could not be decoded.
    #[error("request decode failed: {0}")]
    Decode(String),

    /// The handler ran and failed.
    #[error("handler failed: {0}")]
    Failed(String),

    /// The response sink rejected a write.
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Per-request context handed to handlers.
///
/// Stream handlers use the [`ServiceHandle`] to issue their own transaction
/// ids and send their own command responses.
pub struct RequestContext<'a> {
    /// Transaction id of the request being dispatched.
    pub transaction_id: u8,
    handle: &'a ServiceHandle,
}

impl<'a> RequestContext<'a> {
    pub(crate) fn new(transaction_id: u8, handle: &'a ServiceHandle) -> Self {
        Self { transaction_id, handle }
    }

    /// Outbound facilities of the owning service.
    #[must_use]
    pub fn handle(&self) -> &ServiceHandle {
        self.handle
    }
}

/// One registered RPC method.
pub trait CommandHandler: Send + Sync {
    /// Process `request`, writing the response body to `out`.
    ///
    /// # Errors
    ///
    /// [`HandlerError`]; the dispatcher reports it to the client as a
    /// control/error frame.
    fn handle(
        &self,
        ctx: &RequestContext<'_>,
        request: &[u8],
        out: &mut dyn ResponseSink,
    ) -> Result<HandlerOutcome, HandlerError>;
}

/// Static method table: name → handler.
///
/// Lookup is a linear scan — deployments register a handful of methods, and
/// a scan over a short `Vec` beats hashing short names.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Vec<(&'static str, Arc<dyn CommandHandler>)>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous registration.
    ///
    /// Names are capped at
    /// [`MAX_COMMAND_NAME_LEN`](tether_proto::MAX_COMMAND_NAME_LEN) by the
    /// command codec; registering a longer name would produce a method no
    /// response header can carry.
    pub fn register(&mut self, name: &'static str, handler: Arc<dyn CommandHandler>) {
        debug_assert!(!name.is_empty());
        debug_assert!(name.len() <= tether_proto::MAX_COMMAND_NAME_LEN);

        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = handler;
        } else {
            self.entries.push((name, handler));
        }
    }

    /// Find the handler for a method name.
    #[must_use]
    pub fn lookup(&self, name: &[u8]) -> Option<&dyn CommandHandler> {
        self.entries
            .iter()
            .find(|(n, _)| n.as_bytes() == name)
            .map(|(_, handler)| handler.as_ref())
    }

    /// Number of registered methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No methods registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.entries.iter().map(|(n, _)| *n).collect();
        f.debug_struct("HandlerRegistry").field("methods", &names).finish()
    }
}
