//! Shared outbound state.
//!
//! A [`ServiceHandle`] is the cloneable face of everything that leaves the
//! peripheral: the transport, the transaction counter, and the crypto
//! session. The receive path, the dispatch worker, and stream handlers all
//! hold one; the mutex around the crypto session is what makes the
//! worker/receive-path sharing sound (the protocol paces them apart, but a
//! stream handler sending from the worker while a control frame is answered
//! inline would otherwise race the counters).

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU8, Ordering},
    },
    thread,
    time::Duration,
};

use tether_crypto::CryptoSession;
use tether_proto::{Container, ControlCommand, ErrorCode, split_and_send};

use crate::{
    error::ServerError,
    transport::{Notify, NotifyError},
};

/// Attempts before a backpressured notify is surfaced as an error.
const NOTIFY_RETRIES: usize = 10;

/// Pause between backpressured notify attempts.
const NOTIFY_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Scratch for one serialized control container.
const CONTROL_FRAME_MAX: usize = tether_proto::CONTROL_HEADER_SIZE + 255;

struct Inner {
    transport: Arc<dyn Notify>,
    crypto: Mutex<Option<CryptoSession>>,
    transaction_counter: AtomicU8,
}

/// Cloneable outbound face of a [`Service`](crate::Service).
#[derive(Clone)]
pub struct ServiceHandle {
    inner: Arc<Inner>,
}

impl ServiceHandle {
    pub(crate) fn new(transport: Arc<dyn Notify>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                crypto: Mutex::new(None),
                transaction_counter: AtomicU8::new(0),
            }),
        }
    }

    /// Allocate the next outbound transaction id (wrapping `u8`).
    #[must_use]
    pub fn next_transaction_id(&self) -> u8 {
        self.inner.transaction_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn reset_transaction_counter(&self) {
        self.inner.transaction_counter.store(0, Ordering::Relaxed);
    }

    /// Negotiated MTU of the transport.
    #[must_use]
    pub fn mtu(&self) -> u16 {
        self.inner.transport.mtu()
    }

    /// An encrypted session is established.
    #[must_use]
    pub fn encryption_active(&self) -> bool {
        self.crypto().is_some()
    }

    pub(crate) fn install_session(&self, session: CryptoSession) {
        *self.crypto() = Some(session);
    }

    /// Drop the crypto session, zeroising its keys.
    pub(crate) fn clear_session(&self) {
        *self.crypto() = None;
    }

    pub(crate) fn decrypt(&self, wire: &[u8]) -> Result<Vec<u8>, ServerError> {
        let mut guard = self.crypto();
        let session = guard.as_mut().ok_or(ServerError::SessionInactive)?;
        Ok(session.decrypt(wire)?)
    }

    fn crypto(&self) -> MutexGuard<'_, Option<CryptoSession>> {
        self.inner.crypto.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_once(&self, frame: &[u8]) -> Result<(), NotifyError> {
        self.inner.transport.notify(frame)
    }

    /// Send one frame, riding out transient backpressure.
    pub(crate) fn send_with_retry(&self, frame: &[u8]) -> Result<(), NotifyError> {
        for _ in 0..NOTIFY_RETRIES {
            match self.notify_once(frame) {
                Err(NotifyError::OutOfResources) => thread::sleep(NOTIFY_RETRY_DELAY),
                other => return other,
            }
        }
        tracing::error!("notify failed after {NOTIFY_RETRIES} retries");
        Err(NotifyError::OutOfResources)
    }

    fn serialize_control(
        transaction_id: u8,
        command: ControlCommand,
        payload: &[u8],
        buf: &mut [u8; CONTROL_FRAME_MAX],
    ) -> Result<usize, ServerError> {
        Ok(Container::control(transaction_id, command, payload).serialize(buf)?)
    }

    /// Send a control container without retry (inline fast-path replies).
    pub(crate) fn send_control(
        &self,
        transaction_id: u8,
        command: ControlCommand,
        payload: &[u8],
    ) -> Result<(), ServerError> {
        let mut buf = [0u8; CONTROL_FRAME_MAX];
        let n = Self::serialize_control(transaction_id, command, payload, &mut buf)?;
        Ok(self.notify_once(&buf[..n])?)
    }

    /// Send a control container, retrying through backpressure.
    pub(crate) fn send_control_retried(
        &self,
        transaction_id: u8,
        command: ControlCommand,
        payload: &[u8],
    ) -> Result<(), ServerError> {
        let mut buf = [0u8; CONTROL_FRAME_MAX];
        let n = Self::serialize_control(transaction_id, command, payload, &mut buf)?;
        Ok(self.send_with_retry(&buf[..n])?)
    }

    /// Report a request failure to the client.
    pub(crate) fn send_error(
        &self,
        transaction_id: u8,
        code: ErrorCode,
    ) -> Result<(), ServerError> {
        self.send_control_retried(transaction_id, ControlCommand::Error, &[code.raw()])
    }

    /// Send a complete serialized command packet as one transaction,
    /// encrypting first when a session is active.
    ///
    /// Stream handlers use this for their self-managed responses.
    pub fn send_command_response(
        &self,
        transaction_id: u8,
        command: &[u8],
    ) -> Result<(), ServerError> {
        let mtu = self.mtu();

        let encrypted = {
            let mut guard = self.crypto();
            match guard.as_mut() {
                Some(session) => Some(session.encrypt(command)?),
                None => None,
            }
        };

        let payload = encrypted.as_deref().unwrap_or(command);
        split_and_send(transaction_id, payload, mtu, |frame| self.send_with_retry(frame))?;
        Ok(())
    }

    /// Terminate a peripheral-to-central stream.
    pub fn send_stream_end(&self, transaction_id: u8) -> Result<(), ServerError> {
        self.send_control_retried(transaction_id, ControlCommand::StreamEndP2c, &[])
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("encryption_active", &self.encryption_active())
            .finish_non_exhaustive()
    }
}
