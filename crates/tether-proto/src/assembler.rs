//! Single-slot payload assembler.
//!
//! The receive side of the framing layer: containers are fed in transport
//! order and the assembler reconstructs the logical payload declared by the
//! first container. Exactly one transaction can be in flight — the protocol
//! paces requests so a second first container before completion is a peer
//! bug, not a supported interleaving.
//!
//! Any violation (overlap, wrong transaction, sequence gap, overrun,
//! capacity) resets the assembler to idle and surfaces a [`ProtocolError`].
//! The assembler is not concurrency-safe; a single owner feeds it.

use crate::{Container, errors::ProtocolError};

/// Outcome of feeding one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedResult {
    /// More containers are needed for the active transaction.
    Incomplete,
    /// The logical payload is complete; read it with [`Assembler::payload`].
    Complete,
}

/// State of the transaction currently being assembled.
#[derive(Debug, Clone, Copy)]
struct Active {
    transaction_id: u8,
    expected_sequence: u8,
    total_length: usize,
}

/// Reassembles one logical payload from its containers.
///
/// The buffer is owned by the assembler and sized once at construction; a
/// first container declaring more than `capacity` bytes is rejected before
/// any copying happens.
#[derive(Debug)]
pub struct Assembler {
    capacity: usize,
    active: Option<Active>,
    buf: Vec<u8>,
}

impl Assembler {
    /// Create an idle assembler with the given payload capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { capacity, active: None, buf: Vec::with_capacity(capacity) }
    }

    /// A transaction is currently being assembled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Transaction id of the payload being (or just) assembled.
    #[must_use]
    pub fn transaction_id(&self) -> Option<u8> {
        self.active.map(|a| a.transaction_id)
    }

    /// Payload bytes accumulated so far. After [`FeedResult::Complete`] this
    /// is the full logical payload, valid until the next [`feed`] or
    /// [`reset`].
    ///
    /// [`feed`]: Self::feed
    /// [`reset`]: Self::reset
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buf
    }

    /// Drop any in-progress transaction and return to idle.
    pub fn reset(&mut self) {
        self.active = None;
        self.buf.clear();
    }

    /// Feed one data container.
    ///
    /// # Errors
    ///
    /// Any [`ProtocolError`] resets the assembler to idle before returning:
    /// a subsequent container with no transaction open, a first container
    /// while one is open, a transaction or sequence mismatch, a declared
    /// length beyond capacity, or more payload than the declared total.
    pub fn feed(&mut self, container: &Container<'_>) -> Result<FeedResult, ProtocolError> {
        let result = self.feed_inner(container);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn feed_inner(&mut self, container: &Container<'_>) -> Result<FeedResult, ProtocolError> {
        match *container {
            Container::First { transaction_id, total_length, payload } => {
                if let Some(active) = self.active {
                    return Err(ProtocolError::TransactionOverlap {
                        active: active.transaction_id,
                        incoming: transaction_id,
                    });
                }

                let total = usize::from(total_length);
                if total > self.capacity {
                    return Err(ProtocolError::CapacityExceeded {
                        total,
                        capacity: self.capacity,
                    });
                }
                if payload.len() > total {
                    // The codec enforces this; hand-built containers do not.
                    return Err(ProtocolError::TotalLengthTooSmall {
                        total_length,
                        payload_len: payload.len() as u8,
                    });
                }

                self.buf.clear();
                self.buf.extend_from_slice(payload);

                if self.buf.len() == total {
                    return Ok(FeedResult::Complete);
                }

                self.active = Some(Active {
                    transaction_id,
                    expected_sequence: 1,
                    total_length: total,
                });
                Ok(FeedResult::Incomplete)
            },

            Container::Subsequent { transaction_id, sequence_number, payload } => {
                let Some(active) = self.active.as_mut() else {
                    return Err(ProtocolError::UnexpectedSubsequent { transaction_id });
                };

                if transaction_id != active.transaction_id {
                    return Err(ProtocolError::TransactionMismatch {
                        expected: active.transaction_id,
                        actual: transaction_id,
                    });
                }
                if sequence_number != active.expected_sequence {
                    return Err(ProtocolError::SequenceGap {
                        expected: active.expected_sequence,
                        actual: sequence_number,
                    });
                }

                let received = self.buf.len() + payload.len();
                if received > active.total_length {
                    return Err(ProtocolError::LengthOverrun {
                        received,
                        declared: active.total_length,
                    });
                }

                // Long transactions wrap the 8-bit sequence; density is what
                // matters, not magnitude.
                active.expected_sequence = active.expected_sequence.wrapping_add(1);
                let done = received == active.total_length;
                self.buf.extend_from_slice(payload);

                if done {
                    self.active = None;
                    Ok(FeedResult::Complete)
                } else {
                    Ok(FeedResult::Incomplete)
                }
            },

            Container::Control { .. } => Err(ProtocolError::ControlNotAssemblable),
        }
    }
}
