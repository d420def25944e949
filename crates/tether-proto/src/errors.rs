//! Protocol error types.
//!
//! One flat error enum for the wire layer: container parsing/serialization,
//! assembly, and the command codec all fail with a [`ProtocolError`]. The
//! variants carry enough context to log a useful message; none of them are
//! recoverable in place — the reaction is always "drop the frame" or "reset
//! the assembler".

use thiserror::Error;

/// Errors produced by the wire layer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer ends before the container header does.
    #[error("container too short: need {expected} bytes, have {actual}")]
    ContainerTooShort {
        /// Minimum bytes required for this container type
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// The reserved type bit pattern `10` was used.
    #[error("reserved container type bits")]
    ReservedContainerType,

    /// Reserved low flag bits were set.
    #[error("reserved flag bits set in {flags:#04x}")]
    ReservedFlagBits {
        /// The offending flags byte
        flags: u8,
    },

    /// The header declares more payload than the buffer holds.
    #[error("declared payload of {declared} bytes exceeds remaining {available}")]
    PayloadTruncated {
        /// `payload_len` from the header
        declared: usize,
        /// Bytes left after the header
        available: usize,
    },

    /// A first container's `total_length` is smaller than its own payload.
    #[error("total length {total_length} smaller than first payload {payload_len}")]
    TotalLengthTooSmall {
        /// Declared logical payload length
        total_length: u16,
        /// Payload bytes carried by the first container
        payload_len: u8,
    },

    /// A container payload cannot exceed 255 bytes.
    #[error("payload of {len} bytes does not fit one container (max {max})")]
    PayloadTooLong {
        /// Requested payload length
        len: usize,
        /// Maximum payload length
        max: usize,
    },

    /// Control command outside the 4-bit `1..=15` range.
    #[error("control command {0} out of range")]
    InvalidControlCommand(u8),

    /// Output buffer is too small for the serialized container.
    #[error("buffer too small: need {needed} bytes, have {capacity}")]
    BufferTooSmall {
        /// Bytes the serialized container occupies
        needed: usize,
        /// Capacity of the provided buffer
        capacity: usize,
    },

    /// A subsequent container arrived with no transaction in progress.
    #[error("subsequent container without a first (transaction {transaction_id})")]
    UnexpectedSubsequent {
        /// Transaction id of the stray container
        transaction_id: u8,
    },

    /// A first container arrived while another transaction was assembling.
    #[error("first container for transaction {incoming} while {active} is assembling")]
    TransactionOverlap {
        /// Transaction currently being assembled
        active: u8,
        /// Transaction id of the new first container
        incoming: u8,
    },

    /// A subsequent container belongs to a different transaction.
    #[error("container for transaction {actual}, expected {expected}")]
    TransactionMismatch {
        /// Transaction being assembled
        expected: u8,
        /// Transaction id on the received container
        actual: u8,
    },

    /// A subsequent container skipped or repeated a sequence number.
    #[error("sequence gap: expected {expected}, got {actual}")]
    SequenceGap {
        /// Next sequence number the assembler would accept
        expected: u8,
        /// Sequence number on the received container
        actual: u8,
    },

    /// The declared logical payload does not fit the assembler buffer.
    #[error("payload of {total} bytes exceeds assembler capacity {capacity}")]
    CapacityExceeded {
        /// Declared (or accumulated) logical payload length
        total: usize,
        /// Assembler buffer capacity
        capacity: usize,
    },

    /// More payload bytes arrived than the first container declared.
    #[error("received {received} bytes for a transaction declaring {declared}")]
    LengthOverrun {
        /// Payload bytes accumulated so far
        received: usize,
        /// `total_length` from the first container
        declared: usize,
    },

    /// Control containers never participate in assembly.
    #[error("control container fed to the assembler")]
    ControlNotAssemblable,

    /// MTU below the protocol minimum; no payload fits.
    #[error("mtu {mtu} below protocol minimum {min}")]
    MtuTooSmall {
        /// Negotiated MTU
        mtu: u16,
        /// Smallest supported MTU
        min: u16,
    },

    /// Logical payload longer than the `u16` total-length field can declare.
    #[error("logical payload of {len} bytes exceeds the u16 total length field")]
    TransactionTooLong {
        /// Requested logical payload length
        len: usize,
    },

    /// Command packet shorter than its fixed header.
    #[error("command packet too short: {len} bytes")]
    CommandTooShort {
        /// Length of the provided buffer
        len: usize,
    },

    /// Command name length of zero.
    #[error("command name empty")]
    EmptyCommandName,

    /// Command name longer than the protocol maximum.
    #[error("command name of {len} bytes exceeds maximum {max}")]
    CommandNameTooLong {
        /// Requested name length
        len: usize,
        /// Maximum name length
        max: usize,
    },

    /// Declared body length disagrees with the trailing bytes.
    #[error("command data length {declared} does not match trailing {actual} bytes")]
    DataLengthMismatch {
        /// `data_len` from the command header
        declared: usize,
        /// Bytes actually trailing the header
        actual: usize,
    },

    /// Command body longer than the `u16` length field can express.
    #[error("command data of {len} bytes exceeds the u16 length field")]
    DataTooLong {
        /// Requested body length
        len: usize,
    },

    /// Capabilities payload with an unrecognized size.
    #[error("capabilities payload of {len} bytes (expected 6, or 4 legacy)")]
    MalformedCapabilities {
        /// Length of the received payload
        len: usize,
    },

    /// Fixed-size control payload with the wrong size.
    #[error("control payload of {len} bytes (expected {expected})")]
    MalformedControlPayload {
        /// Expected payload length
        expected: usize,
        /// Length of the received payload
        len: usize,
    },
}
