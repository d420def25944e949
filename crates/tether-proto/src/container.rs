//! Container codec.
//!
//! A container is the unit the transport moves: a small header followed by up
//! to 255 payload bytes. Three variants exist on the wire, selected by the top
//! two bits of the flags byte:
//!
//! ```text
//! First       [tid u8][seq=0 u8][flags 00......][total u16 LE][len u8][payload]
//! Subsequent  [tid u8][seq  u8][flags 01......][len u8][payload]
//! Control     [tid u8][seq=0 u8][flags 11cccc..][len u8][payload]
//! ```
//!
//! Bits 5–2 of the flags byte carry the control command (`cccc`) and are only
//! meaningful for control containers; bits 1–0 are reserved and must be zero.
//! Parsing is total (any input yields a value or a [`ProtocolError`]) and
//! borrows the payload from the source buffer — no allocation.

use crate::{
    CONTROL_HEADER_SIZE, FIRST_HEADER_SIZE, MAX_CONTAINER_PAYLOAD, SUBSEQUENT_HEADER_SIZE,
    errors::ProtocolError,
};

/// Container type bits (flags byte, bits 7–6).
const TYPE_FIRST: u8 = 0b00;
const TYPE_SUBSEQUENT: u8 = 0b01;
const TYPE_RESERVED: u8 = 0b10;
const TYPE_CONTROL: u8 = 0b11;

/// Mask of the reserved low flag bits.
const RESERVED_FLAG_MASK: u8 = 0b0000_0011;

/// Control-plane commands carried by control containers (flags bits 5–2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCommand {
    /// Query the peer's configured RPC timeout (reply payload: u16 LE ms).
    Timeout = 1,
    /// Query the peer's capability record (reply payload: [`crate::Capabilities`]).
    Capabilities = 2,
    /// Report a request-level failure (payload: one [`crate::ErrorCode`] byte).
    Error = 3,
    /// Carry one key-exchange handshake message.
    KeyExchange = 4,
    /// Peripheral-to-central stream finished.
    StreamEndP2c = 5,
    /// Central-to-peripheral stream finished.
    StreamEndC2p = 6,
}

impl ControlCommand {
    /// Decode a 4-bit command value. `None` for reserved values.
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Timeout),
            2 => Some(Self::Capabilities),
            3 => Some(Self::Error),
            4 => Some(Self::KeyExchange),
            5 => Some(Self::StreamEndP2c),
            6 => Some(Self::StreamEndC2p),
            _ => None,
        }
    }

    /// The 4-bit wire value.
    #[must_use]
    pub fn raw(self) -> u8 {
        self as u8
    }
}

/// One parsed container. Borrows its payload from the source frame, so a
/// parsed value must not outlive the receive buffer it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container<'a> {
    /// Opens a transaction: declares the logical payload length and carries
    /// the first fragment. Sequence number on the wire is always 0.
    First {
        /// Transaction this container belongs to
        transaction_id: u8,
        /// Exact length of the whole logical payload
        total_length: u16,
        /// First fragment
        payload: &'a [u8],
    },

    /// Continues a transaction with the next in-order fragment.
    Subsequent {
        /// Transaction this container belongs to
        transaction_id: u8,
        /// Dense sequence number, starting at 1 after the first container
        sequence_number: u8,
        /// Fragment bytes
        payload: &'a [u8],
    },

    /// Control signalling. Never participates in assembly; the transaction id
    /// is carried opaquely.
    Control {
        /// Transaction id (opaque correlation value)
        transaction_id: u8,
        /// Raw 4-bit command; decode with [`ControlCommand::from_raw`]
        command: u8,
        /// Command-specific payload
        payload: &'a [u8],
    },
}

impl<'a> Container<'a> {
    /// Build a control container for a known command.
    #[must_use]
    pub fn control(transaction_id: u8, command: ControlCommand, payload: &'a [u8]) -> Self {
        Self::Control { transaction_id, command: command.raw(), payload }
    }

    /// Transaction id, for any variant.
    #[must_use]
    pub fn transaction_id(&self) -> u8 {
        match *self {
            Self::First { transaction_id, .. }
            | Self::Subsequent { transaction_id, .. }
            | Self::Control { transaction_id, .. } => transaction_id,
        }
    }

    /// Payload bytes, for any variant.
    #[must_use]
    pub fn payload(&self) -> &'a [u8] {
        match *self {
            Self::First { payload, .. }
            | Self::Subsequent { payload, .. }
            | Self::Control { payload, .. } => payload,
        }
    }

    /// Header size for this variant.
    #[must_use]
    pub fn header_size(&self) -> usize {
        match self {
            Self::First { .. } => FIRST_HEADER_SIZE,
            Self::Subsequent { .. } => SUBSEQUENT_HEADER_SIZE,
            Self::Control { .. } => CONTROL_HEADER_SIZE,
        }
    }

    /// Total serialized size (header + payload).
    #[must_use]
    pub fn wire_size(&self) -> usize {
        self.header_size() + self.payload().len()
    }

    /// Parse one container from the front of `bytes`.
    ///
    /// Validates the type bits (the reserved `10` pattern fails), that the
    /// reserved low flag bits are zero, that the declared payload fits the
    /// provided buffer, and that a first container's `total_length` covers its
    /// own payload. Trailing bytes beyond the declared payload are ignored.
    ///
    /// # Errors
    ///
    /// [`ProtocolError`] describing the malformation; the caller drops the
    /// frame.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < CONTROL_HEADER_SIZE {
            return Err(ProtocolError::ContainerTooShort {
                expected: CONTROL_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let transaction_id = bytes[0];
        let sequence_number = bytes[1];
        let flags = bytes[2];

        if flags & RESERVED_FLAG_MASK != 0 {
            return Err(ProtocolError::ReservedFlagBits { flags });
        }

        match flags >> 6 {
            TYPE_FIRST => {
                if bytes.len() < FIRST_HEADER_SIZE {
                    return Err(ProtocolError::ContainerTooShort {
                        expected: FIRST_HEADER_SIZE,
                        actual: bytes.len(),
                    });
                }
                let total_length = u16::from_le_bytes([bytes[3], bytes[4]]);
                let payload_len = bytes[5];
                if u16::from(payload_len) > total_length {
                    return Err(ProtocolError::TotalLengthTooSmall { total_length, payload_len });
                }
                let payload = take_payload(&bytes[FIRST_HEADER_SIZE..], payload_len)?;
                Ok(Self::First { transaction_id, total_length, payload })
            },
            TYPE_SUBSEQUENT => {
                let payload_len = bytes[3];
                let payload = take_payload(&bytes[SUBSEQUENT_HEADER_SIZE..], payload_len)?;
                Ok(Self::Subsequent { transaction_id, sequence_number, payload })
            },
            TYPE_CONTROL => {
                let payload_len = bytes[3];
                let payload = take_payload(&bytes[CONTROL_HEADER_SIZE..], payload_len)?;
                Ok(Self::Control { transaction_id, command: (flags >> 2) & 0x0F, payload })
            },
            _ => {
                debug_assert_eq!(flags >> 6, TYPE_RESERVED);
                Err(ProtocolError::ReservedContainerType)
            },
        }
    }

    /// Serialize into `out`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::PayloadTooLong`] if the payload exceeds 255 bytes
    /// - [`ProtocolError::TotalLengthTooSmall`] for an inconsistent first
    ///   container
    /// - [`ProtocolError::InvalidControlCommand`] for a command outside
    ///   `1..=15`
    /// - [`ProtocolError::BufferTooSmall`] if `out` cannot hold the container
    pub fn serialize(&self, out: &mut [u8]) -> Result<usize, ProtocolError> {
        let payload = self.payload();
        if payload.len() > MAX_CONTAINER_PAYLOAD {
            return Err(ProtocolError::PayloadTooLong {
                len: payload.len(),
                max: MAX_CONTAINER_PAYLOAD,
            });
        }
        let payload_len = payload.len() as u8;

        let needed = self.wire_size();
        if out.len() < needed {
            return Err(ProtocolError::BufferTooSmall { needed, capacity: out.len() });
        }

        let header_size = self.header_size();
        match *self {
            Self::First { transaction_id, total_length, .. } => {
                if u16::from(payload_len) > total_length {
                    return Err(ProtocolError::TotalLengthTooSmall { total_length, payload_len });
                }
                out[0] = transaction_id;
                out[1] = 0;
                out[2] = TYPE_FIRST << 6;
                out[3..5].copy_from_slice(&total_length.to_le_bytes());
                out[5] = payload_len;
            },
            Self::Subsequent { transaction_id, sequence_number, .. } => {
                out[0] = transaction_id;
                out[1] = sequence_number;
                out[2] = TYPE_SUBSEQUENT << 6;
                out[3] = payload_len;
            },
            Self::Control { transaction_id, command, .. } => {
                if command == 0 || command > 0x0F {
                    return Err(ProtocolError::InvalidControlCommand(command));
                }
                out[0] = transaction_id;
                out[1] = 0;
                out[2] = (TYPE_CONTROL << 6) | (command << 2);
                out[3] = payload_len;
            },
        }
        out[header_size..needed].copy_from_slice(payload);

        Ok(needed)
    }
}

fn take_payload(rest: &[u8], payload_len: u8) -> Result<&[u8], ProtocolError> {
    let declared = usize::from(payload_len);
    rest.get(..declared)
        .ok_or(ProtocolError::PayloadTruncated { declared, available: rest.len() })
}
