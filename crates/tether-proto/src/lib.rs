//! Tether wire format.
//!
//! A tether link carries arbitrary-length logical payloads over a transport
//! that only offers small message-sized writes (the reference transport is a
//! BLE GATT characteristic: one container per write-without-response in one
//! direction, one per notification in the other). This crate defines the
//! byte-level protocol and the pure state that sits on either side of it:
//!
//! - [`Container`]: one framed unit on the wire — a `First`/`Subsequent`
//!   fragment of a logical payload, or a `Control` signal
//!   ([`ControlCommand`]).
//! - [`Assembler`]: single-slot receive state that reconstructs a logical
//!   payload from its containers, enforcing in-order delivery.
//! - [`split_and_send`] / [`FrameWriter`]: the send side — fragment a payload
//!   (or an incrementally produced byte stream) into MTU-sized containers.
//! - [`CommandPacket`]: the `{type, method name, body}` envelope carried
//!   inside an assembled payload.
//! - [`Capabilities`] / [`ErrorCode`]: control-plane payloads.
//!
//! Everything here is I/O-free and allocation-light; parsing borrows from the
//! source buffer. All multi-byte integers are little-endian.

pub mod assembler;
pub mod command;
pub mod container;
pub mod control;
pub mod errors;
pub mod splitter;

pub use assembler::{Assembler, FeedResult};
pub use command::{
    CommandPacket, CommandType, MAX_COMMAND_NAME_LEN, serialize_command, serialize_header,
};
pub use container::{Container, ControlCommand};
pub use control::{
    CAPABILITY_ENCRYPTION_SUPPORTED, Capabilities, ErrorCode, decode_timeout_ms,
    encode_timeout_ms,
};
pub use errors::ProtocolError;
pub use splitter::{FrameWriter, SplitError, split_and_send};

/// ATT protocol overhead per GATT write/notification (opcode + handle).
pub const ATT_OVERHEAD: usize = 3;

/// Header size of a `First` container.
pub const FIRST_HEADER_SIZE: usize = 6;

/// Header size of a `Subsequent` container.
pub const SUBSEQUENT_HEADER_SIZE: usize = 4;

/// Header size of a `Control` container.
pub const CONTROL_HEADER_SIZE: usize = 4;

/// Smallest MTU the protocol operates over (the ATT minimum).
pub const MIN_MTU: u16 = 23;

/// Largest payload a single container can carry (`payload_len` is a `u8`).
pub const MAX_CONTAINER_PAYLOAD: usize = 255;

/// GATT service UUID under which the protocol characteristic lives.
///
/// Transports other than GATT are free to ignore this, but must preserve the
/// container byte layout.
pub const SERVICE_UUID: u128 = 0x1234_0001_0000_1000_8000_0080_5f9b_34fb;

/// GATT characteristic UUID carrying containers in both directions.
pub const CHARACTERISTIC_UUID: u128 = 0x1234_0002_0000_1000_8000_0080_5f9b_34fb;
