//! Command envelope codec.
//!
//! Inside an assembled logical payload lives one command packet: a direction
//! bit, a method name, and an opaque body.
//!
//! ```text
//! [type u8: bit7 = response][name_len u8][name][data_len u16 LE][data]
//! ```
//!
//! The fixed header cost is `4 + name_len` bytes. The body encoding is the
//! application's business — this layer never looks inside it.

use bytes::BufMut;

use crate::errors::ProtocolError;

/// Longest method name the protocol accepts when building a packet.
///
/// The wire field is a `u8`, but names are capped so the server can build
/// response headers into a fixed scratch buffer.
pub const MAX_COMMAND_NAME_LEN: usize = 16;

/// Fixed header bytes around the name: type + name_len + data_len.
const FIXED_HEADER: usize = 4;

/// Direction of a command packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    /// Client-initiated request.
    Request,
    /// Server-produced response (including stream responses).
    Response,
}

impl CommandType {
    fn type_byte(self) -> u8 {
        match self {
            Self::Request => 0x00,
            Self::Response => 0x80,
        }
    }
}

/// One parsed command packet, borrowing name and body from the source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPacket<'a> {
    /// Request or response.
    pub cmd_type: CommandType,
    /// Method name bytes (conventionally ASCII, e.g. `b"echo"`).
    pub name: &'a [u8],
    /// Opaque body.
    pub data: &'a [u8],
}

impl<'a> CommandPacket<'a> {
    /// Parse a command packet from an assembled payload.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::CommandTooShort`] if the fixed header is truncated
    /// - [`ProtocolError::EmptyCommandName`] for a zero-length name
    /// - [`ProtocolError::DataLengthMismatch`] unless the declared body
    ///   length matches the trailing bytes exactly
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < FIXED_HEADER {
            return Err(ProtocolError::CommandTooShort { len: bytes.len() });
        }

        let cmd_type =
            if bytes[0] & 0x80 != 0 { CommandType::Response } else { CommandType::Request };
        let name_len = usize::from(bytes[1]);
        if name_len == 0 {
            return Err(ProtocolError::EmptyCommandName);
        }

        let data_len_offset = 2 + name_len;
        let data_offset = data_len_offset + 2;
        if bytes.len() < data_offset {
            return Err(ProtocolError::CommandTooShort { len: bytes.len() });
        }

        let name = &bytes[2..data_len_offset];
        let declared =
            usize::from(u16::from_le_bytes([bytes[data_len_offset], bytes[data_len_offset + 1]]));
        let data = &bytes[data_offset..];
        if data.len() != declared {
            return Err(ProtocolError::DataLengthMismatch { declared, actual: data.len() });
        }

        Ok(Self { cmd_type, name, data })
    }

    /// Serialized size of a packet with this name and body length.
    #[must_use]
    pub fn wire_size(name_len: usize, data_len: usize) -> usize {
        FIXED_HEADER + name_len + data_len
    }
}

/// Validate a method name for serialization.
fn check_name(name: &[u8]) -> Result<u8, ProtocolError> {
    if name.is_empty() {
        return Err(ProtocolError::EmptyCommandName);
    }
    if name.len() > MAX_COMMAND_NAME_LEN {
        return Err(ProtocolError::CommandNameTooLong {
            len: name.len(),
            max: MAX_COMMAND_NAME_LEN,
        });
    }
    Ok(name.len() as u8)
}

/// Append a full command packet (header + body) to `out`.
///
/// # Errors
///
/// - [`ProtocolError::EmptyCommandName`] / [`ProtocolError::CommandNameTooLong`]
/// - [`ProtocolError::DataTooLong`] if the body exceeds the `u16` field
pub fn serialize_command(
    cmd_type: CommandType,
    name: &[u8],
    data: &[u8],
    out: &mut impl BufMut,
) -> Result<(), ProtocolError> {
    let data_len =
        u16::try_from(data.len()).map_err(|_| ProtocolError::DataTooLong { len: data.len() })?;
    serialize_header(cmd_type, name, data_len, out)?;
    out.put_slice(data);
    Ok(())
}

/// Append only the command header to `out`.
///
/// The server's streaming response path uses this: the header goes into the
/// outbound stream first, then the handler writes the body directly behind
/// it.
///
/// # Errors
///
/// Same name validation as [`serialize_command`].
pub fn serialize_header(
    cmd_type: CommandType,
    name: &[u8],
    data_len: u16,
    out: &mut impl BufMut,
) -> Result<(), ProtocolError> {
    let name_len = check_name(name)?;
    out.put_u8(cmd_type.type_byte());
    out.put_u8(name_len);
    out.put_slice(name);
    out.put_u16_le(data_len);
    Ok(())
}
