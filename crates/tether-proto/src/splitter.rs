//! Send-side fragmentation.
//!
//! Two flavours share the framing rules. [`split_and_send`] fragments a
//! payload that already exists in memory — the common case on the client and
//! for encrypted responses, where the ciphertext must be complete before the
//! first container leaves. [`FrameWriter`] accepts incremental writes and is
//! what the server's streaming response path drives: bytes are buffered into
//! the current container, full containers are flushed through the send hook,
//! and [`FrameWriter::finish`] emits the trailing partial one.
//!
//! Per-container payload capacity is `mtu − ATT_OVERHEAD − header_size`,
//! additionally clamped to 255 by the `u8` length field. The send hook
//! receives one fully serialized container per call; its error short-circuits
//! with the sequence number that failed.

use crate::{
    ATT_OVERHEAD, Container, FIRST_HEADER_SIZE, MAX_CONTAINER_PAYLOAD, MIN_MTU,
    SUBSEQUENT_HEADER_SIZE, errors::ProtocolError,
};

/// Largest serialized container: first header plus a full payload.
const MAX_FRAME_SIZE: usize = FIRST_HEADER_SIZE + MAX_CONTAINER_PAYLOAD;

/// Errors from the send-side fragmentation routines.
#[derive(Debug, thiserror::Error)]
pub enum SplitError<E: std::error::Error> {
    /// The payload violated a framing constraint before anything was sent.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A streaming writer finished with a byte count different from the
    /// total it declared in the first container.
    #[error("stream wrote {written} bytes but declared {declared}")]
    LengthMismatch {
        /// `total_length` declared up front
        declared: u16,
        /// Payload bytes actually written
        written: usize,
    },

    /// The send hook failed; earlier containers may already be on the wire.
    #[error("transport rejected container {sequence}")]
    Send {
        /// Sequence number of the container that failed
        sequence: u8,
        /// Transport error
        #[source]
        source: E,
    },
}

/// Per-frame payload capacities for a negotiated MTU.
#[derive(Debug, Clone, Copy)]
struct Capacity {
    first: usize,
    subsequent: usize,
}

fn capacity_for(mtu: u16) -> Result<Capacity, ProtocolError> {
    if mtu < MIN_MTU {
        return Err(ProtocolError::MtuTooSmall { mtu, min: MIN_MTU });
    }
    let effective = usize::from(mtu) - ATT_OVERHEAD;
    Ok(Capacity {
        first: (effective - FIRST_HEADER_SIZE).min(MAX_CONTAINER_PAYLOAD),
        subsequent: (effective - SUBSEQUENT_HEADER_SIZE).min(MAX_CONTAINER_PAYLOAD),
    })
}

fn send_container<E, F>(container: &Container<'_>, send: &mut F) -> Result<(), SplitError<E>>
where
    E: std::error::Error,
    F: FnMut(&[u8]) -> Result<(), E>,
{
    let mut frame = [0u8; MAX_FRAME_SIZE];
    let n = container.serialize(&mut frame)?;
    let sequence = match *container {
        Container::Subsequent { sequence_number, .. } => sequence_number,
        _ => 0,
    };
    send(&frame[..n]).map_err(|source| SplitError::Send { sequence, source })
}

/// Fragment `payload` into containers and pass each to `send`.
///
/// Emits one first container declaring the full length, then subsequent
/// containers with dense sequence numbers from 1. The transaction id is
/// carried opaquely.
///
/// # Errors
///
/// - [`ProtocolError::MtuTooSmall`] / [`ProtocolError::TransactionTooLong`]
///   before anything is sent
/// - [`SplitError::Send`] when the hook fails; fragmentation stops there
pub fn split_and_send<E, F>(
    transaction_id: u8,
    payload: &[u8],
    mtu: u16,
    mut send: F,
) -> Result<(), SplitError<E>>
where
    E: std::error::Error,
    F: FnMut(&[u8]) -> Result<(), E>,
{
    let capacity = capacity_for(mtu)?;
    let total_length = u16::try_from(payload.len())
        .map_err(|_| ProtocolError::TransactionTooLong { len: payload.len() })?;

    let first_len = payload.len().min(capacity.first);
    let (first_chunk, mut rest) = payload.split_at(first_len);
    send_container(
        &Container::First { transaction_id, total_length, payload: first_chunk },
        &mut send,
    )?;

    let mut sequence_number: u8 = 1;
    while !rest.is_empty() {
        let chunk_len = rest.len().min(capacity.subsequent);
        let (chunk, tail) = rest.split_at(chunk_len);
        send_container(
            &Container::Subsequent { transaction_id, sequence_number, payload: chunk },
            &mut send,
        )?;
        sequence_number = sequence_number.wrapping_add(1);
        rest = tail;
    }

    Ok(())
}

/// Streaming fragmenter: feeds containers to a send hook as bytes arrive.
///
/// The logical payload length must be known up front (it goes into the first
/// container header), which is why the server sizes responses in a separate
/// pass before streaming them. The writer buffers into the current container
/// and flushes whenever it fills; [`finish`](Self::finish) flushes the
/// trailing partial container and verifies the declared total was written
/// exactly — a mismatch means the producer was not deterministic across the
/// two passes.
#[derive(Debug)]
pub struct FrameWriter<F> {
    transaction_id: u8,
    total_length: u16,
    capacity: Capacity,
    payload: [u8; MAX_CONTAINER_PAYLOAD],
    payload_used: usize,
    sequence_number: u8,
    first_sent: bool,
    written: usize,
    send: F,
}

impl<F> FrameWriter<F> {
    /// Create a writer for one outbound transaction.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::MtuTooSmall`] if no payload fits the MTU.
    pub fn new(
        transaction_id: u8,
        total_length: u16,
        mtu: u16,
        send: F,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            transaction_id,
            total_length,
            capacity: capacity_for(mtu)?,
            payload: [0u8; MAX_CONTAINER_PAYLOAD],
            payload_used: 0,
            sequence_number: 0,
            first_sent: false,
            written: 0,
            send,
        })
    }

    fn current_capacity(&self) -> usize {
        if self.first_sent { self.capacity.subsequent } else { self.capacity.first }
    }

    /// Append payload bytes, flushing full containers through the send hook.
    ///
    /// # Errors
    ///
    /// [`SplitError::Send`] if the hook rejects a container; the writer is
    /// then unusable and the transaction must be abandoned.
    pub fn write<E>(&mut self, mut bytes: &[u8]) -> Result<(), SplitError<E>>
    where
        E: std::error::Error,
        F: FnMut(&[u8]) -> Result<(), E>,
    {
        while !bytes.is_empty() {
            let space = self.current_capacity() - self.payload_used;
            let n = bytes.len().min(space);
            self.payload[self.payload_used..self.payload_used + n]
                .copy_from_slice(&bytes[..n]);
            self.payload_used += n;
            self.written += n;
            bytes = &bytes[n..];

            if self.payload_used == self.current_capacity() {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Flush the trailing partial container and close the transaction.
    ///
    /// # Errors
    ///
    /// - [`SplitError::Send`] if the final flush fails
    /// - [`SplitError::LengthMismatch`] if the bytes written disagree with
    ///   the declared total
    pub fn finish<E>(mut self) -> Result<(), SplitError<E>>
    where
        E: std::error::Error,
        F: FnMut(&[u8]) -> Result<(), E>,
    {
        if self.payload_used > 0 || !self.first_sent {
            self.flush()?;
        }
        if self.written != usize::from(self.total_length) {
            return Err(SplitError::LengthMismatch {
                declared: self.total_length,
                written: self.written,
            });
        }
        Ok(())
    }

    fn flush<E>(&mut self) -> Result<(), SplitError<E>>
    where
        E: std::error::Error,
        F: FnMut(&[u8]) -> Result<(), E>,
    {
        let chunk = &self.payload[..self.payload_used];
        let container = if self.first_sent {
            Container::Subsequent {
                transaction_id: self.transaction_id,
                sequence_number: self.sequence_number,
                payload: chunk,
            }
        } else {
            Container::First {
                transaction_id: self.transaction_id,
                total_length: self.total_length,
                payload: chunk,
            }
        };
        send_container(&container, &mut self.send)?;

        self.first_sent = true;
        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.payload_used = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Assembler, FeedResult};

    /// Transport stub that can never fail.
    #[derive(Debug, thiserror::Error)]
    #[error("unreachable")]
    struct NoError;

    fn reassemble(frames: &[Vec<u8>], capacity: usize) -> Vec<u8> {
        let mut assembler = Assembler::new(capacity);
        let mut result = FeedResult::Incomplete;
        for frame in frames {
            let container = Container::parse(frame).unwrap();
            result = assembler.feed(&container).unwrap();
        }
        assert_eq!(result, FeedResult::Complete);
        assembler.payload().to_vec()
    }

    #[test]
    fn small_payload_is_one_first_container() {
        let mut frames: Vec<Vec<u8>> = Vec::new();
        split_and_send::<NoError, _>(0, b"hello", 247, |f| {
            frames.push(f.to_vec());
            Ok(())
        })
        .unwrap();

        assert_eq!(frames.len(), 1);
        let parsed = Container::parse(&frames[0]).unwrap();
        assert_eq!(
            parsed,
            Container::First { transaction_id: 0, total_length: 5, payload: b"hello" }
        );
    }

    #[test]
    fn minimum_mtu_single_byte_payload() {
        let mut frames: Vec<Vec<u8>> = Vec::new();
        split_and_send::<NoError, _>(0, b"x", MIN_MTU, |f| {
            frames.push(f.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn hundred_bytes_at_mtu_27() {
        // effective = 24: first carries 18, subsequents carry 20.
        let payload: Vec<u8> = (0..100u8).collect();
        let mut frames: Vec<Vec<u8>> = Vec::new();
        split_and_send::<NoError, _>(5, &payload, 27, |f| {
            frames.push(f.to_vec());
            Ok(())
        })
        .unwrap();

        assert_eq!(frames.len(), 6);
        let sizes: Vec<usize> =
            frames.iter().map(|f| Container::parse(f).unwrap().payload().len()).collect();
        assert_eq!(sizes, vec![18, 20, 20, 20, 20, 2]);

        assert_eq!(reassemble(&frames, 4096), payload);
    }

    #[test]
    fn send_error_reports_failed_sequence() {
        #[derive(Debug, thiserror::Error)]
        #[error("backpressure")]
        struct Backpressure;

        let payload = [0xAB; 100];
        let mut sent = 0;
        let result = split_and_send(5, &payload, 27, |_f| {
            sent += 1;
            if sent > 2 { Err(Backpressure) } else { Ok(()) }
        });

        assert!(matches!(result, Err(SplitError::Send { sequence: 2, .. })));
        assert_eq!(sent, 3);
    }

    #[test]
    fn tiny_mtu_is_rejected() {
        let result = split_and_send::<NoError, _>(0, b"hi", 9, |_f| Ok(()));
        assert!(matches!(
            result,
            Err(SplitError::Protocol(ProtocolError::MtuTooSmall { mtu: 9, .. }))
        ));
    }

    #[test]
    fn frame_writer_matches_one_shot_splitter() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        let mut one_shot: Vec<Vec<u8>> = Vec::new();
        split_and_send::<NoError, _>(3, &payload, 27, |f| {
            one_shot.push(f.to_vec());
            Ok(())
        })
        .unwrap();

        let mut streamed: Vec<Vec<u8>> = Vec::new();
        let mut writer = FrameWriter::new(3, 1000, 27, |f: &[u8]| {
            streamed.push(f.to_vec());
            Ok::<(), NoError>(())
        })
        .unwrap();
        // Drive with awkward chunk sizes to exercise buffering.
        for chunk in payload.chunks(7) {
            writer.write(chunk).unwrap();
        }
        writer.finish().unwrap();

        assert_eq!(one_shot, streamed);
    }

    #[test]
    fn frame_writer_emits_empty_first_for_zero_length() {
        let mut frames: Vec<Vec<u8>> = Vec::new();
        let writer = FrameWriter::new(0, 0, 247, |f: &[u8]| {
            frames.push(f.to_vec());
            Ok::<(), NoError>(())
        })
        .unwrap();
        writer.finish().unwrap();

        assert_eq!(frames.len(), 1);
        let parsed = Container::parse(&frames[0]).unwrap();
        assert_eq!(parsed, Container::First { transaction_id: 0, total_length: 0, payload: &[] });
    }

    #[test]
    fn frame_writer_detects_short_stream() {
        let mut writer =
            FrameWriter::new(0, 10, 247, |_f: &[u8]| Ok::<(), NoError>(())).unwrap();
        writer.write(b"abc").unwrap();
        let result = writer.finish();
        assert!(matches!(
            result,
            Err(SplitError::LengthMismatch { declared: 10, written: 3 })
        ));
    }
}
