//! Packet obfuscation codec
//!
//! Wire layout (all integers big-endian):
//!
//! ```text
//! nonce(4) | client_id ^ nonce(4) | generation ^ x1(8) | sequence ^ x2(8) | whitened payload
//! ```
//!
//! `x1` and `x2` are derived from the per-packet nonce and the shared client
//! id. The payload goes through a running-XOR whitener keyed by the nonce.
//! None of this is encryption; the identity tag only filters out traffic that
//! does not carry the shared client id.

use std::ops::Range;

use crate::config::ClientId;
use crate::error::ProtocolError;
use crate::protocol::frame::Frame;

/// Size of the wire header
pub const HEADER_LEN: usize = 24;

const GENERATION_MASK: u64 = 0x7361_4bcf_0a49_671d;
const SEQUENCE_MASK: u64 = 0x9683_4d5e_3201_7c65;

const WHITEN_SEED: u8 = 0x13;
const WHITEN_STEP: u8 = 19;

/// Values recovered from a wire header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub nonce: u32,
    pub generation: u64,
    pub sequence: u64,
}

/// Result of decoding a packet in place
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub header: PacketHeader,
    /// Location of the de-whitened payload inside the decoded buffer
    pub payload: Range<usize>,
}

/// Encode `buf[offset..offset + len]` in place with a fresh random nonce
///
/// The header is written into the 24 bytes directly before `offset`.
/// Returns the range of the complete wire packet inside `buf`.
pub fn encode(
    client_id: ClientId,
    generation: u64,
    sequence: u64,
    buf: &mut [u8],
    offset: usize,
    len: usize,
) -> Result<Range<usize>, ProtocolError> {
    encode_with_nonce(rand::random(), client_id, generation, sequence, buf, offset, len)
}

fn encode_with_nonce(
    nonce: u32,
    client_id: ClientId,
    generation: u64,
    sequence: u64,
    buf: &mut [u8],
    offset: usize,
    len: usize,
) -> Result<Range<usize>, ProtocolError> {
    let needed = HEADER_LEN + len;
    if buf.len() < needed || offset.saturating_add(len) > buf.len() {
        return Err(ProtocolError::BufferTooSmall {
            needed: needed.max(offset.saturating_add(len)),
            capacity: buf.len(),
        });
    }

    if offset < HEADER_LEN {
        return Err(ProtocolError::InsufficientHeadroom {
            offset,
            needed: HEADER_LEN,
        });
    }

    let start = offset - HEADER_LEN;
    let id = client_id.get();
    let header = &mut buf[start..offset];
    header[0..4].copy_from_slice(&nonce.to_be_bytes());
    header[4..8].copy_from_slice(&(id ^ nonce).to_be_bytes());
    header[8..16].copy_from_slice(&(generation ^ generation_mask(nonce, id)).to_be_bytes());
    header[16..24].copy_from_slice(&(sequence ^ sequence_mask(nonce, id)).to_be_bytes());

    whiten(nonce, &mut buf[offset..offset + len]);

    Ok(start..offset + len)
}

/// Decode a complete wire packet in place
///
/// Rejects packets shorter than the header and packets whose identity tag
/// does not match `client_id`. The payload is de-whitened where it lies.
pub fn decode(client_id: ClientId, packet: &mut [u8]) -> Result<Decoded, ProtocolError> {
    if packet.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated {
            len: packet.len(),
            min: HEADER_LEN,
        });
    }

    let id = client_id.get();
    let nonce = read_u32(&packet[0..4]);
    let tagged_id = read_u32(&packet[4..8]);
    if tagged_id ^ nonce != id {
        return Err(ProtocolError::IdentityMismatch);
    }

    let generation = read_u64(&packet[8..16]) ^ generation_mask(nonce, id);
    let sequence = read_u64(&packet[16..24]) ^ sequence_mask(nonce, id);

    whiten(nonce, &mut packet[HEADER_LEN..]);

    Ok(Decoded {
        header: PacketHeader {
            nonce,
            generation,
            sequence,
        },
        payload: HEADER_LEN..packet.len(),
    })
}

/// Encode the frame's window in place; on success the window covers the wire packet
pub fn seal(
    client_id: ClientId,
    generation: u64,
    sequence: u64,
    frame: &mut Frame,
) -> Result<(), ProtocolError> {
    let (buf, start, end) = frame.parts_mut();
    let wire = encode(client_id, generation, sequence, buf, start, end - start)?;
    frame.set_window(wire.start, wire.end);
    Ok(())
}

/// Decode the frame's window in place; on success the window covers the payload
pub fn open(client_id: ClientId, frame: &mut Frame) -> Result<PacketHeader, ProtocolError> {
    let (buf, start, end) = frame.parts_mut();
    let decoded = decode(client_id, &mut buf[start..end])?;
    frame.set_window(start + decoded.payload.start, start + decoded.payload.end);
    Ok(decoded.header)
}

/// Hex dump of the (possibly partial) header, for trace logs of dropped packets
pub fn header_hex(packet: &[u8]) -> String {
    hex::encode(&packet[..packet.len().min(HEADER_LEN)])
}

fn generation_mask(nonce: u32, client_id: u32) -> u64 {
    (((nonce as u64) << 32) | client_id as u64) ^ GENERATION_MASK
}

fn sequence_mask(nonce: u32, client_id: u32) -> u64 {
    (((client_id as u64) << 32) | nonce as u64) ^ SEQUENCE_MASK
}

/// Running-XOR whitener; applying it twice with the same nonce is the identity
fn whiten(nonce: u32, data: &mut [u8]) {
    let mut key = ((nonce >> 9) as u8) ^ WHITEN_SEED;
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key;
        if i % 4 == 0 {
            key = key.wrapping_add(WHITEN_STEP);
        }
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    u32::from_be_bytes(raw)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_be_bytes(raw)
}
