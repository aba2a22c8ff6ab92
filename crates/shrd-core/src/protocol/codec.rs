//! Binary codec for shared device protocol messages.
//!
//! Wire format:
//! ```text
//! [cmd:1][flags:1][devnum:2][id:2][len:4][payload:len]
//! ```
//! Total header size: 10 bytes. All multi-byte integers are big-endian.
//!
//! When the COMP marker is set on `cmd`, the first `offset` payload bytes
//! travel uncompressed and the rest is compressed with `algorithm`, where
//! `flags = (algorithm << 5) | offset`.

use thiserror::Error;

use crate::protocol::compression::{compress, decompress};
use crate::protocol::messages::{
    CompressionAlgorithm, Header, COMP_MARKER, HEADER_SIZE, MAX_COMPRESS_OFFSET, MAX_PAYLOAD_LEN,
    MIN_COMPRESS_LEN,
};

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The header declares more payload than is available.
    #[error("payload length mismatch: header says {declared}, available is {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },

    /// The payload exceeds [`MAX_PAYLOAD_LEN`].
    #[error("payload of {0} bytes exceeds the protocol limit")]
    PayloadTooLarge(usize),

    /// The command byte is not a recognized request opcode.
    #[error("unknown command: 0x{0:02X}")]
    UnknownCommand(u8),

    /// The payload could not be decompressed or is structurally invalid.
    #[error("decode error: {0}")]
    Decode(String),

    /// The compression algorithm id is not implemented.
    #[error("unsupported compression algorithm: {0}")]
    UnsupportedAlgorithm(u8),
}

/// Compression parameters negotiated for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionSpec {
    pub algorithm: CompressionAlgorithm,
    /// Compression level, 0–9.
    pub level: u8,
    /// Number of leading payload bytes to leave uncompressed (at most 31).
    pub offset: usize,
}

impl CompressionSpec {
    /// zlib at `level` with no uncompressed prefix.
    pub fn zlib(level: u8) -> Self {
        Self {
            algorithm: CompressionAlgorithm::Zlib,
            level,
            offset: 0,
        }
    }

    /// Returns a copy that keeps `offset` leading bytes uncompressed.
    pub fn with_offset(self, offset: usize) -> Self {
        Self {
            offset: offset.min(MAX_COMPRESS_OFFSET),
            ..self
        }
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

/// Encodes the fixed header.  The `length` field is written as given.
pub fn encode_header(header: &Header) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0] = header.cmd;
    buf[1] = header.flags;
    buf[2..4].copy_from_slice(&header.devnum.to_be_bytes());
    buf[4..6].copy_from_slice(&header.id.to_be_bytes());
    buf[6..10].copy_from_slice(&header.length.to_be_bytes());
    buf
}

/// Decodes the fixed header from the start of `bytes`.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] when fewer than
/// [`HEADER_SIZE`] bytes are available.
pub fn decode_header(bytes: &[u8]) -> Result<Header, ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }
    Ok(Header {
        cmd: bytes[0],
        flags: bytes[1],
        devnum: u16::from_be_bytes([bytes[2], bytes[3]]),
        id: u16::from_be_bytes([bytes[4], bytes[5]]),
        length: u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
    })
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Encodes a complete message: header plus (possibly compressed) payload.
///
/// Compression is only attempted when `compression` is given, the header
/// carries no command-specific flags, at least [`MIN_COMPRESS_LEN`] bytes
/// follow the uncompressed prefix, and the compressed form is smaller.
/// The header's `length` field is recomputed.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] or a compression failure.
///
/// # Examples
///
/// ```rust
/// use shrd_core::protocol::{decode_message, encode_message, Command, Header};
///
/// let header = Header::request(Command::Read, 0, 0x0190, 1);
/// let bytes = encode_message(&header, &5u32.to_be_bytes(), None).unwrap();
/// let (decoded, payload, consumed) = decode_message(&bytes).unwrap();
/// assert_eq!(decoded.command(), Some(Command::Read));
/// assert_eq!(payload, 5u32.to_be_bytes());
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_message(
    header: &Header,
    payload: &[u8],
    compression: Option<&CompressionSpec>,
) -> Result<Vec<u8>, ProtocolError> {
    let mut header = *header;
    header.cmd &= !COMP_MARKER;

    if let Some(spec) = compression {
        let offset = spec.offset.min(MAX_COMPRESS_OFFSET).min(payload.len());
        let tail = &payload[offset..];
        if header.flags == 0 && tail.len() >= MIN_COMPRESS_LEN {
            let packed = compress(spec.algorithm, spec.level, tail)?;
            if packed.len() < tail.len() {
                header.cmd |= COMP_MARKER;
                header.flags = ((spec.algorithm as u8) << 5) | offset as u8;
                return finish(header, &[&payload[..offset], &packed]);
            }
        }
    }

    finish(header, &[payload])
}

fn finish(mut header: Header, parts: &[&[u8]]) -> Result<Vec<u8>, ProtocolError> {
    let len: usize = parts.iter().map(|p| p.len()).sum();
    if len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge(len));
    }
    header.length = len as u32;

    let mut buf = Vec::with_capacity(HEADER_SIZE + len);
    buf.extend_from_slice(&encode_header(&header));
    for part in parts {
        buf.extend_from_slice(part);
    }
    Ok(buf)
}

/// Decodes one message from the beginning of `bytes`.
///
/// Returns the header (with the COMP marker and compression descriptor
/// cleared, and `length` set to the decompressed size), the payload, and
/// the number of bytes consumed.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are truncated or the compressed
/// payload cannot be decoded.  A decode failure means the stream is no
/// longer trustworthy and the connection should be dropped.
pub fn decode_message(bytes: &[u8]) -> Result<(Header, Vec<u8>, usize), ProtocolError> {
    let mut header = decode_header(bytes)?;
    let declared = header.length as usize;
    if declared > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge(declared));
    }

    let total_needed = HEADER_SIZE + declared;
    if bytes.len() < total_needed {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared,
            available: bytes.len() - HEADER_SIZE,
        });
    }
    let raw = &bytes[HEADER_SIZE..total_needed];

    let payload = if header.is_compressed() {
        let algorithm_id = header.flags >> 5;
        let offset = (header.flags & 0x1F) as usize;
        let algorithm = CompressionAlgorithm::try_from(algorithm_id)
            .map_err(|_| ProtocolError::UnsupportedAlgorithm(algorithm_id))?;
        if offset > raw.len() {
            return Err(ProtocolError::Decode(format!(
                "uncompressed prefix of {offset} bytes exceeds payload of {}",
                raw.len()
            )));
        }
        let mut out = raw[..offset].to_vec();
        out.extend_from_slice(&decompress(algorithm, &raw[offset..])?);
        header.cmd &= !COMP_MARKER;
        header.flags = 0;
        out
    } else {
        raw.to_vec()
    };

    header.length = payload.len() as u32;
    Ok((header, payload, total_needed))
}

// ── Payload helpers ───────────────────────────────────────────────────────────

/// Reads a big-endian `u32` at `offset`.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] if the buffer is too short.
pub fn read_u32(buf: &[u8], offset: usize) -> Result<u32, ProtocolError> {
    if buf.len() < offset + 4 {
        return Err(ProtocolError::InsufficientData {
            needed: offset + 4,
            available: buf.len(),
        });
    }
    Ok(u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]))
}

/// Encodes a list of block numbers as consecutive big-endian `u32`s.
pub fn encode_block_list(blocks: &[u32]) -> Vec<u8> {
    blocks.iter().flat_map(|b| b.to_be_bytes()).collect()
}

/// Decodes a payload of consecutive big-endian `u32`s.
///
/// # Errors
///
/// Returns [`ProtocolError::Decode`] if the length is not a multiple of 4.
pub fn decode_block_list(payload: &[u8]) -> Result<Vec<u32>, ProtocolError> {
    if payload.len() % 4 != 0 {
        return Err(ProtocolError::Decode(format!(
            "block list of {} bytes is not a multiple of 4",
            payload.len()
        )));
    }
    Ok(payload
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
