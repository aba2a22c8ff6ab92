//! Payload compression for READ images and WRITE data.
//!
//! Only zlib (via `flate2`) is implemented.  The bzip2 algorithm id is
//! reserved on the wire so that a peer advertising it can be parsed, but
//! payloads marked with it are rejected as unsupported.

use std::io::{Read, Write};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};

use crate::protocol::codec::ProtocolError;
use crate::protocol::messages::CompressionAlgorithm;

/// Compresses `data` with `algorithm` at `level` (0–9).
///
/// # Errors
///
/// Returns [`ProtocolError::UnsupportedAlgorithm`] for algorithms this build
/// cannot produce, or [`ProtocolError::Decode`] if the encoder fails.
pub fn compress(
    algorithm: CompressionAlgorithm,
    level: u8,
    data: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    match algorithm {
        CompressionAlgorithm::Zlib => {
            let mut encoder = ZlibEncoder::new(
                Vec::with_capacity(data.len() / 2),
                Compression::new(u32::from(level.min(9))),
            );
            encoder
                .write_all(data)
                .map_err(|e| ProtocolError::Decode(format!("zlib compress: {e}")))?;
            encoder
                .finish()
                .map_err(|e| ProtocolError::Decode(format!("zlib compress: {e}")))
        }
        CompressionAlgorithm::Bzip2 => Err(ProtocolError::UnsupportedAlgorithm(algorithm as u8)),
    }
}

/// Decompresses `data` that was produced by [`compress`].
///
/// # Errors
///
/// Returns [`ProtocolError::Decode`] for corrupt input and
/// [`ProtocolError::UnsupportedAlgorithm`] for algorithms this build cannot read.
pub fn decompress(algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    match algorithm {
        CompressionAlgorithm::Zlib => {
            let mut out = Vec::with_capacity(data.len() * 2);
            ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| ProtocolError::Decode(format!("zlib decompress: {e}")))?;
            Ok(out)
        }
        CompressionAlgorithm::Bzip2 => Err(ProtocolError::UnsupportedAlgorithm(algorithm as u8)),
    }
}
