//! Async framing helpers shared by the server and the client.
//!
//! A frame is one header plus `length` payload bytes.  Reading is done in
//! two steps (header, then payload) so the payload size is known before the
//! buffer is allocated.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::codec::{
    decode_header, decode_message, encode_message, CompressionSpec, ProtocolError,
};
use crate::protocol::messages::{Header, HEADER_SIZE, MAX_PAYLOAD_LEN};

/// Errors raised while moving frames over a byte stream.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The underlying stream failed or was closed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    /// The bytes could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl FrameError {
    /// Returns `true` when the peer closed the stream cleanly between frames.
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Reads and decodes one message.
///
/// # Errors
///
/// Returns [`FrameError::Io`] on stream failure or EOF and
/// [`FrameError::Protocol`] if the frame cannot be decoded.
pub async fn read_frame<R>(reader: &mut R) -> Result<(Header, Vec<u8>), FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; HEADER_SIZE];
    reader.read_exact(&mut buf).await?;

    let header = decode_header(&buf)?;
    let payload_len = header.length as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge(payload_len).into());
    }
    if payload_len > 0 {
        buf.resize(HEADER_SIZE + payload_len, 0);
        reader.read_exact(&mut buf[HEADER_SIZE..]).await?;
    }

    let (header, payload, _) = decode_message(&buf)?;
    Ok((header, payload))
}

/// Encodes and writes one message, flushing the stream.
///
/// # Errors
///
/// Returns [`FrameError`] if encoding or the write fails.
pub async fn write_frame<W>(
    writer: &mut W,
    header: &Header,
    payload: &[u8],
    compression: Option<&CompressionSpec>,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_message(header, payload, compression)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
