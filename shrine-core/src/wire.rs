//! Framing: tag byte, then for MESSAGE a 4-byte BE length + codec payload; for STREAM nothing.
//!
//! A STREAM tag carries no length. The body is the raw bytes that follow it, and its size is
//! the `size` of the last `StoreAnnounce` received on the same connection. Draining those
//! bytes is the caller's job.

use tokio::io::{AsyncRead, AsyncReadExt};

pub const TAG_MESSAGE: u8 = 0x1;
pub const TAG_STREAM: u8 = 0x2;

const LEN_SIZE: usize = 4;
pub const MAX_MESSAGE_LEN: u32 = 64 * 1024;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Serialized control message (codec bytes, not yet decoded).
    Message(Vec<u8>),
    /// Raw stream follows; nothing past the tag has been read.
    Stream,
}

/// Encode a control message payload into a MESSAGE frame.
pub fn encode_message(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_MESSAGE_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(1 + LEN_SIZE + payload.len());
    out.push(TAG_MESSAGE);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// The STREAM marker. Raw payload bytes go out right after it, unprefixed.
pub fn encode_stream_header() -> [u8; 1] {
    [TAG_STREAM]
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("message too large")]
    TooLarge,
}

/// Read exactly one frame. On STREAM only the tag byte is consumed.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameDecodeError>
where
    R: AsyncRead + Unpin,
{
    let tag = reader.read_u8().await?;
    match tag {
        TAG_STREAM => Ok(Frame::Stream),
        TAG_MESSAGE => {
            let len = reader.read_u32().await?;
            if len > MAX_MESSAGE_LEN {
                return Err(FrameDecodeError::TooLarge(len));
            }
            let mut payload = vec![0u8; len as usize];
            reader.read_exact(&mut payload).await?;
            Ok(Frame::Message(payload))
        }
        other => Err(FrameDecodeError::UnknownTag(other)),
    }
}

/// Framing error. Always fatal for the connection it came from.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),
    #[error("message of {0} bytes exceeds limit")]
    TooLarge(u32),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameDecodeError {
    /// Clean EOF before a tag byte, i.e. the remote hung up between frames.
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameDecodeError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}
