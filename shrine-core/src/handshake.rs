//! Connection handshakes, run once per connection before the peer is registered.

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::peer::{Peer, PeerError};
use crate::protocol::PROTOCOL_VERSION;

const MAGIC: &[u8; 4] = b"SHRN";
const HANDSHAKE_SIZE: usize = 4 + 1; // magic + version

#[async_trait]
pub trait Handshake: Send + Sync {
    async fn handshake(&self, peer: &Peer) -> Result<(), HandshakeError>;
}

/// Accepts every connection without exchanging anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopHandshake;

#[async_trait]
impl Handshake for NopHandshake {
    async fn handshake(&self, _peer: &Peer) -> Result<(), HandshakeError> {
        Ok(())
    }
}

/// Both sides send magic + protocol version, then check what the other sent.
/// Symmetric, so it works the same for dialed and accepted connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionHandshake;

#[async_trait]
impl Handshake for VersionHandshake {
    async fn handshake(&self, peer: &Peer) -> Result<(), HandshakeError> {
        peer.send(&handshake_bytes()).await?;

        let mut buf = [0u8; HANDSHAKE_SIZE];
        peer.reader().await.read_exact(&mut buf).await?;
        if &buf[..4] != MAGIC {
            return Err(HandshakeError::BadMagic);
        }
        if buf[4] != PROTOCOL_VERSION {
            return Err(HandshakeError::Version(buf[4]));
        }
        Ok(())
    }
}

fn handshake_bytes() -> [u8; HANDSHAKE_SIZE] {
    let mut out = [0u8; HANDSHAKE_SIZE];
    out[..4].copy_from_slice(MAGIC);
    out[4] = PROTOCOL_VERSION;
    out
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("not a shrine peer")]
    BadMagic,
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("timed out")]
    Timeout,
    #[error("send failed: {0}")]
    Send(#[from] PeerError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
