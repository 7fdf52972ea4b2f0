//! Handle over one live peer connection.
//!
//! The read half is owned by the transport's read loop except while a stream is pending:
//! then the loop parks on the stream gate and the owner drains the body through
//! [`Peer::reader`] before calling [`Peer::release_stream`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, MutexGuard};

use crate::wire;

/// What the read loop does once the owner is done with a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamRelease {
    Resume,
    Abort,
}

pub struct Peer {
    addr: SocketAddr,
    /// true if we dialed, false if we accepted.
    outbound: bool,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    gate: StdMutex<Option<oneshot::Sender<StreamRelease>>>,
}

impl Peer {
    pub fn new(stream: TcpStream, outbound: bool) -> io::Result<Self> {
        let addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            addr,
            outbound,
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(write_half),
            gate: StdMutex::new(None),
        })
    }

    /// Remote address; the peer's identity in the registry.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn outbound(&self) -> bool {
        self.outbound
    }

    /// Write raw bytes (normally an encoded frame) to the connection.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), PeerError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Write a STREAM tag and the raw body under one writer lock, so no other frame can land
    /// between them. Returns the number of body bytes written.
    pub async fn send_stream(&self, payload: &[u8]) -> Result<u64, PeerError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&wire::encode_stream_header()).await?;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(payload.len() as u64)
    }

    /// Exclusive access to the buffered read half. Only meaningful for the owner while a
    /// stream is pending; otherwise the read loop holds it.
    pub async fn reader(&self) -> MutexGuard<'_, BufReader<OwnedReadHalf>> {
        self.reader.lock().await
    }

    /// Let the parked read loop resume reading frames. Call exactly once per stream
    /// notification, after the announced bytes have been drained.
    pub fn release_stream(&self) -> Result<(), PeerError> {
        self.finish_stream(StreamRelease::Resume)
    }

    /// Tell the parked read loop the stream could not be consumed; it closes the connection.
    pub fn abort_stream(&self) -> Result<(), PeerError> {
        self.finish_stream(StreamRelease::Abort)
    }

    pub fn stream_pending(&self) -> bool {
        self.gate().is_some()
    }

    /// Shut down our write direction. The remote sees EOF and hangs up, which ends our read loop.
    pub async fn close(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }

    pub(crate) fn open_stream(&self) -> Result<oneshot::Receiver<StreamRelease>, PeerError> {
        let mut gate = self.gate();
        if gate.is_some() {
            return Err(PeerError::StreamInFlight);
        }
        let (tx, rx) = oneshot::channel();
        *gate = Some(tx);
        Ok(rx)
    }

    pub(crate) fn clear_stream(&self) {
        self.gate().take();
    }

    fn finish_stream(&self, release: StreamRelease) -> Result<(), PeerError> {
        let tx = self.gate().take().ok_or(PeerError::NoPendingStream)?;
        tx.send(release).map_err(|_| PeerError::ReadLoopGone)
    }

    fn gate(&self) -> StdMutexGuard<'_, Option<oneshot::Sender<StreamRelease>>> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("outbound", &self.outbound)
            .field("stream_pending", &self.stream_pending())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("a stream is already in flight on this peer")]
    StreamInFlight,
    #[error("no stream pending on this peer")]
    NoPendingStream,
    #[error("read loop is gone")]
    ReadLoopGone,
    #[error("io: {0}")]
    Io(#[from] io::Error),
}
