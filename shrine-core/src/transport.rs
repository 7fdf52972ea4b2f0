//! TCP transport: accept loop, dialing, handshake, and one read loop per connection.
//!
//! Read loops push MESSAGE frames and stream notifications onto one bounded queue consumed
//! by the owner. A full queue blocks every read loop (backpressure, no dropping). On a
//! STREAM tag the loop parks on the peer's stream gate until the owner has drained the body.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::handshake::{Handshake, HandshakeError, VersionHandshake};
use crate::peer::{Peer, PeerError, StreamRelease};
use crate::registry::RegistryError;
use crate::wire::{self, Frame, FrameDecodeError};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Owner callbacks for connection lifecycle.
pub trait PeerHandler: Send + Sync {
    /// Called once the handshake succeeded. An error closes the connection.
    fn on_peer(&self, peer: Arc<Peer>) -> Result<(), RegistryError>;
    /// Called when a registered peer's read loop has exited.
    fn on_peer_closed(&self, addr: SocketAddr);
}

/// Something a read loop observed on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rpc {
    pub from: SocketAddr,
    pub body: RpcBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcBody {
    /// Undecoded control message payload.
    Message(Vec<u8>),
    /// A STREAM tag arrived; the sender's read loop is parked until the stream is released.
    Stream,
}

#[derive(Clone)]
pub struct TransportConfig {
    pub listen_addr: String,
    pub handshake: Arc<dyn Handshake>,
    pub queue_capacity: usize,
    pub handshake_timeout: Option<Duration>,
    /// Force-close a connection whose stream is not released within this bound.
    pub stream_timeout: Option<Duration>,
}

impl TransportConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handshake: Arc::new(VersionHandshake),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            stream_timeout: None,
        }
    }
}

pub struct Transport {
    config: TransportConfig,
    handler: Arc<dyn PeerHandler>,
    rpc_tx: mpsc::Sender<Rpc>,
    local_addr: OnceLock<SocketAddr>,
    shutdown: watch::Sender<bool>,
}

impl Transport {
    /// Build a transport. The returned receiver is the consumption queue; it must be drained.
    pub fn new(
        config: TransportConfig,
        handler: Arc<dyn PeerHandler>,
    ) -> (Arc<Self>, mpsc::Receiver<Rpc>) {
        let (rpc_tx, rpc_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let transport = Arc::new(Self {
            config,
            handler,
            rpc_tx,
            local_addr: OnceLock::new(),
            shutdown,
        });
        (transport, rpc_rx)
    }

    /// Configured listen address, as given.
    pub fn addr(&self) -> &str {
        &self.config.listen_addr
    }

    /// Bound address once listening (resolves port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Bind and spawn the accept loop.
    pub async fn listen(self: &Arc<Self>) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: self.config.listen_addr.clone(),
                source,
            })?;
        let local = listener.local_addr()?;
        self.local_addr
            .set(local)
            .map_err(|_| TransportError::AlreadyListening)?;

        tracing::info!(addr = %local, "listening");
        tokio::spawn(self.clone().accept_loop(listener));
        Ok(local)
    }

    /// Open an outbound connection. Handshake and read loop run on their own task.
    pub async fn dial(self: &Arc<Self>, addr: &str) -> Result<SocketAddr, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Dial {
                addr: addr.to_string(),
                source,
            })?;
        let remote = stream.peer_addr()?;
        tokio::spawn(self.clone().handle_conn(stream, true));
        Ok(remote)
    }

    /// Stop accepting. Existing connections keep running until they error or are closed.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = closed(&mut shutdown) => {
                    tracing::info!(addr = %self.config.listen_addr, "listener closed");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            tokio::spawn(self.clone().handle_conn(stream, false));
                        }
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, outbound: bool) {
        let peer = match Peer::new(stream, outbound) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                tracing::warn!(error = %e, "connection lost before setup");
                return;
            }
        };
        let addr = peer.addr();

        if let Err(e) = self.handshake(&peer).await {
            tracing::warn!(peer = %addr, error = %e, "handshake failed");
            let _ = peer.close().await;
            return;
        }
        if let Err(e) = self.handler.on_peer(peer.clone()) {
            tracing::warn!(peer = %addr, error = %e, "peer rejected");
            let _ = peer.close().await;
            return;
        }

        match self.read_loop(&peer).await {
            Ok(()) => tracing::debug!(peer = %addr, "consumer gone, read loop stopped"),
            Err(e) if e.is_eof() => tracing::debug!(peer = %addr, "remote hung up"),
            Err(e) => tracing::warn!(peer = %addr, error = %e, "connection dropped"),
        }
        peer.clear_stream();
        self.handler.on_peer_closed(addr);
        let _ = peer.close().await;
    }

    async fn handshake(&self, peer: &Peer) -> Result<(), HandshakeError> {
        let handshake = self.config.handshake.handshake(peer);
        match self.config.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .map_err(|_| HandshakeError::Timeout)?,
            None => handshake.await,
        }
    }

    /// Runs until a framing error, an aborted stream, or the consumer dropping the queue.
    async fn read_loop(&self, peer: &Peer) -> Result<(), TransportError> {
        let from = peer.addr();
        loop {
            let frame = {
                let mut reader = peer.reader().await;
                wire::read_frame(&mut *reader).await?
            };

            match frame {
                Frame::Message(payload) => {
                    let rpc = Rpc {
                        from,
                        body: RpcBody::Message(payload),
                    };
                    if self.rpc_tx.send(rpc).await.is_err() {
                        return Ok(());
                    }
                }
                Frame::Stream => {
                    let gate = peer.open_stream()?;
                    let rpc = Rpc {
                        from,
                        body: RpcBody::Stream,
                    };
                    if self.rpc_tx.send(rpc).await.is_err() {
                        return Ok(());
                    }
                    tracing::debug!(peer = %from, "stream pending, read loop parked");

                    let release = match self.config.stream_timeout {
                        Some(limit) => tokio::time::timeout(limit, gate)
                            .await
                            .map_err(|_| TransportError::StreamTimeout)?,
                        None => gate.await,
                    };
                    match release {
                        Ok(StreamRelease::Resume) => {
                            tracing::debug!(peer = %from, "stream released, read loop resumed")
                        }
                        Ok(StreamRelease::Abort) | Err(_) => {
                            return Err(TransportError::StreamAborted)
                        }
                    }
                }
            }
        }
    }
}

pub(crate) async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("already listening")]
    AlreadyListening,
    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("framing: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error("peer: {0}")]
    Peer(#[from] PeerError),
    #[error("stream was not released in time")]
    StreamTimeout,
    #[error("stream aborted by owner")]
    StreamAborted,
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn is_eof(&self) -> bool {
        matches!(self, TransportError::Frame(e) if e.is_eof())
    }
}
