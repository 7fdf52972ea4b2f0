//! File server: local store plus replication to every connected peer.
//!
//! A replication is `StoreAnnounce{key, size}` to each peer, a settle step, then the STREAM
//! tag and raw bytes fanned out concurrently. Receivers record the announce, ack it, and
//! when the stream notification arrives drain exactly `size` bytes into storage before
//! releasing the peer's read loop.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use crate::handshake::Handshake;
use crate::peer::{Peer, PeerError};
use crate::protocol::{BincodeCodec, CodecError, ControlMessage, MessageCodec};
use crate::registry::{Announce, PeerRegistry, RegistryError};
use crate::storage::{PathTransform, Storage, StorageError};
use crate::transport::{self, Rpc, RpcBody, Transport, TransportConfig, TransportError};
use crate::wire::{self, FrameEncodeError};

/// Fixed wait between announce and stream when acks are not used.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(2);

const STORED_EVENTS: usize = 64;

/// How the sender decides receivers are ready for the stream body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    /// Sleep, then stream.
    Delay(Duration),
    /// Wait for a `StoreAck` from every announced peer; stream anyway once `timeout` elapses.
    Ack { timeout: Duration },
}

impl Default for Settle {
    fn default() -> Self {
        Settle::Ack {
            timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

#[derive(Clone)]
pub struct ServerConfig {
    pub transport: TransportConfig,
    pub bootstrap_nodes: Vec<String>,
    pub storage_root: PathBuf,
    pub path_transform: Option<PathTransform>,
    pub codec: Arc<dyn MessageCodec>,
    pub settle: Settle,
}

impl ServerConfig {
    pub fn new(listen_addr: impl Into<String>, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            transport: TransportConfig::new(listen_addr),
            bootstrap_nodes: Vec::new(),
            storage_root: storage_root.into(),
            path_transform: None,
            codec: Arc::new(BincodeCodec),
            settle: Settle::default(),
        }
    }

    pub fn with_bootstrap<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bootstrap_nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_handshake(mut self, handshake: Arc<dyn Handshake>) -> Self {
        self.transport.handshake = handshake;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_settle(mut self, settle: Settle) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_path_transform(mut self, transform: PathTransform) -> Self {
        self.path_transform = Some(transform);
        self
    }
}

pub struct FileServer {
    bootstrap_nodes: Vec<String>,
    storage: Storage,
    transport: Arc<Transport>,
    registry: PeerRegistry,
    codec: Arc<dyn MessageCodec>,
    settle: Settle,
    /// Held across announce + stream so two replications never interleave on a connection.
    replication: Mutex<()>,
    acks: StdMutex<HashMap<(SocketAddr, String), oneshot::Sender<()>>>,
    stored: broadcast::Sender<String>,
    rpc_rx: StdMutex<Option<mpsc::Receiver<Rpc>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FileServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let storage = match config.path_transform {
            Some(transform) => Storage::with_transform(config.storage_root, transform),
            None => Storage::new(config.storage_root),
        };
        let registry = PeerRegistry::new();
        let (transport, rpc_rx) = Transport::new(config.transport, Arc::new(registry.clone()));
        let (stored, _) = broadcast::channel(STORED_EVENTS);
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            bootstrap_nodes: config.bootstrap_nodes,
            storage,
            transport,
            registry,
            codec: config.codec,
            settle: config.settle,
            replication: Mutex::new(()),
            acks: StdMutex::new(HashMap::new()),
            stored,
            rpc_rx: StdMutex::new(Some(rpc_rx)),
            shutdown,
            task: Mutex::new(None),
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.registry.addrs()
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    /// Listen, dial bootstrap nodes in the background and spawn the receive loop.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, ServerError> {
        let addr = self.transport.listen().await?;
        let rpc_rx = lock(&self.rpc_rx)
            .take()
            .ok_or(ServerError::AlreadyStarted)?;

        self.bootstrap(addr);
        let handle = tokio::spawn(self.clone().run(rpc_rx));
        *self.task.lock().await = Some(handle);
        tracing::info!(%addr, root = %self.storage.root().display(), "file server started");
        Ok(addr)
    }

    /// Stop the receive loop and the listener. Open connections wind down on their own.
    pub async fn stop(&self) {
        tracing::info!(addr = %self.transport.addr(), "stopping file server");
        self.shutdown.send_replace(true);
        self.transport.close();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }

    fn bootstrap(&self, local: SocketAddr) {
        let local = local.to_string();
        for addr in &self.bootstrap_nodes {
            if addr.is_empty() || *addr == local || addr == self.transport.addr() {
                continue;
            }
            let transport = self.transport.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                tracing::info!(remote = %addr, "dialing bootstrap node");
                if let Err(e) = transport.dial(&addr).await {
                    tracing::warn!(remote = %addr, error = %e, "bootstrap dial failed");
                }
            });
        }
    }

    /// Persist `reader` under `key`, then replicate it to every connected peer.
    /// Returns the local size. Peers that fail are reported in the error; the others still
    /// get the replica and the local copy is kept.
    pub async fn store<R>(&self, key: &str, mut reader: R) -> Result<u64, ServerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .map_err(ServerError::Input)?;
        let size = self.storage.write(key, &mut data.as_slice()).await?;

        let peers = self.registry.snapshot();
        tracing::info!(key, size, peers = peers.len(), "stored locally, replicating");
        let written = self.replicate(key, data.into(), peers).await?;
        tracing::info!(key, written, "replicated");
        Ok(size)
    }

    pub async fn read(&self, key: &str) -> Result<Vec<u8>, ServerError> {
        Ok(self.storage.read(key).await?)
    }

    pub async fn has(&self, key: &str) -> Result<bool, ServerError> {
        Ok(self.storage.has(key).await?)
    }

    /// Local delete only; replicas on peers are untouched.
    pub async fn delete(&self, key: &str) -> Result<(), ServerError> {
        Ok(self.storage.delete(key).await?)
    }

    /// Read `key` locally, or ask every peer for it and wait up to `wait` for a replica.
    pub async fn fetch(&self, key: &str, wait: Duration) -> Result<Vec<u8>, ServerError> {
        if self.storage.has(key).await? {
            return self.read(key).await;
        }

        let mut stored = self.stored.subscribe();
        let frame = self.encode(&ControlMessage::GetRequest {
            key: key.to_string(),
        })?;
        for peer in self.registry.snapshot() {
            if let Err(e) = peer.send(&frame).await {
                tracing::warn!(peer = %peer.addr(), key, error = %e, "get request not sent");
            }
        }

        let arrived = tokio::time::timeout(wait, async {
            loop {
                match stored.recv().await {
                    Ok(k) if k == key => return true,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.storage.has(key).await.unwrap_or(false) {
                            return true;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        })
        .await;

        match arrived {
            Ok(true) => self.read(key).await,
            _ => Err(ServerError::NotAvailable(key.to_string())),
        }
    }

    async fn replicate(
        &self,
        key: &str,
        data: Arc<[u8]>,
        peers: Vec<Arc<Peer>>,
    ) -> Result<u64, BroadcastError> {
        if peers.is_empty() {
            return Ok(0);
        }
        let _serial = self.replication.lock().await;

        let size = data.len() as u64;
        let frame = self.encode(&ControlMessage::StoreAnnounce {
            key: key.to_string(),
            size,
        })?;

        let mut failed = Vec::new();
        let mut announced = Vec::with_capacity(peers.len());
        let mut acks = Vec::new();
        for peer in peers {
            let addr = peer.addr();
            let ack = self.expect_ack(addr, key);
            match peer.send(&frame).await {
                Ok(()) => {
                    if let Some(ack) = ack {
                        acks.push((addr, ack));
                    }
                    announced.push(peer);
                }
                Err(error) => {
                    self.forget_ack(addr, key);
                    tracing::warn!(peer = %addr, key, error = %error, "announce failed");
                    failed.push(PeerFailure { addr, error });
                }
            }
        }

        self.settle(key, acks).await;

        let mut fanout = JoinSet::new();
        for peer in announced {
            let data = data.clone();
            fanout.spawn(async move { (peer.addr(), peer.send_stream(&data).await) });
        }
        let mut written = 0;
        let mut delivered = 0;
        while let Some(joined) = fanout.join_next().await {
            match joined {
                Ok((_, Ok(n))) => {
                    written += n;
                    delivered += 1;
                }
                Ok((addr, Err(error))) => {
                    tracing::warn!(peer = %addr, key, error = %error, "stream write failed");
                    failed.push(PeerFailure { addr, error });
                }
                Err(e) => tracing::warn!(key, error = %e, "stream task died"),
            }
        }

        if failed.is_empty() {
            Ok(written)
        } else {
            Err(BroadcastError::Partial {
                failed,
                delivered,
                written,
            })
        }
    }

    fn expect_ack(&self, addr: SocketAddr, key: &str) -> Option<oneshot::Receiver<()>> {
        match self.settle {
            Settle::Delay(_) => None,
            Settle::Ack { .. } => {
                let (tx, rx) = oneshot::channel();
                lock(&self.acks).insert((addr, key.to_string()), tx);
                Some(rx)
            }
        }
    }

    fn forget_ack(&self, addr: SocketAddr, key: &str) {
        lock(&self.acks).remove(&(addr, key.to_string()));
    }

    async fn settle(&self, key: &str, acks: Vec<(SocketAddr, oneshot::Receiver<()>)>) {
        match self.settle {
            Settle::Delay(delay) => tokio::time::sleep(delay).await,
            Settle::Ack { timeout } => {
                let deadline = tokio::time::Instant::now() + timeout;
                for (addr, ack) in acks {
                    match tokio::time::timeout_at(deadline, ack).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => {
                            tracing::debug!(peer = %addr, key, "ack waiter dropped")
                        }
                        Err(_) => {
                            self.forget_ack(addr, key);
                            tracing::warn!(peer = %addr, key, "no ack in time, streaming anyway");
                        }
                    }
                }
            }
        }
    }

    fn encode(&self, msg: &ControlMessage) -> Result<Vec<u8>, BroadcastError> {
        let payload = self.codec.encode(msg)?;
        Ok(wire::encode_message(&payload)?)
    }

    async fn run(self: Arc<Self>, mut rpc_rx: mpsc::Receiver<Rpc>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = transport::closed(&mut shutdown) => break,
                rpc = rpc_rx.recv() => {
                    let Some(rpc) = rpc else { break };
                    let from = rpc.from;
                    if let Err(e) = self.handle_rpc(rpc).await {
                        tracing::warn!(peer = %from, error = %e, "rpc handling failed");
                    }
                }
            }
        }
        self.transport.close();
        tracing::info!(addr = %self.transport.addr(), "file server stopped");
    }

    async fn handle_rpc(self: &Arc<Self>, rpc: Rpc) -> Result<(), ServerError> {
        match rpc.body {
            RpcBody::Message(payload) => {
                let msg = self
                    .codec
                    .decode(&payload)
                    .map_err(|source| ServerError::UnrecognizedMessage {
                        from: rpc.from,
                        source,
                    })?;
                self.handle_message(rpc.from, msg).await
            }
            RpcBody::Stream => self.handle_stream(rpc.from),
        }
    }

    async fn handle_message(
        self: &Arc<Self>,
        from: SocketAddr,
        msg: ControlMessage,
    ) -> Result<(), ServerError> {
        tracing::debug!(peer = %from, ?msg, "control message");
        match msg {
            ControlMessage::StoreAnnounce { key, size } => {
                let announce = Announce {
                    key: key.clone(),
                    size,
                };
                if let Err(e) = self.registry.expect_stream(&from, announce) {
                    self.disconnect(from);
                    return Err(e.into());
                }
                let ack = self.encode(&ControlMessage::StoreAck { key })?;
                let peer = self
                    .registry
                    .get(&from)
                    .ok_or(ServerError::UnknownPeer(from))?;
                tokio::spawn(async move {
                    if let Err(e) = peer.send(&ack).await {
                        tracing::warn!(peer = %peer.addr(), error = %e, "ack not sent");
                    }
                });
                Ok(())
            }
            ControlMessage::GetRequest { key } => {
                if !self.storage.has(&key).await? {
                    tracing::debug!(peer = %from, key, "get request for unknown key dropped");
                    return Ok(());
                }
                let peer = self
                    .registry
                    .get(&from)
                    .ok_or(ServerError::UnknownPeer(from))?;
                let server = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = server.serve_get(&key, peer).await {
                        tracing::warn!(peer = %from, key, error = %e, "get request not served");
                    }
                });
                Ok(())
            }
            ControlMessage::StoreAck { key } => {
                match lock(&self.acks).remove(&(from, key)) {
                    Some(tx) => {
                        let _ = tx.send(());
                    }
                    None => tracing::debug!(peer = %from, "unsolicited ack"),
                }
                Ok(())
            }
        }
    }

    async fn serve_get(&self, key: &str, peer: Arc<Peer>) -> Result<u64, ServerError> {
        let data = self.storage.read(key).await?;
        Ok(self.replicate(key, data.into(), vec![peer]).await?)
    }

    fn handle_stream(self: &Arc<Self>, from: SocketAddr) -> Result<(), ServerError> {
        let peer = self
            .registry
            .get(&from)
            .ok_or(ServerError::UnknownPeer(from))?;
        let Some(announce) = self.registry.take_announce(&from) else {
            // Body length unknown: the rest of this connection cannot be framed.
            let _ = peer.abort_stream();
            return Err(ServerError::UnexpectedStream(from));
        };

        let server = self.clone();
        tokio::spawn(async move {
            if let Err(e) = server.drain(&peer, &announce).await {
                tracing::warn!(peer = %from, key = %announce.key, error = %e, "stream drain failed");
            }
        });
        Ok(())
    }

    /// Copy exactly `announce.size` bytes from the peer into storage, then release its read loop.
    async fn drain(&self, peer: &Peer, announce: &Announce) -> Result<u64, ServerError> {
        let written = {
            let mut reader = peer.reader().await;
            let mut body = (&mut *reader).take(announce.size);
            self.storage.write(&announce.key, &mut body).await
        };

        match written {
            Ok(n) if n == announce.size => {
                peer.release_stream()?;
                tracing::info!(peer = %peer.addr(), key = %announce.key, size = n, "replica stored");
                let _ = self.stored.send(announce.key.clone());
                Ok(n)
            }
            Ok(n) => {
                let _ = self.storage.delete(&announce.key).await;
                let _ = peer.abort_stream();
                Err(ServerError::ShortStream {
                    from: peer.addr(),
                    key: announce.key.clone(),
                    expected: announce.size,
                    got: n,
                })
            }
            Err(e) => {
                let _ = peer.abort_stream();
                Err(e.into())
            }
        }
    }

    fn disconnect(&self, addr: SocketAddr) {
        if let Some(peer) = self.registry.get(&addr) {
            tokio::spawn(async move {
                let _ = peer.close().await;
            });
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct PeerFailure {
    pub addr: SocketAddr,
    pub error: PeerError,
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("encode: {0}")]
    Codec(#[from] CodecError),
    #[error("frame: {0}")]
    Frame(#[from] FrameEncodeError),
    #[error("{} peer(s) failed, {delivered} delivered", .failed.len())]
    Partial {
        failed: Vec<PeerFailure>,
        delivered: usize,
        written: u64,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("broadcast: {0}")]
    Broadcast(#[from] BroadcastError),
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("peer: {0}")]
    Peer(#[from] PeerError),
    #[error("unrecognized message from {from}: {source}")]
    UnrecognizedMessage {
        from: SocketAddr,
        #[source]
        source: CodecError,
    },
    #[error("stream from {0} without a preceding announce")]
    UnexpectedStream(SocketAddr),
    #[error("stream from {from} for {key} ended after {got} of {expected} bytes")]
    ShortStream {
        from: SocketAddr,
        key: String,
        expected: u64,
        got: u64,
    },
    #[error("peer {0} not registered")]
    UnknownPeer(SocketAddr),
    #[error("{0} not available locally or from peers")]
    NotAvailable(String),
    #[error("already started")]
    AlreadyStarted,
    #[error("reading input: {0}")]
    Input(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::NopHandshake;
    use crate::wire::Frame;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn read_eventually(server: &FileServer, key: &str, want: &[u8]) {
        for _ in 0..500 {
            if let Ok(data) = server.read(key).await {
                if data == want {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{key} never arrived");
    }

    async fn node(settle: Settle) -> (Arc<FileServer>, SocketAddr, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::new("127.0.0.1:0", dir.path().join("root"))
            .with_handshake(Arc::new(NopHandshake))
            .with_settle(settle);
        let server = FileServer::new(config);
        let addr = server.start().await.unwrap();
        (server, addr, dir)
    }

    /// Raw socket registered as a peer of `server`.
    async fn raw_peer(server: &FileServer, addr: SocketAddr) -> TcpStream {
        let before = server.peer_count();
        let raw = TcpStream::connect(addr).await.unwrap();
        eventually(|| server.peer_count() == before + 1).await;
        raw
    }

    fn message(msg: &ControlMessage) -> Vec<u8> {
        wire::encode_message(&BincodeCodec.encode(msg).unwrap()).unwrap()
    }

    fn announce(key: &str, size: u64) -> Vec<u8> {
        message(&ControlMessage::StoreAnnounce {
            key: key.into(),
            size,
        })
    }

    async fn next_message(raw: &mut TcpStream) -> ControlMessage {
        match wire::read_frame(raw).await.unwrap() {
            Frame::Message(payload) => BincodeCodec.decode(&payload).unwrap(),
            Frame::Stream => panic!("expected a message frame"),
        }
    }

    fn root_is_empty(server: &FileServer) -> bool {
        std::fs::read_dir(server.storage().root())
            .map(|d| d.count() == 0)
            .unwrap_or(true)
    }

    #[tokio::test]
    async fn exact_count_drain_then_next_frame() {
        let (server, addr, _dir) = node(Settle::default()).await;
        let mut raw = raw_peer(&server, addr).await;

        let mut bytes = announce("k1", 5);
        bytes.extend_from_slice(&wire::encode_stream_header());
        bytes.extend_from_slice(b"hello");
        bytes.extend_from_slice(&announce("k2", 3));
        bytes.extend_from_slice(&wire::encode_stream_header());
        bytes.extend_from_slice(b"abc");
        raw.write_all(&bytes).await.unwrap();

        read_eventually(&server, "k1", b"hello").await;
        read_eventually(&server, "k2", b"abc").await;
        let mut acked = vec![
            next_message(&mut raw).await.key().to_string(),
            next_message(&mut raw).await.key().to_string(),
        ];
        acked.sort();
        assert_eq!(acked, ["k1", "k2"]);
        assert_eq!(server.peer_count(), 1);
    }

    #[tokio::test]
    async fn stream_without_announce_is_rejected() {
        let (server, addr, _dir) = node(Settle::default()).await;
        let mut raw = raw_peer(&server, addr).await;

        raw.write_all(&wire::encode_stream_header()).await.unwrap();
        raw.write_all(b"junk").await.unwrap();

        let mut rest = Vec::new();
        let _ = raw.read_to_end(&mut rest).await;
        eventually(|| server.peer_count() == 0).await;
        assert!(root_is_empty(&server));
    }

    #[tokio::test]
    async fn unrecognized_message_keeps_connection() {
        let (server, addr, _dir) = node(Settle::default()).await;
        let mut raw = raw_peer(&server, addr).await;

        raw.write_all(&wire::encode_message(&[7, 0, 0, 0]).unwrap())
            .await
            .unwrap();
        let mut bytes = announce("after", 2);
        bytes.extend_from_slice(&wire::encode_stream_header());
        bytes.extend_from_slice(b"ok");
        raw.write_all(&bytes).await.unwrap();

        read_eventually(&server, "after", b"ok").await;
        assert_eq!(server.peer_count(), 1);
    }

    #[tokio::test]
    async fn second_announce_before_stream_drops_peer() {
        let (server, addr, _dir) = node(Settle::default()).await;
        let mut raw = raw_peer(&server, addr).await;

        let mut bytes = announce("a", 1);
        bytes.extend_from_slice(&announce("b", 1));
        raw.write_all(&bytes).await.unwrap();

        // Server shuts its side; we hang up in turn, which ends its read loop.
        let mut rest = Vec::new();
        let _ = raw.read_to_end(&mut rest).await;
        drop(raw);
        eventually(|| server.peer_count() == 0).await;
    }

    #[tokio::test]
    async fn short_stream_is_not_success() {
        let (server, addr, _dir) = node(Settle::default()).await;
        let mut raw = raw_peer(&server, addr).await;

        let mut bytes = announce("big", 10);
        bytes.extend_from_slice(&wire::encode_stream_header());
        bytes.extend_from_slice(b"abc");
        raw.write_all(&bytes).await.unwrap();
        raw.shutdown().await.unwrap();

        eventually(|| server.peer_count() == 0).await;
        for _ in 0..100 {
            if !server.has("big").await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!server.has("big").await.unwrap());
    }

    #[tokio::test]
    async fn get_request_replies_with_announce_and_stream() {
        let (server, addr, _dir) = node(Settle::Delay(DEFAULT_SETTLE_DELAY)).await;
        server.store("doc", &b"contents"[..]).await.unwrap();
        let mut raw = raw_peer(&server, addr).await;

        raw.write_all(&message(&ControlMessage::GetRequest { key: "doc".into() }))
            .await
            .unwrap();
        assert_eq!(
            next_message(&mut raw).await,
            ControlMessage::StoreAnnounce {
                key: "doc".into(),
                size: 8
            }
        );
        assert_eq!(wire::read_frame(&mut raw).await.unwrap(), Frame::Stream);
        let mut body = [0u8; 8];
        raw.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"contents");
    }

    #[tokio::test]
    async fn get_request_for_missing_key_is_dropped() {
        let (server, addr, _dir) = node(Settle::default()).await;
        let mut raw = raw_peer(&server, addr).await;

        raw.write_all(&message(&ControlMessage::GetRequest { key: "nope".into() }))
            .await
            .unwrap();
        let mut buf = [0u8; 1];
        assert!(
            tokio::time::timeout(Duration::from_millis(200), raw.read(&mut buf))
                .await
                .is_err()
        );
        assert_eq!(server.peer_count(), 1);
    }

    #[tokio::test]
    async fn failed_peer_does_not_block_the_others() {
        let (server, addr, _dir) = node(Settle::Delay(DEFAULT_SETTLE_DELAY)).await;
        let mut good_a = raw_peer(&server, addr).await;
        let mut good_b = raw_peer(&server, addr).await;
        let broken = raw_peer(&server, addr).await;

        let broken_addr = broken.local_addr().unwrap();
        server
            .registry
            .get(&broken_addr)
            .unwrap()
            .close()
            .await
            .unwrap();

        let err = server.store("k", &b"payload"[..]).await.unwrap_err();
        match err {
            ServerError::Broadcast(BroadcastError::Partial {
                failed,
                delivered,
                written,
            }) => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].addr, broken_addr);
                assert_eq!(delivered, 2);
                assert_eq!(written, 14);
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(server.read("k").await.unwrap(), b"payload");

        for raw in [&mut good_a, &mut good_b] {
            assert_eq!(
                next_message(raw).await,
                ControlMessage::StoreAnnounce {
                    key: "k".into(),
                    size: 7
                }
            );
            assert_eq!(wire::read_frame(raw).await.unwrap(), Frame::Stream);
            let mut body = [0u8; 7];
            raw.read_exact(&mut body).await.unwrap();
            assert_eq!(&body, b"payload");
        }
        drop(broken);
    }

    #[tokio::test]
    async fn ack_timeout_falls_back_to_streaming() {
        let (server, addr, _dir) = node(Settle::Ack {
            timeout: Duration::from_millis(50),
        })
        .await;
        // A raw peer never acks.
        let mut raw = raw_peer(&server, addr).await;

        server.store("k", &b"xy"[..]).await.unwrap();
        assert!(matches!(
            next_message(&mut raw).await,
            ControlMessage::StoreAnnounce { size: 2, .. }
        ));
        assert_eq!(wire::read_frame(&mut raw).await.unwrap(), Frame::Stream);
        assert!(lock(&server.acks).is_empty());
    }

    #[tokio::test]
    async fn start_twice_and_stop() {
        let (server, _addr, _dir) = node(Settle::default()).await;
        assert!(server.start().await.is_err());
        server.stop().await;
        server.stop().await;
    }
}
