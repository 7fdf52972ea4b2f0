//! Shrine: replicate files across a swarm of TCP peers and keep them in a
//! content-addressed local store.
//! The file server owns policy; transport, peer and wire only move bytes.

pub mod handshake;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;
pub mod transport;
pub mod wire;

pub use handshake::{Handshake, HandshakeError, NopHandshake, VersionHandshake};
pub use peer::{Peer, PeerError};
pub use protocol::{BincodeCodec, CodecError, ControlMessage, JsonCodec, MessageCodec, PROTOCOL_VERSION};
pub use registry::{Announce, PeerRegistry, RegistryError};
pub use server::{BroadcastError, FileServer, PeerFailure, ServerConfig, ServerError, Settle};
pub use storage::{sha1_transform, sha256_transform, PathTransform, Storage, StorageError};
pub use transport::{PeerHandler, Rpc, RpcBody, Transport, TransportConfig, TransportError};
pub use wire::{encode_message, encode_stream_header, read_frame, Frame, FrameDecodeError, FrameEncodeError};
