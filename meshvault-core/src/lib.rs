//! Meshvault Core
//!
//! Peer-to-peer content store: framed TCP transport, file replication,
//! content-addressed storage and the AES-CTR stream cipher used on the wire.

pub mod config;
pub mod crypto;
pub mod frame;
pub mod messages;
pub mod peer;
pub mod runtime;
pub mod server;
pub mod storage;
pub mod transport;

pub use config::{Command, Config, ConfigError, DemoConfig};
pub use crypto::{copy_decrypt, copy_encrypt, CipherError, EncryptionKey, IV_SIZE};
pub use frame::{encode_message, DecodeError, Frame, FrameDecoder, Rpc};
pub use messages::{GetFile, Message, MessageError, StoreFile};
pub use peer::{ConnMode, StreamGuard, TcpPeer};
pub use runtime::{run_demo, run_node};
pub use server::{FileServer, FileServerOpts, ServerError};
pub use storage::{cas_path_transform, identity_path_transform, PathKey, Store, StorageError};
pub use transport::{
    nop_handshake, HandshakeFn, PeerHandler, TcpTransport, TcpTransportOpts, TransportError,
};
