//! File server: peer registry, replication and retrieval
//!
//! `store` persists a blob locally, then pushes it to every connected peer as
//! a StoreFile message followed by one encrypted stream. `get` serves from
//! local disk when possible, otherwise asks every peer with a GetFile
//! message and persists whichever copies arrive.
//!
//! Incoming messages are handled one at a time by a single dispatch loop,
//! so a handler's raw-stream read always finishes before the next message
//! is looked at.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::ConfigError;
use crate::crypto::{
    copy_encrypt, random_iv, CipherError, EncryptionKey, Keystream, CHUNK_SIZE, IV_SIZE,
};
use crate::frame::{
    encode_message, exact_reader, FrameDecoder, Rpc, DEFAULT_MAX_MESSAGE_SIZE, STREAM_TAG,
};
use crate::messages::{GetFile, Message, MessageError, StoreFile};
use crate::peer::TcpPeer;
use crate::storage::{cas_path_transform, PathTransformFn, Store, StorageError};
use crate::transport::{
    nop_handshake, HandshakeFn, PeerHandler, TcpTransport, TcpTransportOpts, TransportError,
};

/// Default upper bound on a single blob
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Default bound on waiting for a stream and on each raw read
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Message from unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("File of {size} bytes exceeds maximum of {max}")]
    FileTooLarge { size: u64, max: u64 },

    #[error("File server already started")]
    AlreadyStarted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct FileServerOpts {
    pub listen_addr: String,
    pub storage_root: PathBuf,
    pub path_transform: PathTransformFn,
    /// Key shared by the whole mesh
    pub enc_key: EncryptionKey,
    pub bootstrap_nodes: Vec<String>,
    pub handshake: HandshakeFn,
    pub max_message_size: usize,
    pub max_file_size: u64,
    pub stream_timeout: Duration,
}

impl FileServerOpts {
    pub fn new(
        listen_addr: impl Into<String>,
        storage_root: impl Into<PathBuf>,
        enc_key: EncryptionKey,
    ) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            storage_root: storage_root.into(),
            path_transform: cas_path_transform,
            enc_key,
            bootstrap_nodes: Vec::new(),
            handshake: nop_handshake(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
        }
    }

    pub fn with_bootstrap_nodes(mut self, nodes: Vec<String>) -> Self {
        self.bootstrap_nodes = nodes;
        self
    }
}

/// Live connections keyed by remote address
///
/// Lock discipline: every method takes the lock for a short, I/O-free
/// critical section. Callers that need to talk to peers take a
/// [`snapshot`](Self::snapshot) and do their I/O after the lock is gone.
pub(crate) struct PeerRegistry {
    peers: Mutex<BTreeMap<String, Arc<TcpPeer>>>,
}

impl PeerRegistry {
    fn new() -> Self {
        Self {
            peers: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Arc<TcpPeer>>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert under lock
    fn register(&self, peer: Arc<TcpPeer>) {
        let addr = peer.address();
        if self.lock().insert(addr.clone(), peer).is_some() {
            warn!(peer = %addr, "Replaced existing peer with the same address");
        }
    }

    /// Remove under lock, only if the registered peer is this connection
    fn remove(&self, peer: &TcpPeer) -> bool {
        let mut peers = self.lock();
        let addr = peer.address();
        match peers.get(&addr) {
            Some(registered) if std::ptr::eq(Arc::as_ptr(registered), peer) => {
                peers.remove(&addr);
                true
            }
            _ => false,
        }
    }

    /// Lookup under lock; the returned handle outlives the lock
    fn get(&self, addr: &str) -> Option<Arc<TcpPeer>> {
        self.lock().get(addr).cloned()
    }

    /// Copy of all peers in address order
    fn snapshot(&self) -> Vec<Arc<TcpPeer>> {
        self.lock().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

impl PeerHandler for PeerRegistry {
    fn on_peer(&self, peer: Arc<TcpPeer>) -> Result<(), TransportError> {
        debug!(peer = %peer.remote_addr(), outbound = peer.is_outbound(), "Registering peer");
        self.register(peer);
        Ok(())
    }

    fn on_disconnect(&self, peer: &TcpPeer) {
        if self.remove(peer) {
            debug!(peer = %peer.remote_addr(), "Unregistered peer");
        }
    }
}

pub struct FileServer {
    opts: FileServerOpts,
    store: Store,
    transport: TcpTransport,
    peers: Arc<PeerRegistry>,
    shutdown: watch::Sender<bool>,
    local_addr: watch::Sender<Option<SocketAddr>>,
}

impl FileServer {
    pub fn new(opts: FileServerOpts) -> Self {
        let peers = Arc::new(PeerRegistry::new());
        let transport = TcpTransport::new(
            TcpTransportOpts {
                listen_addr: opts.listen_addr.clone(),
                handshake: opts.handshake.clone(),
                decoder: FrameDecoder::new(opts.max_message_size),
            },
            peers.clone(),
        );
        let store = Store::with_transform(&opts.storage_root, opts.path_transform);
        let (shutdown, _) = watch::channel(false);
        let (local_addr, _) = watch::channel(None);

        Self {
            opts,
            store,
            transport,
            peers,
            shutdown,
            local_addr,
        }
    }

    pub fn listen_addr(&self) -> &str {
        &self.opts.listen_addr
    }

    /// Local blob store
    pub fn storage(&self) -> &Store {
        &self.store
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Wait until the listener is bound and return its address
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut rx = self.local_addr.subscribe();
        let addr = rx.wait_for(Option::is_some).await.ok()?;
        *addr
    }

    /// Connect to another node outside of the bootstrap list
    pub async fn connect(&self, addr: &str) -> Result<(), ServerError> {
        self.transport.dial(addr).await?;
        Ok(())
    }

    /// Bind, dial the bootstrap nodes, then process messages until [`stop`](Self::stop)
    ///
    /// A server can only be started once.
    pub async fn start(&self) -> Result<(), ServerError> {
        let rpcs = self.transport.consume().ok_or(ServerError::AlreadyStarted)?;

        let addr = self.transport.listen_and_accept().await?;
        self.local_addr.send_replace(Some(addr));
        info!("[{}] File server started", addr);

        self.bootstrap_network();
        self.run(rpcs).await
    }

    /// Signal the dispatch loop to exit; safe to call more than once
    pub fn stop(&self) {
        if !self.shutdown.send_replace(true) {
            info!("[{}] Stopping file server", self.opts.listen_addr);
        }
    }

    fn bootstrap_network(&self) {
        for addr in &self.opts.bootstrap_nodes {
            if addr.is_empty() {
                continue;
            }

            let transport = self.transport.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                debug!("Dialing bootstrap node {}", addr);
                if let Err(e) = transport.dial(&addr).await {
                    error!("Failed to dial bootstrap node {}: {}", addr, e);
                }
            });
        }
    }

    async fn run(&self, mut rpcs: mpsc::UnboundedReceiver<Rpc>) -> Result<(), ServerError> {
        let stopped = wait_for_stop(self.shutdown.subscribe());
        tokio::pin!(stopped);

        loop {
            tokio::select! {
                rpc = rpcs.recv() => {
                    let Some(rpc) = rpc else { break };
                    if let Err(e) = self.handle_rpc(rpc).await {
                        warn!("[{}] Failed to handle message: {}", self.opts.listen_addr, e);
                    }
                }
                _ = &mut stopped => break,
            }
        }

        self.transport.close();
        info!("[{}] File server stopped", self.opts.listen_addr);
        Ok(())
    }

    async fn handle_rpc(&self, rpc: Rpc) -> Result<(), ServerError> {
        let msg = match Message::decode(&rpc.payload) {
            Ok(msg) => msg,
            Err(e) => {
                // A stream may follow the message we could not read
                if let Some(peer) = self.peers.get(&rpc.from) {
                    peer.close().await;
                }
                return Err(e.into());
            }
        };
        debug!(peer = %rpc.from, key = msg.key(), "Dispatching message");

        match msg {
            Message::StoreFile(msg) => self.handle_store_file(&rpc.from, msg).await,
            Message::GetFile(msg) => self.handle_get_file(&rpc.from, msg).await,
        }
    }

    /// Persist the stream a peer pushes after its StoreFile message
    async fn handle_store_file(&self, from: &str, msg: StoreFile) -> Result<(), ServerError> {
        let peer = self
            .peers
            .get(from)
            .ok_or_else(|| ServerError::UnknownPeer(from.to_string()))?;

        let max = self.opts.max_file_size + IV_SIZE as u64;
        if msg.size > max {
            // The pushed bytes would be misread as frames
            peer.close().await;
            return Err(ServerError::FileTooLarge {
                size: msg.size,
                max,
            });
        }

        let mut stream = match peer.claim_stream(self.opts.stream_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                // The pushed bytes may still arrive and would stall the connection
                peer.close().await;
                return Err(e.into());
            }
        };
        let result = self
            .store
            .write_decrypt(&self.opts.enc_key, &msg.key, &mut exact_reader(&mut stream, msg.size))
            .await;

        match result {
            Ok(n) => {
                stream.close_stream();
                info!(
                    "[{}] Stored {} ({} bytes) replicated from {}",
                    self.opts.listen_addr, msg.key, n, from
                );
                Ok(())
            }
            Err(e) => {
                stream.abandon().await;
                Err(e.into())
            }
        }
    }

    /// Answer a GetFile with STREAM, length prefix, then the encrypted blob
    ///
    /// A missing key is answered with a zero length so the requester does not
    /// have to wait out its timeout.
    async fn handle_get_file(&self, from: &str, msg: GetFile) -> Result<(), ServerError> {
        let peer = self
            .peers
            .get(from)
            .ok_or_else(|| ServerError::UnknownPeer(from.to_string()))?;

        if !self.store.has(&msg.key).await {
            let mut writer = peer.writer().await;
            writer.write_all(&[STREAM_TAG]).await?;
            writer.write_all(&0u64.to_le_bytes()).await?;
            writer.flush().await?;
            return Err(ServerError::NotFound(msg.key));
        }

        let (size, file) = self.store.read(&msg.key).await?;
        let mut writer = peer.writer().await;
        writer.write_all(&[STREAM_TAG]).await?;
        writer.write_all(&(size + IV_SIZE as u64).to_le_bytes()).await?;
        let n = copy_encrypt(&self.opts.enc_key, &mut exact_reader(file, size), &mut *writer).await?;

        info!(
            "[{}] Served {} ({} bytes) to {}",
            self.opts.listen_addr, msg.key, n, from
        );
        Ok(())
    }

    /// Store locally, then replicate to every connected peer
    ///
    /// Returns the number of bytes written locally. Failing to reach an
    /// individual peer is logged and does not undo the local write.
    pub async fn store<R>(&self, key: &str, reader: &mut R) -> Result<u64, ServerError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let max = self.opts.max_file_size;
        let mut buf = Vec::new();
        (&mut *reader)
            .take(max.saturating_add(1))
            .read_to_end(&mut buf)
            .await?;
        if buf.len() as u64 > max {
            return Err(ServerError::FileTooLarge {
                size: buf.len() as u64,
                max,
            });
        }

        let size = buf.len() as u64;
        let msg = Message::store_file(key, size + IV_SIZE as u64)
            .encode(self.opts.max_message_size)?;

        let written = self.store.write(key, &mut &buf[..]).await?;

        let peers = self.peers.snapshot();
        if peers.is_empty() {
            return Ok(written);
        }

        match self.broadcast_stream(&peers, &encode_message(&msg), &buf).await {
            Ok(reached) => info!(
                "[{}] Replicated {} ({} bytes) to {}/{} peers",
                self.opts.listen_addr,
                key,
                written,
                reached,
                peers.len()
            ),
            Err(e) => error!("[{}] Failed to replicate {}: {}", self.opts.listen_addr, key, e),
        }

        Ok(written)
    }

    /// Send `frame` + STREAM to every peer, then one encrypted copy of `data`
    ///
    /// Each peer's write half is held for the whole transfer. Peers are
    /// locked in registry order so concurrent broadcasts cannot deadlock.
    async fn broadcast_stream(
        &self,
        peers: &[Arc<TcpPeer>],
        frame: &[u8],
        data: &[u8],
    ) -> Result<usize, ServerError> {
        let mut writers: Vec<(String, MutexGuard<'_, OwnedWriteHalf>)> = Vec::new();
        for peer in peers {
            let mut writer = peer.writer().await;
            let announced = match writer.write_all(frame).await {
                Ok(()) => writer.write_all(&[STREAM_TAG]).await,
                Err(e) => Err(e),
            };
            match announced {
                Ok(()) => writers.push((peer.address(), writer)),
                Err(e) => warn!(peer = %peer.remote_addr(), "Failed to announce stream: {}", e),
            }
        }

        let iv = random_iv();
        let mut keystream = Keystream::new(&self.opts.enc_key, &iv)?;
        write_to_all(&mut writers, &iv).await;

        let mut chunk = Vec::with_capacity(CHUNK_SIZE);
        for plain in data.chunks(CHUNK_SIZE) {
            chunk.clear();
            chunk.extend_from_slice(plain);
            keystream.apply(&mut chunk);
            write_to_all(&mut writers, &chunk).await;
        }

        for (addr, writer) in writers.iter_mut() {
            if let Err(e) = writer.flush().await {
                warn!(peer = %addr, "Failed to flush stream: {}", e);
            }
        }

        Ok(writers.len())
    }

    /// Serve `key` from local disk, fetching it from the network first if needed
    pub async fn get(&self, key: &str) -> Result<(u64, File), ServerError> {
        if self.store.has(key).await {
            info!("[{}] Serving {} from local disk", self.opts.listen_addr, key);
            return Ok(self.store.read(key).await?);
        }

        info!(
            "[{}] Don't have {} locally, fetching from network",
            self.opts.listen_addr, key
        );

        let frame = encode_message(&Message::get_file(key).encode(self.opts.max_message_size)?);
        let mut asked = Vec::new();
        for peer in self.peers.snapshot() {
            match peer.send(&frame).await {
                Ok(()) => asked.push(peer),
                Err(e) => warn!(peer = %peer.remote_addr(), "Failed to send fetch request: {}", e),
            }
        }

        // Every asked peer answers, so every answer has to be consumed.
        // Copies of the same key replace each other atomically on disk.
        let results = join_all(asked.iter().map(|peer| self.receive_file(peer, key))).await;
        let mut fetched = false;
        for (peer, result) in asked.iter().zip(results) {
            match result {
                Ok(true) => fetched = true,
                Ok(false) => debug!(peer = %peer.remote_addr(), "Peer does not have {}", key),
                Err(e) => warn!(peer = %peer.remote_addr(), "Fetch of {} failed: {}", key, e),
            }
        }

        if !fetched || !self.store.has(key).await {
            return Err(ServerError::NotFound(key.to_string()));
        }
        Ok(self.store.read(key).await?)
    }

    /// Read one peer's answer to a GetFile; `Ok(false)` if it had nothing
    async fn receive_file(&self, peer: &TcpPeer, key: &str) -> Result<bool, ServerError> {
        let mut stream = match peer.claim_stream(self.opts.stream_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                // A late answer would be taken for the reply to a later request
                peer.close().await;
                return Err(e.into());
            }
        };

        let len = match stream.read_u64_le().await {
            Ok(len) => len,
            Err(e) => {
                stream.abandon().await;
                return Err(e.into());
            }
        };
        if len == 0 {
            stream.close_stream();
            return Ok(false);
        }

        let max = self.opts.max_file_size + IV_SIZE as u64;
        if len > max {
            stream.abandon().await;
            return Err(ServerError::FileTooLarge { size: len, max });
        }

        let result = self
            .store
            .write_decrypt(&self.opts.enc_key, key, &mut exact_reader(&mut stream, len))
            .await;

        match result {
            Ok(n) => {
                stream.close_stream();
                info!(
                    "[{}] Received {} ({} bytes) over the network from {}",
                    self.opts.listen_addr,
                    key,
                    n,
                    peer.remote_addr()
                );
                Ok(true)
            }
            Err(e) => {
                stream.abandon().await;
                Err(e.into())
            }
        }
    }

    pub async fn has_local(&self, key: &str) -> bool {
        self.store.has(key).await
    }

    /// Remove `key` (and its whole shard) from local disk only
    pub async fn delete_local(&self, key: &str) -> Result<(), ServerError> {
        Ok(self.store.delete(key).await?)
    }
}

async fn wait_for_stop(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Write `bytes` to every writer concurrently, dropping the ones that fail
async fn write_to_all(writers: &mut Vec<(String, MutexGuard<'_, OwnedWriteHalf>)>, bytes: &[u8]) {
    let results = join_all(
        writers
            .iter_mut()
            .map(|(_, writer)| async move { writer.write_all(bytes).await }),
    )
    .await;

    let mut index = 0;
    writers.retain(|(addr, _)| {
        let result = &results[index];
        index += 1;
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(peer = %addr, "Dropping peer from broadcast: {}", e);
                false
            }
        }
    });
}
