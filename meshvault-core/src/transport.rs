//! TCP transport: listener, dialer and per-connection frame loops
//!
//! Every accepted or dialed connection goes through the same path:
//! handshake, registration with the [`PeerHandler`], then a frame loop that
//! publishes MESSAGE frames on a single channel and hands STREAM frames to
//! whoever claims them on the [`TcpPeer`].

use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::frame::{DecodeError, Frame, FrameDecoder, Rpc};
use crate::peer::{ConnMode, TcpPeer};

/// Back-off after a failed accept, so a broken listener does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        source: std::io::Error,
    },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Timed out waiting for stream from {0}")]
    StreamTimeout(String),

    #[error("Connection to {0} closed before stream")]
    StreamClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs on every new connection before it is registered
pub type HandshakeFn = Arc<
    dyn for<'a> Fn(&'a mut TcpStream) -> BoxFuture<'a, Result<(), TransportError>> + Send + Sync,
>;

fn nop(_stream: &mut TcpStream) -> BoxFuture<'_, Result<(), TransportError>> {
    Box::pin(async { Ok(()) })
}

/// Handshake that accepts every connection
pub fn nop_handshake() -> HandshakeFn {
    Arc::new(nop)
}

/// Receives connection lifecycle events from the transport
pub trait PeerHandler: Send + Sync + 'static {
    /// Called once per new connection, before any frame is read from it
    fn on_peer(&self, peer: Arc<TcpPeer>) -> Result<(), TransportError>;

    /// Called when the connection's frame loop has ended
    fn on_disconnect(&self, peer: &TcpPeer);
}

#[derive(Clone)]
pub struct TcpTransportOpts {
    pub listen_addr: String,
    pub handshake: HandshakeFn,
    pub decoder: FrameDecoder,
}

impl TcpTransportOpts {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handshake: nop_handshake(),
            decoder: FrameDecoder::default(),
        }
    }
}

#[derive(Default)]
struct ListenState {
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

struct Inner {
    opts: TcpTransportOpts,
    handler: Arc<dyn PeerHandler>,
    rpc_tx: mpsc::UnboundedSender<Rpc>,
    rpc_rx: Mutex<Option<mpsc::UnboundedReceiver<Rpc>>>,
    state: Mutex<ListenState>,
}

/// TCP transport shared by the listener task, frame loops and the server
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts, handler: Arc<dyn PeerHandler>) -> Self {
        let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                opts,
                handler,
                rpc_tx,
                rpc_rx: Mutex::new(Some(rpc_rx)),
                state: Mutex::new(ListenState::default()),
            }),
        }
    }

    pub fn listen_addr(&self) -> &str {
        &self.inner.opts.listen_addr
    }

    /// Address the listener is bound to, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state().local_addr
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ListenState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the receiving end of the control message channel
    ///
    /// There is a single consumer; later calls return `None`.
    pub fn consume(&self) -> Option<mpsc::UnboundedReceiver<Rpc>> {
        self.inner
            .rpc_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Bind the listener and start accepting connections in the background
    pub async fn listen_and_accept(&self) -> Result<SocketAddr, TransportError> {
        let addr = &self.inner.opts.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let transport = self.clone();
        let accept_task = tokio::spawn(async move { transport.accept_loop(listener).await });

        {
            let mut state = self.state();
            if let Some(previous) = state.accept_task.replace(accept_task) {
                previous.abort();
            }
            state.local_addr = Some(local_addr);
        }

        info!("TCP transport listening on {}", local_addr);
        Ok(local_addr)
    }

    async fn accept_loop(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    debug!("Incoming connection from {}", remote);
                    let transport = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = transport.handle_conn(stream, false).await {
                            warn!("Dropping connection from {}: {}", remote, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting TCP connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Open an outbound connection and register it like an accepted one
    pub async fn dial(&self, addr: &str) -> Result<Arc<TcpPeer>, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Dial {
                addr: addr.to_string(),
                source,
            })?;

        let peer = self.setup_conn(stream, true).await?;
        let transport = self.clone();
        let loop_peer = peer.clone();
        tokio::spawn(async move { transport.read_loop(loop_peer).await });

        Ok(peer)
    }

    async fn handle_conn(&self, stream: TcpStream, outbound: bool) -> Result<(), TransportError> {
        let peer = self.setup_conn(stream, outbound).await?;
        self.read_loop(peer).await;
        Ok(())
    }

    /// Handshake and register; on failure the connection is closed
    async fn setup_conn(
        &self,
        mut stream: TcpStream,
        outbound: bool,
    ) -> Result<Arc<TcpPeer>, TransportError> {
        stream.set_nodelay(true)?;

        if let Err(e) = (self.inner.opts.handshake)(&mut stream).await {
            warn!("TCP handshake failed: {}", e);
            return Err(e);
        }

        let peer = Arc::new(TcpPeer::new(stream, outbound)?);
        if let Err(e) = self.inner.handler.on_peer(peer.clone()) {
            peer.close().await;
            return Err(e);
        }

        info!(
            peer = %peer.remote_addr(),
            outbound,
            "Connected to peer"
        );
        Ok(peer)
    }

    /// Decode frames until the connection ends
    async fn read_loop(&self, peer: Arc<TcpPeer>) {
        let addr = peer.address();
        let decoder = self.inner.opts.decoder;

        while peer.mode() != ConnMode::Closed {
            match peer.read_frame(&decoder).await {
                Ok(Frame::Message(payload)) => {
                    let rpc = Rpc {
                        from: addr.clone(),
                        payload,
                    };
                    if self.inner.rpc_tx.send(rpc).is_err() {
                        debug!(peer = %addr, "Message consumer gone, stopping read loop");
                        break;
                    }
                }
                Ok(Frame::Stream) => {
                    debug!(peer = %addr, "Incoming stream, waiting for consumer");
                    if !peer.hand_off_stream().await {
                        debug!(peer = %addr, "Connection closed during stream");
                        break;
                    }
                    debug!(peer = %addr, "Stream closed, resuming read loop");
                }
                Err(DecodeError::Closed) => {
                    debug!(peer = %addr, "Connection closed by remote");
                    break;
                }
                Err(e) if e.is_fatal() => {
                    warn!(peer = %addr, "Connection read failed: {}", e);
                    break;
                }
                Err(e) => {
                    warn!(peer = %addr, "Dropping malformed frame: {}", e);
                }
            }
        }

        peer.close().await;
        self.inner.handler.on_disconnect(&peer);
        info!(peer = %addr, "Peer disconnected");
    }

    /// Stop accepting connections and release the listener
    ///
    /// Established connections keep running until their frame loops end.
    pub fn close(&self) {
        let mut state = self.state();
        if let Some(task) = state.accept_task.take() {
            task.abort();
            info!("TCP transport on {} closed", self.inner.opts.listen_addr);
        }
        state.local_addr = None;
    }
}
