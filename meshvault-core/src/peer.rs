//! A single TCP connection to a remote node
//!
//! The read half is shared between the transport's frame loop and whoever
//! consumes a raw stream announced by a STREAM frame. Ownership of the read
//! half moves between them through a small per-connection mode machine:
//!
//! ```text
//!  Frame --(frame loop reads STREAM tag)--> Stream
//!  Stream --(consumer claims)-------------> Claimed
//!  Claimed --(consumer closes stream)-----> Frame
//!  any --(connection abandoned)-----------> Closed
//! ```
//!
//! The frame loop never reads while the mode is not `Frame`, and at most one
//! consumer can claim each stream. Releasing happens when the
//! [`StreamGuard`] is closed or dropped, so a missing release cannot stall
//! the frame loop.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::{timeout, Sleep};
use tracing::{debug, trace};

use crate::frame::{DecodeError, Frame, FrameDecoder};
use crate::transport::TransportError;

/// Who currently owns the read half of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnMode {
    /// The frame loop is decoding frames
    Frame,
    /// A STREAM tag was read; waiting for a consumer
    Stream,
    /// A consumer is reading the raw stream
    Claimed,
    /// The connection is being torn down
    Closed,
}

pub struct TcpPeer {
    remote_addr: SocketAddr,
    /// true if we dialed, false if we accepted
    outbound: bool,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    mode: watch::Sender<ConnMode>,
}

impl TcpPeer {
    pub fn new(stream: TcpStream, outbound: bool) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (mode, _) = watch::channel(ConnMode::Frame);

        Ok(Self {
            remote_addr,
            outbound,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            mode,
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Remote address as used for registry keys and RPC senders
    pub fn address(&self) -> String {
        self.remote_addr.to_string()
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn mode(&self) -> ConnMode {
        *self.mode.borrow()
    }

    /// Write `bytes` as one unit
    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Exclusive access to the write half for multi-part transfers
    pub async fn writer(&self) -> MutexGuard<'_, OwnedWriteHalf> {
        self.writer.lock().await
    }

    /// Stop the frame loop and shut down our side of the connection
    pub async fn close(&self) {
        self.mode.send_replace(ConnMode::Closed);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    pub(crate) async fn read_frame(&self, decoder: &FrameDecoder) -> Result<Frame, DecodeError> {
        let mut reader = self.reader.lock().await;
        decoder.decode(&mut *reader).await
    }

    /// Called by the frame loop after reading a STREAM tag
    ///
    /// Waits, without a deadline, until a consumer has claimed and released
    /// the stream, and returns `true` once the frame loop may read the next
    /// tag. A consumer may be queued behind other work, so only closing the
    /// connection ends the wait early; that returns `false`.
    pub(crate) async fn hand_off_stream(&self) -> bool {
        let mut rx = self.mode.subscribe();
        let entered = self.mode.send_if_modified(|mode| {
            if *mode == ConnMode::Frame {
                *mode = ConnMode::Stream;
                true
            } else {
                false
            }
        });
        if !entered {
            return false;
        }
        trace!(peer = %self.remote_addr, "Stream pending");

        rx.wait_for(|m| matches!(m, ConnMode::Frame | ConnMode::Closed))
            .await
            .map(|m| *m == ConnMode::Frame)
            .unwrap_or(false)
    }

    /// Wait for the frame loop to announce a stream and take ownership of it
    ///
    /// `wait` bounds both the wait for the STREAM tag and every subsequent
    /// read on the returned guard. A consumer that gives up waiting leaves a
    /// stream that may still arrive; callers then close the connection.
    pub async fn claim_stream(&self, wait: Duration) -> Result<StreamGuard<'_>, TransportError> {
        let mut rx = self.mode.subscribe();

        let claim = async {
            loop {
                let mode = rx
                    .wait_for(|m| matches!(m, ConnMode::Stream | ConnMode::Closed))
                    .await
                    .map(|m| *m)
                    .map_err(|_| TransportError::StreamClosed(self.address()))?;
                if mode == ConnMode::Closed {
                    return Err(TransportError::StreamClosed(self.address()));
                }

                let won = self.mode.send_if_modified(|mode| {
                    if *mode == ConnMode::Stream {
                        *mode = ConnMode::Claimed;
                        true
                    } else {
                        false
                    }
                });
                if won {
                    return Ok(());
                }
            }
        };

        timeout(wait, claim)
            .await
            .map_err(|_| TransportError::StreamTimeout(self.address()))??;

        let reader = self.reader.lock().await;
        debug!(peer = %self.remote_addr, "Claimed incoming stream");

        Ok(StreamGuard {
            peer: self,
            reader,
            read_timeout: wait,
            idle: None,
        })
    }
}

impl std::fmt::Debug for TcpPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpPeer")
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.outbound)
            .field("mode", &self.mode())
            .finish()
    }
}

/// Exclusive ownership of a raw stream on a peer connection
///
/// Reads fail with `TimedOut` if the peer stalls longer than the read
/// timeout. Closing or dropping the guard hands the connection back to the
/// frame loop.
pub struct StreamGuard<'a> {
    peer: &'a TcpPeer,
    reader: MutexGuard<'a, OwnedReadHalf>,
    read_timeout: Duration,
    idle: Option<Pin<Box<Sleep>>>,
}

impl StreamGuard<'_> {
    /// Signal that the raw read is complete
    pub fn close_stream(self) {
        drop(self);
    }

    /// Give up on a stream whose remaining bytes cannot be consumed
    ///
    /// The rest of the connection can no longer be framed, so it is closed.
    pub async fn abandon(self) {
        let peer = self.peer;
        peer.mode.send_replace(ConnMode::Closed);
        drop(self);
        peer.close().await;
    }
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        self.peer.mode.send_if_modified(|mode| {
            if *mode == ConnMode::Claimed {
                *mode = ConnMode::Frame;
                true
            } else {
                false
            }
        });
        trace!(peer = %self.peer.remote_addr, "Stream released");
    }
}

impl AsyncRead for StreamGuard<'_> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        match Pin::new(&mut *this.reader).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.idle = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                let read_timeout = this.read_timeout;
                let idle = this
                    .idle
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(read_timeout)));
                match idle.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.idle = None;
                        Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("stream from {} stalled", this.peer.remote_addr),
                        )))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}
