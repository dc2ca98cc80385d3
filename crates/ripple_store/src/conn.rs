//! Framed wire transport and the per-connection message multiplexer.
//!
//! Frames are a 16-bit big-endian length prefix followed by a JSON-encoded
//! envelope. Each connection runs a reader task and a writer task; outbound
//! requests register a one-shot response slot keyed by request id, and every
//! other inbound frame is routed to a swappable handler. Handler invocations
//! are serialized per connection by running them inline in the reader task,
//! so handlers must never await a tracked request on their own connection.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::message::{Envelope, Message};

/// Largest frame body the 16-bit length prefix can describe.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Depth of the per-connection outbound queue.
const OUTGOING_QUEUE_CAPACITY: usize = 256;

/// Transport-level failures. All are recoverable per request; the connection
/// itself is torn down only on a malformed stream or an oversized frame.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge { len: usize },
    #[error("connection closed by peer")]
    PeerClosed,
    #[error("timed out waiting for a response")]
    RequestTimeout,
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Length-prefixed JSON codec for [`Envelope`] frames.
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Envelope;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, TransportError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if src.len() < 2 + len {
            src.reserve(2 + len - src.len());
            return Ok(None);
        }
        src.advance(2);
        let body = src.split_to(len);
        match serde_json::from_slice(&body) {
            Ok(envelope) => Ok(Some(envelope)),
            // The frame boundary is intact, so a bad body only costs this
            // frame, not the connection; it surfaces as an empty envelope.
            Err(err) => {
                tracing::warn!(error = %err, len, "dropping malformed frame body");
                Ok(Some(Envelope::default()))
            }
        }
    }
}

impl Encoder<Envelope> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), TransportError> {
        let body = serde_json::to_vec(&item)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge { len: body.len() });
        }
        dst.reserve(2 + body.len());
        dst.put_u16(body.len() as u16);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

/// Inbound-request callback installed on a connection. The classifier swaps
/// it once it learns whether the peer is a client or a replica.
pub type MessageHandler =
    Arc<dyn Fn(Arc<ConnHandler>, Option<String>, Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// A no-op handler for connections whose traffic is driven entirely by
/// tracked requests (pure clients of a remote node).
pub fn noop_handler() -> MessageHandler {
    Arc::new(|_, _, _| Box::pin(async {}))
}

/// One bidirectional connection: writer queue, reader loop, pending-response
/// table, swappable inbound handler, and a shutdown hook fired exactly once.
pub struct ConnHandler {
    peer_addr: SocketAddr,
    outgoing: mpsc::Sender<Envelope>,
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    handler: RwLock<MessageHandler>,
    shutdown_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    terminated: AtomicBool,
    last_message_micros: AtomicU64,
    request_timeout: Duration,
    cancel: CancellationToken,
}

impl ConnHandler {
    /// Wrap an established stream and spawn its reader and writer tasks.
    pub fn spawn(
        stream: TcpStream,
        peer_addr: SocketAddr,
        handler: MessageHandler,
        request_timeout: Duration,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE_CAPACITY);
        let cancel = parent.child_token();
        let conn = Arc::new(Self {
            peer_addr,
            outgoing,
            pending: Mutex::new(HashMap::new()),
            handler: RwLock::new(handler),
            shutdown_hook: Mutex::new(None),
            terminated: AtomicBool::new(false),
            last_message_micros: AtomicU64::new(epoch_micros()),
            request_timeout,
            cancel: cancel.clone(),
        });

        let writer = conn.clone();
        tokio::spawn(async move {
            writer.write_loop(write_half, outgoing_rx).await;
            writer.close();
        });

        let reader = conn.clone();
        tokio::spawn(async move {
            reader.read_loop(read_half).await;
            reader.close();
        });

        conn
    }

    async fn write_loop(
        &self,
        write_half: tokio::net::tcp::OwnedWriteHalf,
        mut outgoing_rx: mpsc::Receiver<Envelope>,
    ) {
        let mut sink = FramedWrite::new(write_half, FrameCodec);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                item = outgoing_rx.recv() => {
                    let Some(envelope) = item else { break };
                    if let Err(err) = sink.send(envelope).await {
                        tracing::warn!(peer = %self.peer_addr, error = %err, "failed to send frame");
                        break;
                    }
                }
            }
        }
        let _ = sink.into_inner().shutdown().await;
    }

    async fn read_loop(self: &Arc<Self>, read_half: tokio::net::tcp::OwnedReadHalf) {
        let mut frames = FramedRead::new(read_half, FrameCodec);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = frames.next() => match frame {
                    // Clean EOF: the peer closed its end.
                    None => {
                        tracing::debug!(peer = %self.peer_addr, "connection closed by peer");
                        break;
                    }
                    Some(Err(err)) => {
                        tracing::warn!(peer = %self.peer_addr, error = %err, "failed to read frame");
                        break;
                    }
                    Some(Ok(envelope)) => self.dispatch(envelope).await,
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        self.last_message_micros
            .store(epoch_micros(), Ordering::Relaxed);
        let (request_id, message) = envelope.split();
        let Some(message) = message else {
            tracing::warn!(peer = %self.peer_addr, request_id = ?request_id, "dropping empty or unknown envelope");
            return;
        };

        // A frame whose id matches a live pending slot is that request's
        // response; anything else is an inbound request for the handler.
        if let Some(id) = &request_id {
            let slot = self.pending.lock().unwrap().remove(id);
            if let Some(slot) = slot {
                let _ = slot.send(message);
                return;
            }
        }

        let handler = self.handler.read().unwrap().clone();
        handler(self.clone(), request_id, message).await;
    }

    /// Send a request and wait for the matching response. A fresh request id
    /// is assigned on the caller's behalf.
    pub async fn send_request(&self, message: Message) -> Result<Message, TransportError> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(TransportError::PeerClosed);
        }
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(request_id.clone(), tx);

        let envelope = Envelope::new(Some(request_id.clone()), message);
        if self.outgoing.send(envelope).await.is_err() {
            self.pending.lock().unwrap().remove(&request_id);
            return Err(TransportError::PeerClosed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // The slot was dropped without a response: connection torn down.
            Ok(Err(_)) => Err(TransportError::PeerClosed),
            Err(_) => {
                self.pending.lock().unwrap().remove(&request_id);
                Err(TransportError::RequestTimeout)
            }
        }
    }

    /// Fire-and-forget send, used for responses and async notifications.
    pub async fn send_untracked(
        &self,
        request_id: Option<String>,
        message: Message,
    ) -> Result<(), TransportError> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(TransportError::PeerClosed);
        }
        self.outgoing
            .send(Envelope::new(request_id, message))
            .await
            .map_err(|_| TransportError::PeerClosed)
    }

    /// Atomically replace the inbound-request handler.
    pub fn set_handler(&self, handler: MessageHandler) {
        *self.handler.write().unwrap() = handler;
    }

    /// Register the callback fired exactly once when the connection
    /// terminates. A later registration replaces an unfired hook.
    pub fn set_shutdown_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.shutdown_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Tear the connection down: cancel both loops, fail all pending
    /// requests, and fire the shutdown hook. Idempotent.
    pub fn close(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        // Dropping the senders fails every in-flight request with PeerClosed.
        self.pending.lock().unwrap().clear();
        let hook = self.shutdown_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Time since the last frame arrived on this connection.
    pub fn last_message_age(&self) -> Duration {
        let last = self.last_message_micros.load(Ordering::Relaxed);
        Duration::from_micros(epoch_micros().saturating_sub(last))
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

fn epoch_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(u128::from(u64::MAX)) as u64
}
