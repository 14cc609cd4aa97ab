// ABOUTME: Transport channel owning one physical byte stream.
// ABOUTME: Reader and writer tasks, a bounded outbound queue, and exactly-once close reporting.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_proto::{CodecError, Frame, FrameCodec};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;
use crate::state::BreakOrigin;
use crate::sync::lock;

/// Framed read half of a byte stream.
pub type FrameReader<S> = FramedRead<ReadHalf<S>, FrameCodec>;
/// Framed write half of a byte stream.
pub type FrameWriter<S> = FramedWrite<WriteHalf<S>, FrameCodec>;

/// Split a byte stream into framed halves.
pub fn split_framed<S>(stream: S, max_frame_length: usize) -> (FrameReader<S>, FrameWriter<S>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(stream);
    (
        FramedRead::new(read, FrameCodec::with_max_frame_length(max_frame_length)),
        FramedWrite::new(write, FrameCodec::with_max_frame_length(max_frame_length)),
    )
}

/// Why a transport stopped. The first cause recorded wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// A close frame was sent or received before shutdown.
    Graceful,
    /// This side tore the transport down without a close frame.
    LocalAbort,
    /// Peer hung up (EOF or reset) without a close frame.
    PeerClosed,
    /// Nothing heard from the peer within the keep-alive timeout.
    PeerTimeout,
    /// Read, write or decode failure.
    Io(String),
}

impl CloseCause {
    /// Which side broke the transport; None for a graceful shutdown.
    pub fn origin(&self) -> Option<BreakOrigin> {
        match self {
            CloseCause::Graceful => None,
            CloseCause::LocalAbort => Some(BreakOrigin::Local),
            CloseCause::PeerClosed | CloseCause::PeerTimeout | CloseCause::Io(_) => {
                Some(BreakOrigin::Peer)
            }
        }
    }
}

/// Owner callbacks. Called from the reader task; must not block.
pub trait FrameHandler: Send + Sync + 'static {
    /// `transport` is the handle the frame arrived on, for replies.
    fn on_frame(&self, transport: &Transport, frame: Frame);

    /// Called exactly once, after the last `on_frame`.
    fn on_closed(&self, cause: CloseCause);
}

/// Sender half of the outbound frame queue.
#[derive(Debug, Clone)]
pub struct FrameSender {
    inner: mpsc::Sender<Frame>,
}

impl FrameSender {
    pub fn new(sender: mpsc::Sender<Frame>) -> Self {
        Self { inner: sender }
    }

    /// Queue a frame, waiting for buffer space.
    pub async fn send(&self, frame: Frame) -> Result<(), RpcError> {
        self.inner
            .send(frame)
            .await
            .map_err(|_| RpcError::StreamClosed)
    }

    /// Queue a frame without waiting.
    pub fn try_send(&self, frame: Frame) -> Result<(), RpcError> {
        self.inner
            .try_send(frame)
            .map_err(|_| RpcError::StreamClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

struct TransportShared {
    cause: Mutex<Option<CloseCause>>,
    /// Flush what is queued, half-close, then linger.
    shutdown: CancellationToken,
    /// Stop both tasks now.
    abort: CancellationToken,
    /// Fired after `on_closed` returned.
    finished: CancellationToken,
}

impl TransportShared {
    fn settle(&self, candidate: CloseCause) -> CloseCause {
        lock(&self.cause).get_or_insert(candidate).clone()
    }
}

/// Handle to a running transport.
#[derive(Clone)]
pub struct Transport {
    sender: FrameSender,
    shared: Arc<TransportShared>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("cause", &*lock(&self.shared.cause))
            .field("finished", &self.shared.finished.is_cancelled())
            .finish()
    }
}

impl Transport {
    /// Spawn the reader and writer tasks over already-framed halves.
    pub fn start<R, W>(
        reader: R,
        writer: W,
        handler: Arc<dyn FrameHandler>,
        write_buffer: usize,
        close_linger: Duration,
    ) -> Self
    where
        R: Stream<Item = Result<Frame, CodecError>> + Send + Unpin + 'static,
        W: Sink<Frame, Error = CodecError> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(write_buffer.max(1));
        let shared = Arc::new(TransportShared {
            cause: Mutex::new(None),
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            finished: CancellationToken::new(),
        });

        let transport = Self {
            sender: FrameSender::new(tx),
            shared: Arc::clone(&shared),
        };
        tokio::spawn(write_loop(writer, rx, Arc::clone(&shared), close_linger));
        tokio::spawn(read_loop(reader, handler, transport.clone()));
        transport
    }

    pub async fn send(&self, frame: Frame) -> Result<(), RpcError> {
        if self.is_closing() {
            return Err(self.closed_error());
        }
        self.sender.send(frame).await.map_err(|_| self.closed_error())
    }

    pub fn try_send(&self, frame: Frame) -> Result<(), RpcError> {
        if self.is_closing() {
            return Err(self.closed_error());
        }
        self.sender.try_send(frame).map_err(|e| match e {
            RpcError::StreamClosed => self.closed_error(),
            other => other,
        })
    }

    /// Error for a write refused because the transport is going away.
    fn closed_error(&self) -> RpcError {
        match self.close_cause() {
            Some(CloseCause::Io(reason)) => RpcError::Transport(reason),
            Some(CloseCause::PeerClosed) => {
                RpcError::Transport("peer closed the stream".to_string())
            }
            Some(CloseCause::PeerTimeout) => {
                RpcError::Transport("peer silent past keep-alive timeout".to_string())
            }
            _ => RpcError::StreamClosed,
        }
    }

    /// Stop the transport. `Graceful` flushes queued frames first; anything
    /// else drops the stream immediately. Only the first cause is kept.
    pub fn close_locally(&self, cause: CloseCause) {
        let graceful = cause == CloseCause::Graceful;
        let settled = self.shared.settle(cause);
        tracing::trace!(cause = ?settled, "transport close requested");
        if graceful {
            self.shared.shutdown.cancel();
        } else {
            self.shared.abort.cancel();
        }
    }

    /// Cause recorded so far, if any.
    pub fn close_cause(&self) -> Option<CloseCause> {
        lock(&self.shared.cause).clone()
    }

    pub fn is_closing(&self) -> bool {
        self.shared.shutdown.is_cancelled() || self.shared.abort.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.is_cancelled()
    }

    /// Resolves once the owner has been told the transport closed.
    pub async fn closed(&self) {
        self.shared.finished.cancelled().await
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Frame>,
    shared: Arc<TransportShared>,
    close_linger: Duration,
) where
    W: Sink<Frame, Error = CodecError> + Unpin,
{
    loop {
        // Queued frames go out before a graceful shutdown takes effect.
        let next = tokio::select! {
            biased;
            _ = shared.abort.cancelled() => return,
            frame = rx.recv() => frame,
            _ = shared.shutdown.cancelled() => None,
        };
        let Some(frame) = next else { break };

        let kind = frame.kind();
        tokio::select! {
            _ = shared.abort.cancelled() => return,
            result = writer.send(frame) => {
                if let Err(e) = result {
                    tracing::debug!(error = %e, frame = kind, "frame write failed");
                    shared.settle(CloseCause::Io(e.to_string()));
                    shared.abort.cancel();
                    return;
                }
            }
        }
    }

    tokio::select! {
        _ = shared.abort.cancelled() => return,
        result = writer.close() => {
            if let Err(e) = result {
                tracing::debug!(error = %e, "transport shutdown failed");
            }
        }
    }

    // Let the peer read the tail and hang up on its own.
    tokio::select! {
        _ = shared.abort.cancelled() => {}
        _ = tokio::time::sleep(close_linger) => shared.abort.cancel(),
    }
}

async fn read_loop<R>(mut reader: R, handler: Arc<dyn FrameHandler>, transport: Transport)
where
    R: Stream<Item = Result<Frame, CodecError>> + Unpin,
{
    let shared = Arc::clone(&transport.shared);
    let cause = loop {
        tokio::select! {
            _ = shared.abort.cancelled() => break shared.settle(CloseCause::LocalAbort),
            next = reader.next() => match next {
                Some(Ok(frame)) => handler.on_frame(&transport, frame),
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "frame read failed");
                    break shared.settle(CloseCause::Io(e.to_string()));
                }
                None => break shared.settle(CloseCause::PeerClosed),
            },
        }
    };

    shared.abort.cancel();
    handler.on_closed(cause);
    shared.finished.cancel();
}
