//! Transport-neutral view of one SSH channel.
//!
//! The phase controller and relay engine never touch `russh` types.  Each
//! side of a proxied channel is presented to them as
//!
//! * a [`ChannelSource`]: the requests and data the peer sends us, and
//! * a [`ChannelSink`]: the operations we can perform towards the peer.
//!
//! The adapters in [`super::downstream`] and [`super::upstream`] implement
//! this for the server and client halves respectively; the tests implement it
//! in memory.

use std::fmt;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

/// SSH extended-data type code for stderr (RFC 4254 §5.2).
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Chunks a channel's data queue holds before its producer has to wait.
pub const DATA_QUEUE_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// Channel open parameters
// ---------------------------------------------------------------------------

/// Parameters of the downstream channel-open, mirrored verbatim upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    pub channel_type: String,
    /// Type-specific bytes trailing the channel-open message.  Opaque.
    pub extra: Bytes,
}

impl ChannelOpen {
    pub fn session() -> Self {
        Self {
            channel_type: "session".to_string(),
            extra: Bytes::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// An SSH channel request in wire form: type name, want-reply flag and the
/// type-specific payload.
#[derive(Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub kind: String,
    pub want_reply: bool,
    pub payload: Bytes,
}

impl RequestFrame {
    pub fn new(kind: impl Into<String>, want_reply: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: kind.into(),
            want_reply,
            payload: payload.into(),
        }
    }
}

impl fmt::Debug for RequestFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestFrame")
            .field("kind", &self.kind)
            .field("want_reply", &self.want_reply)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Handle used to answer one request exactly once.
///
/// If the handle is dropped without [`Reply::send`] having been called, a
/// negative reply is issued, so every request that asked for an answer gets
/// one no matter which path the channel takes.
#[derive(Debug)]
pub struct Reply {
    tx: Option<oneshot::Sender<bool>>,
}

impl Reply {
    /// A reply handle for a request that did not ask for one.
    pub fn none() -> Self {
        Self { tx: None }
    }

    /// A handle plus the receiver its answer arrives on.
    pub fn pair() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Like [`Reply::pair`], but without a receiver when `want_reply` is false.
    pub fn channel(want_reply: bool) -> (Self, Option<oneshot::Receiver<bool>>) {
        if !want_reply {
            return (Self::none(), None);
        }
        let (reply, rx) = Self::pair();
        (reply, Some(rx))
    }

    pub fn send(mut self, ok: bool) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(ok);
        }
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(false);
        }
    }
}

/// A request received from a peer, together with the means to answer it.
#[derive(Debug)]
pub struct Request {
    pub frame: RequestFrame,
    pub reply: Reply,
}

impl Request {
    pub fn new(frame: RequestFrame, reply: Reply) -> Self {
        Self { frame, reply }
    }
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// Which of a channel's data streams a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStream {
    Primary,
    Extended(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub stream: DataStream,
    pub bytes: Bytes,
}

impl Chunk {
    pub fn primary(bytes: impl Into<Bytes>) -> Self {
        Self {
            stream: DataStream::Primary,
            bytes: bytes.into(),
        }
    }

    pub fn stderr(bytes: impl Into<Bytes>) -> Self {
        Self {
            stream: DataStream::Extended(EXTENDED_DATA_STDERR),
            bytes: bytes.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Source / sink
// ---------------------------------------------------------------------------

/// Everything a peer sends on a channel, split into its request stream and
/// its data stream.
///
/// `requests` ends when the peer closes the channel.  `data` ends when the
/// peer sends EOF (or the channel closes).  The data queue is bounded by
/// [`DATA_QUEUE_DEPTH`]; requests are few and small and are not.
pub struct ChannelSource {
    pub requests: mpsc::UnboundedReceiver<Request>,
    pub data: mpsc::Receiver<Chunk>,
}

/// Sending half of a [`ChannelSource`], held by transport adapters and tests.
pub struct SourceFeed {
    pub requests: mpsc::UnboundedSender<Request>,
    pub data: Option<mpsc::Sender<Chunk>>,
}

impl SourceFeed {
    /// Queue a request from the peer.  Returns false once the consumer is gone.
    pub fn request(&self, request: Request) -> bool {
        self.requests.send(request).is_ok()
    }

    /// Queue a data chunk, waiting while the queue is full.  Chunks arriving
    /// after EOF are dropped.
    pub async fn data(&self, chunk: Chunk) -> bool {
        match &self.data {
            Some(tx) => tx.send(chunk).await.is_ok(),
            None => false,
        }
    }

    /// Peer sent EOF: no more data will follow.
    pub fn eof(&mut self) {
        self.data.take();
    }
}

/// Create a connected feed/source pair.
pub fn source_pair() -> (SourceFeed, ChannelSource) {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE_DEPTH);
    (
        SourceFeed {
            requests: req_tx,
            data: Some(data_tx),
        },
        ChannelSource {
            requests: req_rx,
            data: data_rx,
        },
    )
}

/// Operations towards one peer of a channel.
#[async_trait::async_trait]
pub trait ChannelSink: Send + Sync {
    /// Write a data chunk on the given stream.
    async fn data(&self, chunk: Chunk) -> Result<()>;

    /// Half-close: no more data will be written by us.
    async fn eof(&self) -> Result<()>;

    /// Send a request.  Resolves to the peer's answer when the frame asked for
    /// one and to `true` once sent when it did not.  A request that cannot be
    /// sent at all over this transport resolves to `false`.
    async fn request(&self, frame: RequestFrame) -> Result<bool>;

    /// Close the channel in both directions.
    async fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
