//! Server-side channel adapter.
//!
//! `russh` reports everything a client sends on a channel through
//! [`Handler`](russh::server::Handler) callbacks run by the session loop,
//! and a channel request can only be answered from inside its own callback:
//! the library remembers a single want-reply flag per channel and drops any
//! reply issued after the next request arrived.  [`Downstream`] therefore
//! keeps one [`SourceFeed`] per open channel and
//!
//! * queues data chunks, waiting while the channel's queue is full (this
//!   holds the session loop, so a client that outruns its backend stalls on
//!   its TCP connection), and
//! * hands each request to the phase controller and waits for its answer
//!   before replying, so replies leave in request order.
//!
//! The phase controller answers requests it only buffers right away, so the
//! session loop is held for a request only while the verdict depends on the
//! backend.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use russh::server::{Handle, Session};
use russh::{ChannelId, CryptoVec};
use tracing::{debug, trace};

use super::channel::{
    source_pair, ChannelSink, ChannelSource, Chunk, DataStream, Reply, Request, RequestFrame,
    SourceFeed,
};
use super::requests::TypedRequest;

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Operations towards the SSH client on one channel.
pub struct DownstreamSink {
    handle: Handle,
    id: ChannelId,
}

impl DownstreamSink {
    pub fn new(handle: Handle, id: ChannelId) -> Self {
        Self { handle, id }
    }
}

#[async_trait::async_trait]
impl ChannelSink for DownstreamSink {
    async fn data(&self, chunk: Chunk) -> Result<()> {
        let payload = CryptoVec::from_slice(&chunk.bytes);
        let sent = match chunk.stream {
            DataStream::Primary => self.handle.data(self.id, payload).await,
            DataStream::Extended(ext) => self.handle.extended_data(self.id, ext, payload).await,
        };
        sent.map_err(|_| anyhow!("downstream channel {:?} is closed", self.id))
    }

    async fn eof(&self) -> Result<()> {
        self.handle
            .eof(self.id)
            .await
            .map_err(|_| anyhow!("failed to send EOF on downstream channel {:?}", self.id))
    }

    /// Only exit-status and exit-signal can be sent to a client, and neither
    /// takes a reply.
    async fn request(&self, frame: RequestFrame) -> Result<bool> {
        let request = match TypedRequest::from_frame(&frame) {
            Ok(Some(request)) => request,
            Ok(None) | Err(_) => {
                debug!(kind = %frame.kind, "request cannot be sent to the client, dropping");
                return Ok(false);
            }
        };
        let sent = match request {
            TypedRequest::ExitStatus(code) => {
                self.handle.exit_status_request(self.id, code).await
            }
            TypedRequest::ExitSignal {
                signal,
                core_dumped,
                error_message,
                lang_tag,
            } => {
                self.handle
                    .exit_signal_request(self.id, signal, core_dumped, error_message, lang_tag)
                    .await
            }
            other => {
                debug!(kind = other.kind(), "request cannot be sent to the client, dropping");
                return Ok(false);
            }
        };
        sent.map_err(|_| {
            anyhow!("failed to send {} on downstream channel {:?}", frame.kind, self.id)
        })?;
        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        self.handle
            .close(self.id)
            .await
            .map_err(|_| anyhow!("failed to close downstream channel {:?}", self.id))
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// The feeds of every open channel on one client connection.
#[derive(Default)]
pub struct Downstream {
    feeds: HashMap<ChannelId, SourceFeed>,
}

impl Downstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly opened channel.
    pub fn open(&mut self, id: ChannelId, handle: Handle) -> (DownstreamSink, ChannelSource) {
        let (feed, source) = source_pair();
        self.feeds.insert(id, feed);
        (DownstreamSink::new(handle, id), source)
    }

    pub fn is_open(&self, id: ChannelId) -> bool {
        self.feeds.contains_key(&id)
    }

    pub async fn data(&self, id: ChannelId, chunk: Chunk) {
        let Some(feed) = self.feeds.get(&id) else {
            return;
        };
        if !feed.data(chunk).await {
            trace!(channel = ?id, "data after EOF or after the channel finished, dropping");
        }
    }

    pub fn eof(&mut self, id: ChannelId) {
        if let Some(feed) = self.feeds.get_mut(&id) {
            feed.eof();
        }
    }

    /// The client closed the channel: its request stream ends.
    pub fn close(&mut self, id: ChannelId) {
        self.feeds.remove(&id);
    }

    /// Hand a request to the channel's controller and answer the client with
    /// its verdict.  `russh` only puts the reply on the wire if the client
    /// asked for one.
    pub async fn request(
        &self,
        id: ChannelId,
        request: TypedRequest,
        session: &mut Session,
    ) -> bool {
        let ok = match self.feeds.get(&id) {
            Some(feed) => {
                let (reply, answer) = Reply::pair();
                let frame = request.to_frame(request.asks_for_reply());
                feed.request(Request::new(frame, reply)) && answer.await.unwrap_or(false)
            }
            None => false,
        };
        if ok {
            session.channel_success(id);
        } else {
            session.channel_failure(id);
        }
        ok
    }
}
