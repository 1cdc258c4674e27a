//! In-memory stand-ins for both SSH peers, the resolver and the connector.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use tokio::sync::{oneshot, Notify};

use super::channel::{
    source_pair, ChannelOpen, ChannelSink, Chunk, DataStream, Reply, Request, RequestFrame,
    SourceFeed, EXTENDED_DATA_STDERR,
};
use super::upstream::{Connector, Upstream};
use crate::error::ConnectError;
use crate::route::{ResolveError, Resolver};
use crate::wire::encode_env_payload;

// ---------------------------------------------------------------------------
// Recording sink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Data(Chunk),
    Eof,
    Request(RequestFrame),
    Close,
}

/// A peer that records everything written to it.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
    /// Answers for want-reply requests, in order.  `true` once exhausted.
    answers: Mutex<VecDeque<bool>>,
    fail_data: bool,
    changed: Notify,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answering(answers: &[bool]) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.iter().copied().collect()),
            ..Self::default()
        })
    }

    /// A peer whose data writes always fail.
    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            fail_data: true,
            ..Self::default()
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn request_kinds(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Request(frame) => Some(frame.kind),
                _ => None,
            })
            .collect()
    }

    /// Everything written on the primary stream, concatenated.
    pub fn stdout(&self) -> Vec<u8> {
        self.collect(|c| c.stream == DataStream::Primary)
    }

    /// Everything written on the stderr stream, as text.
    pub fn stderr(&self) -> String {
        let raw = self.collect(|c| c.stream == DataStream::Extended(EXTENDED_DATA_STDERR));
        String::from_utf8_lossy(&raw).into_owned()
    }

    pub fn closed(&self) -> bool {
        self.events().contains(&Event::Close)
    }

    /// Wait (at most five seconds) until `pred` holds for the recorded events.
    pub async fn wait_until(&self, pred: impl Fn(&[Event]) -> bool) {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                if pred(&self.events()) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("condition not reached; events: {:?}", self.events()));
    }

    fn collect(&self, keep: impl Fn(&Chunk) -> bool) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Data(c) if keep(&c) => Some(c.bytes.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
        self.changed.notify_waiters();
    }
}

#[async_trait::async_trait]
impl ChannelSink for RecordingSink {
    async fn data(&self, chunk: Chunk) -> Result<()> {
        if self.fail_data {
            return Err(anyhow!("broken pipe"));
        }
        self.record(Event::Data(chunk));
        Ok(())
    }

    async fn eof(&self) -> Result<()> {
        self.record(Event::Eof);
        Ok(())
    }

    async fn request(&self, frame: RequestFrame) -> Result<bool> {
        let want_reply = frame.want_reply;
        self.record(Event::Request(frame));
        if !want_reply {
            return Ok(true);
        }
        Ok(self.answers.lock().unwrap().pop_front().unwrap_or(true))
    }

    async fn close(&self) -> Result<()> {
        self.record(Event::Close);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Feeding requests
// ---------------------------------------------------------------------------

/// Queue a request on `feed`, returning the receiver for its reply.
pub fn send_request(
    feed: &SourceFeed,
    kind: &str,
    want_reply: bool,
    payload: impl Into<Bytes>,
) -> Option<oneshot::Receiver<bool>> {
    let (reply, rx) = Reply::channel(want_reply);
    assert!(feed.request(Request::new(
        RequestFrame::new(kind, want_reply, payload),
        reply
    )));
    rx
}

pub fn send_env(feed: &SourceFeed, key: &str, value: &str) -> oneshot::Receiver<bool> {
    send_request(
        feed,
        "env",
        true,
        encode_env_payload(key.as_bytes(), value.as_bytes()),
    )
    .unwrap()
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeResolver {
    routes: HashMap<String, String>,
    broken: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeResolver {
    pub fn with_route(project: &str, address: &str) -> Arc<Self> {
        Arc::new(Self {
            routes: HashMap::from([(project.to_string(), address.to_string())]),
            ..Self::default()
        })
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            broken: true,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Resolver for FakeResolver {
    async fn resolve(&self, project: &str) -> Result<String, ResolveError> {
        self.calls.lock().unwrap().push(project.to_string());
        if self.broken {
            return Err(ResolveError::Internal(anyhow!("api.internal:8000 unreachable")));
        }
        self.routes
            .get(project)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(project.to_string()))
    }

    async fn check(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Hands out one pre-built upstream channel, or fails every dial.
#[derive(Default)]
pub struct FakeConnector {
    upstream: Mutex<Option<Upstream>>,
    dials: Mutex<Vec<(String, ChannelOpen)>>,
}

impl FakeConnector {
    /// A connector whose single upstream records into `sink` and is fed
    /// through the returned [`SourceFeed`].
    pub fn with_upstream(sink: Arc<RecordingSink>) -> (Arc<Self>, SourceFeed) {
        let (feed, source) = source_pair();
        let connector = Self {
            upstream: Mutex::new(Some(Upstream { sink, source })),
            ..Self::default()
        };
        (Arc::new(connector), feed)
    }

    /// A connector that cannot reach anything.
    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dials(&self) -> Vec<(String, ChannelOpen)> {
        self.dials.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, address: &str, open: &ChannelOpen) -> Result<Upstream, ConnectError> {
        self.dials
            .lock()
            .unwrap()
            .push((address.to_string(), open.clone()));
        self.upstream
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ConnectError::Dial(anyhow!("connect to {address}: connection refused")))
    }
}
