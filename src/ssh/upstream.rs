//! SSH client side: one upstream connection per proxied channel.
//!
//! [`SshConnector`] dials the backend, authenticates with the proxy-wide
//! client key and opens a channel mirroring the downstream one.  The opened
//! channel is owned by a small actor task; [`UpstreamSink`] talks to it over
//! a command queue and the actor feeds everything the backend sends into a
//! [`ChannelSource`].
//!
//! The client session loop must never wait on the relay: the relay may be
//! waiting on the server session loop, which in turn may be waiting for this
//! connection's window.  Replies to our requests are therefore taken in the
//! [`BackendHandler`] callbacks, and the actor stops reading backend data
//! while the relay's queue is full instead of blocking on it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use russh::client::{self, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg, Disconnect, SshId};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::channel::{
    source_pair, ChannelOpen, ChannelSink, ChannelSource, Chunk, DataStream, Reply, Request,
    RequestFrame, SourceFeed,
};
use super::requests::TypedRequest;
use crate::config::UpstreamConfig;
use crate::credentials::fingerprint_of;
use crate::error::ConnectError;

// ---------------------------------------------------------------------------
// Connector trait
// ---------------------------------------------------------------------------

/// An open upstream channel.
pub struct Upstream {
    pub sink: Arc<dyn ChannelSink>,
    pub source: ChannelSource,
}

/// Opens upstream channels.  Implemented over SSH by [`SshConnector`] and by
/// in-memory fakes in tests.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str, open: &ChannelOpen) -> Result<Upstream, ConnectError>;
}

// ---------------------------------------------------------------------------
// SSH connector
// ---------------------------------------------------------------------------

pub struct SshConnector {
    config: Arc<client::Config>,
    key: Arc<KeyPair>,
    username: String,
    connect_timeout: Duration,
    known_host_fingerprints: Arc<Vec<String>>,
}

impl SshConnector {
    /// `version` is the identification string sent to backends; the router
    /// presents the same one on both sides.
    pub fn new(
        upstream: &UpstreamConfig,
        default_username: &str,
        version: &str,
        client_key: KeyPair,
    ) -> Self {
        let config = client::Config {
            client_id: SshId::Standard(version.to_string()),
            inactivity_timeout: None,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            key: Arc::new(client_key),
            username: upstream
                .username
                .clone()
                .unwrap_or_else(|| default_username.to_string()),
            connect_timeout: upstream.connect_timeout(),
            known_host_fingerprints: Arc::new(upstream.known_host_fingerprints.clone()),
        }
    }
}

#[async_trait::async_trait]
impl Connector for SshConnector {
    async fn connect(&self, address: &str, open: &ChannelOpen) -> Result<Upstream, ConnectError> {
        if open.channel_type != "session" {
            return Err(ConnectError::ChannelOpen(anyhow!(
                "channel type {:?} cannot be opened upstream",
                open.channel_type
            )));
        }

        // -- Dial ---------------------------------------------------------
        let deadline = Instant::now() + self.connect_timeout;
        let stream = timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ConnectError::Dial(anyhow!("connect to {address} timed out")))?
            .map_err(|e| ConnectError::Dial(anyhow!("connect to {address}: {e}")))?;
        let _ = stream.set_nodelay(true);

        // -- Handshake + auth ---------------------------------------------
        let awaiting = Awaiting::default();
        let handler = BackendHandler {
            address: address.to_string(),
            known_host_fingerprints: Arc::clone(&self.known_host_fingerprints),
            awaiting: awaiting.clone(),
        };
        let mut handle = timeout_at(
            deadline,
            client::connect_stream(Arc::clone(&self.config), stream, handler),
        )
        .await
        .map_err(|_| ConnectError::Handshake(anyhow!("handshake with {address} timed out")))?
        .map_err(|e| ConnectError::Handshake(e.context(format!("handshake with {address}"))))?;

        let accepted = handle
            .authenticate_publickey(self.username.clone(), Arc::clone(&self.key))
            .await
            .map_err(|e| ConnectError::Handshake(anyhow!("authenticating to {address}: {e}")))?;
        if !accepted {
            return Err(ConnectError::Handshake(anyhow!(
                "{address} rejected the proxy client key for user {:?}",
                self.username
            )));
        }

        // -- Channel ------------------------------------------------------
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ConnectError::ChannelOpen(anyhow!("opening session on {address}: {e}")))?;

        debug!(address = %address, "upstream channel open");

        let (feed, source) = source_pair();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_actor(handle, channel, feed, cmd_rx, awaiting));

        Ok(Upstream {
            sink: Arc::new(UpstreamSink { commands: cmd_tx }),
            source,
        })
    }
}

// ---------------------------------------------------------------------------
// Client handler
// ---------------------------------------------------------------------------

/// Answer slots of want-reply requests sent to the backend, oldest first.
/// The backend answers channel requests in order (RFC 4254 §5.4).
#[derive(Clone, Default)]
struct Awaiting(Arc<Mutex<VecDeque<oneshot::Sender<bool>>>>);

impl Awaiting {
    fn slots(&self) -> MutexGuard<'_, VecDeque<oneshot::Sender<bool>>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn answer(&self, ok: bool) {
        if let Some(tx) = self.slots().pop_front() {
            let _ = tx.send(ok);
        }
    }
}

struct BackendHandler {
    address: String,
    known_host_fingerprints: Arc<Vec<String>>,
    awaiting: Awaiting,
}

#[async_trait::async_trait]
impl client::Handler for BackendHandler {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool> {
        let fp = fingerprint_of(server_public_key);
        if self.known_host_fingerprints.is_empty() {
            debug!(address = %self.address, fingerprint = %fp, "backend host key accepted");
            return Ok(true);
        }
        let known = self.known_host_fingerprints.iter().any(|k| *k == fp);
        if !known {
            warn!(address = %self.address, fingerprint = %fp, "backend host key not in allow-list");
        }
        Ok(known)
    }

    async fn channel_success(&mut self, _channel: ChannelId, _session: &mut Session) -> Result<()> {
        self.awaiting.answer(true);
        Ok(())
    }

    async fn channel_failure(&mut self, _channel: ChannelId, _session: &mut Session) -> Result<()> {
        self.awaiting.answer(false);
        Ok(())
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<()> {
        warn!(address = %self.address, "backend opened a forwarded-tcpip channel, closing it");
        let _ = channel.close().await;
        Ok(())
    }

    async fn server_channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<()> {
        warn!(address = %self.address, "backend opened an x11 channel, closing it");
        let _ = channel.close().await;
        Ok(())
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<()> {
        warn!(address = %self.address, "backend opened an agent channel, closing it");
        let _ = channel.close().await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Channel actor
// ---------------------------------------------------------------------------

enum Command {
    Data(Chunk, oneshot::Sender<Result<()>>),
    Eof(oneshot::Sender<Result<()>>),
    Request(RequestFrame, oneshot::Sender<bool>),
    Close(oneshot::Sender<Result<()>>),
}

/// Operations towards the backend on one channel.
pub struct UpstreamSink {
    commands: mpsc::UnboundedSender<Command>,
}

impl UpstreamSink {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| anyhow!("upstream channel is closed"))?;
        rx.await.map_err(|_| anyhow!("upstream channel is closed"))
    }
}

#[async_trait::async_trait]
impl ChannelSink for UpstreamSink {
    async fn data(&self, chunk: Chunk) -> Result<()> {
        self.call(|tx| Command::Data(chunk, tx)).await?
    }

    async fn eof(&self) -> Result<()> {
        self.call(Command::Eof).await?
    }

    async fn request(&self, frame: RequestFrame) -> Result<bool> {
        self.call(|tx| Command::Request(frame, tx)).await
    }

    async fn close(&self) -> Result<()> {
        self.call(Command::Close).await?
    }
}

/// Room for one more chunk in the relay's queue, or `None` once nobody
/// takes data any more.
async fn reserve(data: &Option<mpsc::Sender<Chunk>>) -> Option<mpsc::OwnedPermit<Chunk>> {
    data.clone()?.reserve_owned().await.ok()
}

/// Owns the client channel.  Runs until the backend closes the channel or
/// every [`UpstreamSink`] is gone, then disconnects the connection.
async fn run_actor(
    handle: client::Handle<BackendHandler>,
    mut channel: Channel<Msg>,
    feed: SourceFeed,
    mut commands: mpsc::UnboundedReceiver<Command>,
    awaiting: Awaiting,
) {
    let SourceFeed {
        requests,
        data: mut data_tx,
    } = feed;
    // Read from the backend but not yet accepted by the relay.  Backend
    // messages are left in russh's queue while this is set.
    let mut held: Option<Chunk> = None;

    loop {
        tokio::select! {
            slot = reserve(&data_tx), if held.is_some() => {
                match (slot, held.take()) {
                    (Some(permit), Some(chunk)) => {
                        let _ = permit.send(chunk);
                    }
                    _ => data_tx = None,
                }
            }
            msg = channel.wait(), if held.is_none() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        held = Some(Chunk::primary(Bytes::copy_from_slice(&data)));
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        held = Some(Chunk {
                            stream: DataStream::Extended(ext),
                            bytes: Bytes::copy_from_slice(&data),
                        });
                    }
                    Some(ChannelMsg::Eof) => data_tx = None,
                    Some(ChannelMsg::Close) | None => break,
                    Some(other) => {
                        // Replies were taken by the handler.  What is left is
                        // the backend's own requests, which never get one.
                        if let Some((request, _)) = TypedRequest::from_msg(other) {
                            let frame = request.to_frame(false);
                            let _ = requests.send(Request::new(frame, Reply::none()));
                        }
                    }
                }
            }
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    let _ = channel.close().await;
                    break;
                };
                match cmd {
                    Command::Data(chunk, ack) => {
                        let sent = match chunk.stream {
                            DataStream::Primary => channel.data(&chunk.bytes[..]).await,
                            DataStream::Extended(ext) => {
                                channel.extended_data(ext, &chunk.bytes[..]).await
                            }
                        };
                        let _ = ack.send(sent.map_err(|e| anyhow!("upstream write failed: {e}")));
                    }
                    Command::Eof(ack) => {
                        let sent = channel.eof().await;
                        let _ = ack.send(sent.map_err(|e| anyhow!("upstream EOF failed: {e}")));
                    }
                    Command::Close(ack) => {
                        let sent = channel.close().await;
                        let _ = ack.send(sent.map_err(|e| anyhow!("upstream close failed: {e}")));
                    }
                    Command::Request(frame, ack) => forward_request(&channel, frame, ack, &awaiting).await,
                }
            }
        }
    }

    // Anything still waiting for a reply gets a negative one.
    for tx in awaiting.slots().drain(..) {
        let _ = tx.send(false);
    }
    drop(requests);
    drop(data_tx);

    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
    {
        debug!(error = %e, "upstream disconnect failed");
    }
    info!("upstream connection closed");
}

/// Send one frame and arrange for `ack` to get its outcome.  A transport
/// failure drops `ack`, which the relay sees as an error.
async fn forward_request(
    channel: &Channel<Msg>,
    frame: RequestFrame,
    ack: oneshot::Sender<bool>,
    awaiting: &Awaiting,
) {
    if !frame.want_reply {
        match send_request(channel, &frame).await {
            Ok(sent) => {
                let _ = ack.send(sent);
            }
            Err(e) => debug!(kind = %frame.kind, error = %e, "upstream request not sent"),
        }
        return;
    }

    // The slot goes in before the request goes out so the reply cannot
    // arrive first.  Only this task adds slots, so on failure the last one
    // is ours.
    awaiting.slots().push_back(ack);
    match send_request(channel, &frame).await {
        Ok(true) => {}
        Ok(false) => {
            if let Some(ack) = awaiting.slots().pop_back() {
                let _ = ack.send(false);
            }
        }
        Err(e) => {
            debug!(kind = %frame.kind, error = %e, "upstream request not sent");
            awaiting.slots().pop_back();
        }
    }
}

/// Send one frame as the matching typed call.  `Ok(false)` means the frame
/// could not be expressed and nothing was sent.
async fn send_request(channel: &Channel<Msg>, frame: &RequestFrame) -> Result<bool> {
    let request = match TypedRequest::from_frame(frame) {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(false),
        Err(e) => {
            debug!(kind = %frame.kind, error = %e, "malformed request payload, not forwarding");
            return Ok(false);
        }
    };
    let want_reply = frame.want_reply;
    let sent = match request {
        TypedRequest::Pty {
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes,
        } => {
            channel
                .request_pty(
                    want_reply, &term, col_width, row_height, pix_width, pix_height, &modes,
                )
                .await
        }
        TypedRequest::Shell => channel.request_shell(want_reply).await,
        TypedRequest::Exec(command) => channel.exec(want_reply, command).await,
        TypedRequest::Env { name, value } => channel.set_env(want_reply, name, value).await,
        TypedRequest::Signal(sig) => channel.signal(sig).await,
        TypedRequest::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            channel
                .window_change(col_width, row_height, pix_width, pix_height)
                .await
        }
        TypedRequest::Subsystem(name) => channel.request_subsystem(want_reply, name).await,
        TypedRequest::X11 {
            single_connection,
            protocol,
            cookie,
            screen,
        } => {
            channel
                .request_x11(want_reply, single_connection, protocol, cookie, screen)
                .await
        }
        TypedRequest::AgentForward => channel.agent_forward(want_reply).await,
        // Not something a client sends; there is no client-side call for it.
        TypedRequest::XonXoff(_) | TypedRequest::ExitStatus(_) | TypedRequest::ExitSignal { .. } => {
            return Ok(false)
        }
    };
    sent.map_err(|e| anyhow!("sending {} upstream: {e}", frame.kind))?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
