//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Each inbound SSH connection is served by a dedicated [`SshSession`].  The
//! handler accepts any public key offered for the configured username (the
//! real authorization decision is the routing step) and hands every
//! "session" channel to its own [`Router::run_channel`] task.  All other
//! channel types and connection-level requests are refused.
//!
//! Channel events are passed on through [`Downstream`]; see
//! [`super::downstream`] for why requests are answered from the callbacks.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Pty, Sig};
use russh_keys::key::PublicKey;
use tracing::{info, info_span, warn, Instrument};

use super::channel::{ChannelOpen, Chunk, DataStream};
use super::downstream::Downstream;
use super::phase::Router;
use super::requests::{terminal_modes_of, TypedRequest};
use crate::credentials::fingerprint_of;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct SshSession {
    router: Arc<Router>,
    username: String,
    peer_addr: Option<SocketAddr>,
    fingerprint: Option<String>,
    downstream: Downstream,
}

impl SshSession {
    /// Create a new session for an incoming connection.
    pub fn new(router: Arc<Router>, username: String, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            router,
            username,
            peer_addr,
            fingerprint: None,
            downstream: Downstream::new(),
        }
    }

    /// Public-key decision: any key, but only for the configured username.
    fn accepts(&self, user: &str) -> bool {
        user == self.username
    }
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let fp = fingerprint_of(key);
        info!(
            peer = ?self.peer_addr,
            user = %user,
            fingerprint = %fp,
            "SSH public-key auth attempt"
        );

        if !self.accepts(user) {
            warn!(peer = ?self.peer_addr, user = %user, "rejected unknown username");
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }

        self.fingerprint = Some(fp);
        Ok(Auth::Accept)
    }

    /// Every session channel gets its own routing state machine.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        // Events arrive through the callbacks below; the channel's own queue
        // is never read, so it is released right away.
        drop(channel);
        let (sink, source) = self.downstream.open(id, session.handle());
        let router = Arc::clone(&self.router);
        let span = info_span!(
            "channel",
            peer = ?self.peer_addr,
            fingerprint = self.fingerprint.as_deref().unwrap_or(""),
            channel = ?id,
        );

        tokio::spawn(
            async move {
                router
                    .run_channel(ChannelOpen::session(), Arc::new(sink), source)
                    .await;
            }
            .instrument(span),
        );
        Ok(true)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.downstream
            .data(channel, Chunk::primary(Bytes::copy_from_slice(data)))
            .await;
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let chunk = Chunk {
            stream: DataStream::Extended(code),
            bytes: Bytes::copy_from_slice(data),
        };
        self.downstream.data(channel, chunk).await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.downstream.eof(channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.downstream.close(channel);
        Ok(())
    }

    // -- Channel requests -------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = TypedRequest::Pty {
            term: term.to_string(),
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes: terminal_modes_of(modes),
        };
        self.downstream.request(channel, request, session).await;
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        single_connection: bool,
        x11_auth_protocol: &str,
        x11_auth_cookie: &str,
        x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = TypedRequest::X11 {
            single_connection,
            protocol: x11_auth_protocol.to_string(),
            cookie: x11_auth_cookie.to_string(),
            screen: x11_screen_number,
        };
        self.downstream.request(channel, request, session).await;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = TypedRequest::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.downstream.request(channel, request, session).await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.downstream
            .request(channel, TypedRequest::Shell, session)
            .await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.downstream
            .request(channel, TypedRequest::Exec(data.to_vec()), session)
            .await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.downstream
            .request(channel, TypedRequest::Subsystem(name.to_string()), session)
            .await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = TypedRequest::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        };
        self.downstream.request(channel, request, session).await;
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.downstream
            .request(channel, TypedRequest::Signal(signal), session)
            .await;
        Ok(())
    }

    /// The channel reply is sent by [`Downstream::request`].  `russh` turns
    /// the return value into a connection-level reply that is only sent for
    /// `true` when one is pending, so `true` keeps a stray one off the wire.
    async fn agent_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.downstream
            .request(channel, TypedRequest::AgentForward, session)
            .await;
        Ok(true)
    }

    // -- Refused channels -------------------------------------------------

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(
            peer = ?self.peer_addr,
            target = %format!("{host_to_connect}:{port_to_connect}"),
            "rejected direct-tcpip channel"
        );
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
