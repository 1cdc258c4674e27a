//! SSH server bootstrap and the [`russh::server::Server`] implementation.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{self, Server};
use russh::{MethodSet, SshId};
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, info_span, warn, Instrument};

use super::phase::Router;
use super::session::SshSession;
use crate::config::{SecretSource, SshConfig};
use crate::credentials::load_key_pair;
use crate::metrics::Metrics;
use crate::AppState;

/// `EMFILE` and `ENFILE`: out of file descriptors, usually temporary.
const EMFILE: i32 = 24;
const ENFILE: i32 = 23;

// ---------------------------------------------------------------------------
// Server type
// ---------------------------------------------------------------------------

/// Top-level SSH server that hands off each incoming connection to an
/// [`SshSession`] handler.
pub struct SshServer {
    router: Arc<Router>,
    username: String,
}

impl SshServer {
    pub fn new(router: Arc<Router>, username: String) -> Self {
        Self { router, username }
    }
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(
            peer = ?peer_addr,
            "new SSH client connection",
        );
        SshSession::new(Arc::clone(&self.router), self.username.clone(), peer_addr)
    }
}

// ---------------------------------------------------------------------------
// Server key loading
// ---------------------------------------------------------------------------

/// Load the SSH host key.  A keyring entry that cannot be read, or no
/// configured source at all, falls back to an ephemeral Ed25519 key; a
/// configured file that cannot be read is an error.
fn load_host_key(source: &SecretSource) -> Result<KeyPair> {
    if source.path.is_some() {
        return load_key_pair(source).context("failed to load SSH host key");
    }
    if source.is_empty() {
        warn!("no SSH host key configured; generating ephemeral Ed25519 key");
        return Ok(KeyPair::generate_ed25519());
    }
    match load_key_pair(source) {
        Ok(kp) => Ok(kp),
        Err(e) => {
            warn!(
                error = %e,
                "failed to load SSH host key from kernel keyring; generating ephemeral Ed25519 key",
            );
            Ok(KeyPair::generate_ed25519())
        }
    }
}

pub(crate) fn server_config(ssh: &SshConfig, host_key: KeyPair) -> server::Config {
    server::Config {
        server_id: SshId::Standard(ssh.server_version.clone()),
        keys: vec![host_key],
        methods: MethodSet::PUBLICKEY,
        preferred: russh::Preferred::DEFAULT,
        // Relaying has no idle timeout.
        inactivity_timeout: None,
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts: 6,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

/// Accept errors worth retrying rather than giving up on the listener.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || matches!(err.raw_os_error(), Some(EMFILE) | Some(ENFILE))
}

/// Run one connection's SSH server session to completion.
async fn serve_connection(
    config: Arc<server::Config>,
    stream: TcpStream,
    handler: SshSession,
    metrics: Arc<Metrics>,
) {
    let session = match server::run_stream(config, stream, handler).await {
        Ok(session) => session,
        Err(e) => {
            metrics.handshake_failures_total.inc();
            info!(error = %e, "SSH handshake failed");
            return;
        }
    };
    match session.await {
        Ok(()) => debug!("SSH connection closed"),
        Err(e) => {
            metrics.handshake_failures_total.inc();
            info!(error = %e, "SSH connection ended with error");
        }
    }
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Start the SSH listener.  Runs until a non-transient accept error occurs.
pub async fn start_ssh_server(state: Arc<AppState>) -> Result<()> {
    let ssh = &state.config.ssh;
    let listen_addr: SocketAddr = state.config.proxy.ssh_listen.parse().with_context(|| {
        format!(
            "invalid SSH listen address: {:?}",
            state.config.proxy.ssh_listen
        )
    })?;

    // -- Build russh server config ----------------------------------------

    let host_key = load_host_key(&ssh.host_key)?;
    let config = Arc::new(server_config(ssh, host_key));

    // -- Start serving ----------------------------------------------------

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind SSH listener on {listen_addr}"))?;
    state.ssh_ready.store(true, Ordering::Release);
    info!(address = %listen_addr, "starting SSH server");

    let mut ssh_server = SshServer::new(Arc::clone(&state.router), ssh.username.clone());
    let retry_delay = ssh.accept_retry_delay();

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) if is_transient(&e) => {
                warn!(error = %e, retry_in = ?retry_delay, "transient accept error");
                tokio::time::sleep(retry_delay).await;
                continue;
            }
            Err(e) => {
                state.ssh_ready.store(false, Ordering::Release);
                return Err(e).context("SSH listener failed");
            }
        };

        state.metrics.metrics.connections_total.inc();
        let _ = stream.set_nodelay(true);
        let handler = ssh_server.new_client(Some(peer));
        let span = info_span!("connection", peer = %peer);
        tokio::spawn(
            serve_connection(
                Arc::clone(&config),
                stream,
                handler,
                Arc::clone(&state.metrics.metrics),
            )
            .instrument(span),
        );
    }
}
