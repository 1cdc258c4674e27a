//! Per-channel routing state machine.
//!
//! ```text
//! AwaitingEnv ──▶ RouteResolution ──▶ Connecting ──▶ Relaying ──▶ Closed
//!      │                 │                 │
//!      └─────────────────┴─────────────────┴──────────────────────▶ Closed
//! ```
//!
//! A channel starts out waiting for the client to name its project through
//! an `env` request.  Every request seen until then is buffered, and is
//! replayed in order on the upstream channel once one is open.
//!
//! A client cannot send its next request before the current one has been
//! answered, so buffered requests are acknowledged as they arrive.  Only the
//! request that ends the wait is answered with the backend's verdict.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::channel::{
    ChannelOpen, ChannelSink, ChannelSource, Chunk, Reply, Request, RequestFrame,
};
use super::relay::{relay, Side};
use super::upstream::{Connector, Upstream};
use crate::error::ChannelError;
use crate::metrics::{ChannelOutcome, Metrics};
use crate::route::{ResolveError, Resolver, Route};
use crate::wire::decode_env_payload;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Shared, immutable dependencies of every channel's state machine.
pub struct Router {
    resolver: Arc<dyn Resolver>,
    connector: Arc<dyn Connector>,
    routing_env_var: String,
    env_timeout: Duration,
    metrics: Arc<Metrics>,
}

/// How a phase ended when it moved to [`Phase::Closed`].
type End = Result<ChannelOutcome, ChannelError>;

enum Phase {
    AwaitingEnv,
    RouteResolution { project: Option<String> },
    Connecting(Route),
    Relaying { route: Route, upstream: Upstream },
    Closed(End),
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Self::AwaitingEnv => "awaiting_env",
            Self::RouteResolution { .. } => "route_resolution",
            Self::Connecting(_) => "connecting",
            Self::Relaying { .. } => "relaying",
            Self::Closed(_) => "closed",
        }
    }
}

impl Router {
    pub fn new(
        resolver: Arc<dyn Resolver>,
        connector: Arc<dyn Connector>,
        routing_env_var: impl Into<String>,
        env_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            resolver,
            connector,
            routing_env_var: routing_env_var.into(),
            env_timeout,
            metrics,
        }
    }

    /// Drive one downstream channel from open to close.
    pub async fn run_channel(
        &self,
        open: ChannelOpen,
        downstream: Arc<dyn ChannelSink>,
        source: ChannelSource,
    ) -> ChannelOutcome {
        self.metrics.active_channels.inc();

        let ChannelSource { mut requests, data } = source;
        let mut pending: VecDeque<Request> = VecDeque::new();
        let mut project = None;
        let mut phase = Phase::AwaitingEnv;

        let end = loop {
            debug!(phase = phase.name(), "channel phase");
            phase = match phase {
                Phase::AwaitingEnv => self.await_env(&mut requests, &mut pending).await,
                Phase::RouteResolution { project: name } => {
                    project = name.clone();
                    self.resolve_route(name).await
                }
                Phase::Connecting(route) => self.connect(route, &open, &mut pending).await,
                Phase::Relaying { route, upstream } => {
                    info!(project = %route.project, "relaying");
                    let downstream_side = Side {
                        sink: Arc::clone(&downstream),
                        source: ChannelSource { requests, data },
                    };
                    let upstream_side = Side {
                        sink: upstream.sink,
                        source: upstream.source,
                    };
                    break relay(downstream_side, upstream_side)
                        .await
                        .map(|()| ChannelOutcome::Completed)
                        .map_err(ChannelError::Forwarding);
                }
                Phase::Closed(end) => break end,
            };
        };

        let outcome = self
            .close(&*downstream, project.as_deref(), end, pending)
            .await;

        self.metrics.record_channel(outcome);
        self.metrics.active_channels.dec();
        outcome
    }

    // -- AwaitingEnv ------------------------------------------------------

    async fn await_env(
        &self,
        requests: &mut tokio::sync::mpsc::UnboundedReceiver<Request>,
        pending: &mut VecDeque<Request>,
    ) -> Phase {
        let timer = tokio::time::sleep(self.env_timeout);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                next = requests.recv() => {
                    let Some(Request { frame, reply }) = next else {
                        return Phase::Closed(Ok(ChannelOutcome::PeerClosed));
                    };
                    if let Some(phase) = self.inspect(&frame) {
                        pending.push_back(Request::new(frame, reply));
                        return phase;
                    }
                    reply.send(true);
                    pending.push_back(Request::new(frame, Reply::none()));
                }
                _ = &mut timer => return Phase::Closed(Err(ChannelError::Phase1Timeout)),
            }
        }
    }

    /// Decide whether a buffered request ends the wait.
    fn inspect(&self, frame: &RequestFrame) -> Option<Phase> {
        match frame.kind.as_str() {
            "env" => match decode_env_payload(&frame.payload) {
                Ok((key, value)) if key == self.routing_env_var.as_bytes() => {
                    Some(Phase::RouteResolution {
                        project: Some(String::from_utf8_lossy(value).into_owned()),
                    })
                }
                Ok(_) => None,
                Err(e) => {
                    debug!(error = %e, "ignoring malformed env request");
                    None
                }
            },
            "shell" | "exec" => Some(Phase::RouteResolution { project: None }),
            _ => None,
        }
    }

    // -- RouteResolution --------------------------------------------------

    async fn resolve_route(&self, project: Option<String>) -> Phase {
        let project = match project {
            Some(p) if !p.is_empty() => p,
            _ => return Phase::Closed(Err(ChannelError::NoProjectSpecified)),
        };

        let start = Instant::now();
        let resolved = self.resolver.resolve(&project).await;
        self.metrics
            .resolve_duration_seconds
            .observe(start.elapsed().as_secs_f64());

        match resolved {
            Ok(address) => {
                info!(project = %project, address = %address, "route resolved");
                Phase::Connecting(Route { project, address })
            }
            Err(ResolveError::NotFound(_)) => {
                Phase::Closed(Err(ChannelError::ProjectNotFound(project)))
            }
            Err(ResolveError::Internal(cause)) => {
                Phase::Closed(Err(ChannelError::ResolverInternal { project, cause }))
            }
        }
    }

    // -- Connecting -------------------------------------------------------

    async fn connect(
        &self,
        route: Route,
        open: &ChannelOpen,
        pending: &mut VecDeque<Request>,
    ) -> Phase {
        let start = Instant::now();
        let connected = self.connector.connect(&route.address, open).await;
        self.metrics
            .upstream_connect_duration_seconds
            .observe(start.elapsed().as_secs_f64());

        let upstream = match connected {
            Ok(upstream) => upstream,
            Err(cause) => {
                return Phase::Closed(Err(ChannelError::Upstream {
                    project: route.project,
                    cause,
                }))
            }
        };

        // Replay in arrival order; each reply goes back to its requester.
        while let Some(Request { frame, reply }) = pending.pop_front() {
            let kind = frame.kind.clone();
            match upstream.sink.request(frame).await {
                Ok(ok) => reply.send(ok),
                Err(e) => {
                    let _ = upstream.sink.close().await;
                    return Phase::Closed(Err(ChannelError::Forwarding(
                        e.context(format!("replaying buffered {kind} request")),
                    )));
                }
            }
        }

        Phase::Relaying { route, upstream }
    }

    // -- Closed -----------------------------------------------------------

    /// Buffered requests still unanswered get their negative reply once the
    /// error message has been written.
    async fn close(
        &self,
        downstream: &dyn ChannelSink,
        project: Option<&str>,
        end: End,
        pending: VecDeque<Request>,
    ) -> ChannelOutcome {
        match end {
            Ok(outcome) => {
                info!(project = ?project, outcome = ?outcome, "channel closed");
                drop(pending);
                let _ = downstream.close().await;
                outcome
            }
            Err(err) => {
                warn!(project = ?project, error = %err, "channel failed");
                if let Some(message) = err.user_message() {
                    if let Err(e) = downstream.data(Chunk::stderr(message)).await {
                        debug!(error = %e, "could not deliver error message to client");
                    }
                }
                drop(pending);
                let _ = downstream.close().await;
                err.outcome()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::ssh::channel::{source_pair, SourceFeed};
    use crate::ssh::fake::{send_env, send_request, Event, FakeConnector, FakeResolver, RecordingSink};
    use crate::wire::encode_env_payload;

    const VAR: &str = "ROUTE_PROJECT";

    fn router(resolver: Arc<FakeResolver>, connector: Arc<FakeConnector>) -> Arc<Router> {
        Arc::new(Router::new(
            resolver,
            connector,
            VAR,
            Duration::from_secs(15),
            MetricsRegistry::new().metrics,
        ))
    }

    /// Start a channel's state machine; returns the client's feed, what the
    /// client sees, and the task.
    fn open_channel(
        router: &Arc<Router>,
    ) -> (SourceFeed, Arc<RecordingSink>, JoinHandle<ChannelOutcome>) {
        let (feed, source) = source_pair();
        let client = RecordingSink::new();
        let router = Arc::clone(router);
        let sink = client.clone();
        let task =
            tokio::spawn(async move { router.run_channel(ChannelOpen::session(), sink, source).await });
        (feed, client, task)
    }

    #[tokio::test]
    async fn shell_before_env_fails_without_lookup() {
        let resolver = FakeResolver::with_route("demo", "10.0.0.5:22");
        let connector = FakeConnector::unreachable();
        let router = router(resolver.clone(), connector.clone());
        let (feed, client, task) = open_channel(&router);

        let shell = send_request(&feed, "shell", true, Bytes::new()).unwrap();
        assert_eq!(task.await.unwrap(), ChannelOutcome::NoProject);

        assert!(resolver.calls().is_empty());
        assert!(connector.dials().is_empty());
        assert!(!shell.await.unwrap());
        assert!(client.stderr().contains("no project name passed"));
        assert_eq!(client.events().last(), Some(&Event::Close));
    }

    #[tokio::test]
    async fn empty_project_name_counts_as_missing() {
        let resolver = FakeResolver::with_route("demo", "10.0.0.5:22");
        let router = router(resolver.clone(), FakeConnector::unreachable());
        let (feed, _client, task) = open_channel(&router);

        send_env(&feed, VAR, "");
        assert_eq!(task.await.unwrap(), ChannelOutcome::NoProject);
        assert!(resolver.calls().is_empty());
    }

    #[tokio::test]
    async fn end_to_end_routes_by_env_and_hides_backend() {
        let resolver = FakeResolver::with_route("demo", "10.0.0.5:22");
        let backend = RecordingSink::new();
        let (connector, backend_feed) = FakeConnector::with_upstream(backend.clone());
        let router = router(resolver.clone(), connector.clone());
        let (feed, client, task) = open_channel(&router);

        let lang = send_env(&feed, "LANG", "C");
        let env = send_env(&feed, VAR, "demo");
        // Later env requests for the same variable do not re-route.
        let later = send_env(&feed, VAR, "other");
        let exec = send_request(&feed, "exec", true, Bytes::from_static(b"\0\0\0\x04true")).unwrap();

        assert!(lang.await.unwrap());
        assert!(env.await.unwrap());
        assert!(later.await.unwrap());
        assert!(exec.await.unwrap());
        assert_eq!(resolver.calls(), vec!["demo"]);
        let dials = connector.dials();
        assert_eq!(dials.len(), 1);
        assert_eq!(dials[0].0, "10.0.0.5:22");
        assert_eq!(dials[0].1, ChannelOpen::session());
        assert_eq!(backend.request_kinds(), vec!["env", "env", "env", "exec"]);
        match &backend.events()[1] {
            Event::Request(frame) => {
                assert_eq!(frame.payload, encode_env_payload(VAR.as_bytes(), b"demo"))
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Backend finishes the command and closes.
        backend_feed
            .data(Chunk::primary(Bytes::from_static(b"done\n")))
            .await;
        send_request(&backend_feed, "exit-status", false, Bytes::from_static(&[0, 0, 0, 0]));
        drop(backend_feed);
        client.wait_until(|ev| ev.contains(&Event::Close)).await;
        assert_eq!(client.stdout(), b"done\n");
        assert!(client.request_kinds().contains(&"exit-status".to_string()));

        // Client acknowledges the close.
        drop(feed);
        assert_eq!(task.await.unwrap(), ChannelOutcome::Completed);
        assert!(backend.closed());
        assert!(client.stderr().is_empty());
        for event in client.events() {
            if let Event::Data(chunk) = event {
                assert!(!String::from_utf8_lossy(&chunk.bytes).contains("10.0.0.5"));
            }
        }
    }

    #[tokio::test]
    async fn buffered_requests_replay_in_order_and_the_route_gets_the_verdict() {
        let resolver = FakeResolver::with_route("demo", "10.0.0.5:22");
        // The backend refuses LANG and the pty, and the routing env too.
        let backend = RecordingSink::answering(&[false, false, false]);
        let (connector, backend_feed) = FakeConnector::with_upstream(backend.clone());
        let router = router(resolver, connector);
        let (feed, _client, task) = open_channel(&router);

        let first = send_env(&feed, "LANG", "C");
        let pty = send_request(&feed, "pty-req", true, Bytes::from_static(b"opaque")).unwrap();
        send_request(&feed, "window-change", false, Bytes::new());
        let route = send_env(&feed, VAR, "demo");

        // Acknowledged while buffered; only the routing request waits.
        assert!(first.await.unwrap());
        assert!(pty.await.unwrap());
        assert!(!route.await.unwrap());
        let frames: Vec<(String, bool)> = backend
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Request(f) => Some((f.kind, f.want_reply)),
                _ => None,
            })
            .collect();
        assert_eq!(
            frames,
            vec![
                ("env".to_string(), true),
                ("pty-req".to_string(), true),
                ("window-change".to_string(), false),
                ("env".to_string(), true),
            ]
        );

        drop(backend_feed);
        drop(feed);
        assert_eq!(task.await.unwrap(), ChannelOutcome::Completed);
    }

    #[tokio::test]
    async fn buffered_requests_are_answered_before_the_route_arrives() {
        let resolver = FakeResolver::with_route("demo", "10.0.0.5:22");
        let router = router(resolver.clone(), FakeConnector::unreachable());
        let (feed, _client, task) = open_channel(&router);

        let pty = send_request(&feed, "pty-req", true, Bytes::new()).unwrap();
        let answer = tokio::time::timeout(Duration::from_secs(5), pty).await;
        assert!(answer.unwrap().unwrap());
        assert!(resolver.calls().is_empty());
        assert!(!task.is_finished());

        drop(feed);
        assert_eq!(task.await.unwrap(), ChannelOutcome::PeerClosed);
    }

    #[tokio::test]
    async fn unknown_project_is_reported_without_connecting() {
        let resolver = FakeResolver::with_route("demo", "10.0.0.5:22");
        let connector = FakeConnector::unreachable();
        let router = router(resolver.clone(), connector.clone());
        let (feed, client, task) = open_channel(&router);

        let env = send_env(&feed, VAR, "p");
        assert_eq!(task.await.unwrap(), ChannelOutcome::NotFound);

        assert_eq!(resolver.calls(), vec!["p"]);
        assert!(connector.dials().is_empty());
        assert!(!env.await.unwrap());
        assert!(client
            .stderr()
            .starts_with("couldn't find an appropriate target: "));
        assert!(client.stderr().contains("`p`"));
        assert!(client.stdout().is_empty());
        assert!(client.closed());
    }

    #[tokio::test]
    async fn resolver_failure_hides_the_cause() {
        let router = router(FakeResolver::broken(), FakeConnector::unreachable());
        let (feed, client, task) = open_channel(&router);

        send_env(&feed, VAR, "demo");
        assert_eq!(task.await.unwrap(), ChannelOutcome::ResolverError);
        assert!(client.stderr().contains("couldn't find an appropriate target"));
        assert!(!client.stderr().contains("api.internal"));
    }

    #[tokio::test]
    async fn dial_failure_names_project_but_not_address() {
        let resolver = FakeResolver::with_route("demo", "10.0.0.5:22");
        let router = router(resolver, FakeConnector::unreachable());
        let (feed, client, task) = open_channel(&router);

        let env = send_env(&feed, VAR, "demo");
        assert_eq!(task.await.unwrap(), ChannelOutcome::UpstreamError);
        assert!(!env.await.unwrap());
        assert_eq!(
            client.stderr(),
            "couldn't connect to server hosting project 'demo'\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out() {
        let router = router(
            FakeResolver::with_route("demo", "10.0.0.5:22"),
            FakeConnector::unreachable(),
        );
        let (feed, client, task) = open_channel(&router);

        let pty = send_request(&feed, "pty-req", true, Bytes::new()).unwrap();
        assert_eq!(task.await.unwrap(), ChannelOutcome::Timeout);
        assert!(pty.await.unwrap());
        assert_eq!(
            client.stderr(),
            "Took too long to get project environment variable\n"
        );
        assert!(client.closed());
    }

    #[tokio::test]
    async fn client_leaving_early_is_benign() {
        let resolver = FakeResolver::with_route("demo", "10.0.0.5:22");
        let router = router(resolver.clone(), FakeConnector::unreachable());
        let (feed, client, task) = open_channel(&router);

        drop(feed);
        assert_eq!(task.await.unwrap(), ChannelOutcome::PeerClosed);
        assert!(resolver.calls().is_empty());
        assert!(client.stderr().is_empty());
    }

    #[tokio::test]
    async fn malformed_env_is_ignored() {
        let resolver = FakeResolver::with_route("demo", "10.0.0.5:22");
        let router = router(resolver.clone(), FakeConnector::unreachable());
        let (feed, _client, task) = open_channel(&router);

        send_request(&feed, "env", false, Bytes::from_static(b"\0\0\0\x10ROUTE"));
        send_request(&feed, "shell", false, Bytes::new());
        assert_eq!(task.await.unwrap(), ChannelOutcome::NoProject);
        assert!(resolver.calls().is_empty());
    }
}
