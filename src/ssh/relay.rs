//! Steady-state relaying between the two ends of a proxied channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::channel::{ChannelSink, ChannelSource, Chunk, Request};

/// One end of a proxied channel.
pub struct Side {
    pub sink: Arc<dyn ChannelSink>,
    pub source: ChannelSource,
}

/// Set once a peer has closed its channel.  Writes towards it may fail from
/// then on without that being an error.
type Closed = Arc<AtomicBool>;

/// Relay data and requests between `downstream` and `upstream` until both
/// peers have closed their channel.
///
/// Each data direction is copied by its own task and ends by half-closing
/// its destination.  Requests are forwarded by two loops driven
/// concurrently, so a slow reply on one side never holds up the other.  A
/// failed write ends the relay with an error unless the peer written to has
/// already closed.  Both ends are closed before returning.
pub async fn relay(downstream: Side, upstream: Side) -> Result<()> {
    let Side {
        sink: down_sink,
        source: ChannelSource {
            requests: down_requests,
            data: down_data,
        },
    } = downstream;
    let Side {
        sink: up_sink,
        source: ChannelSource {
            requests: up_requests,
            data: up_data,
        },
    } = upstream;

    let down_closed = Closed::default();
    let up_closed = Closed::default();

    let (fail_tx, mut fail_rx) = mpsc::unbounded_channel();
    let down_pump = tokio::spawn(pump(
        "downstream->upstream",
        down_data,
        Arc::clone(&up_sink),
        Arc::clone(&up_closed),
        fail_tx.clone(),
    ));
    let up_pump = tokio::spawn(pump(
        "upstream->downstream",
        up_data,
        Arc::clone(&down_sink),
        Arc::clone(&down_closed),
        fail_tx,
    ));

    let forward = async {
        let (to_up, to_down) = tokio::join!(
            forward_requests(
                "upstream",
                down_requests,
                &up_sink,
                down_pump,
                &down_closed,
                &up_closed,
            ),
            forward_requests(
                "downstream",
                up_requests,
                &down_sink,
                up_pump,
                &up_closed,
                &down_closed,
            ),
        );
        to_up.and(to_down)
    };
    tokio::pin!(forward);

    let result = tokio::select! {
        res = &mut forward => res,
        Some(err) = fail_rx.recv() => Err(err),
    };

    let _ = down_sink.close().await;
    let _ = up_sink.close().await;
    result
}

/// Copy one data direction, then half-close the destination.
async fn pump(
    direction: &'static str,
    mut data: mpsc::Receiver<Chunk>,
    dst: Arc<dyn ChannelSink>,
    dst_closed: Closed,
    fail: mpsc::UnboundedSender<anyhow::Error>,
) {
    let failed = |e: anyhow::Error, doing: &str| {
        if dst_closed.load(Ordering::Acquire) {
            debug!(direction, error = %e, "{doing} a closed peer failed, ignoring");
        } else {
            let _ = fail.send(e.context(format!("{doing} {direction}")));
        }
    };

    while let Some(chunk) = data.recv().await {
        if let Err(e) = dst.data(chunk).await {
            failed(e, "relaying");
            return;
        }
    }
    if let Err(e) = dst.eof().await {
        failed(e, "half-closing");
    }
}

/// Forward every request from one peer to the other and relay the answers
/// back.  Once the source peer closes, waits for its data to drain and then
/// closes the destination so it can acknowledge.
async fn forward_requests(
    to: &'static str,
    mut requests: mpsc::UnboundedReceiver<Request>,
    dst: &Arc<dyn ChannelSink>,
    pump: JoinHandle<()>,
    src_closed: &AtomicBool,
    dst_closed: &AtomicBool,
) -> Result<()> {
    while let Some(Request { frame, reply }) = requests.recv().await {
        let kind = frame.kind.clone();
        match dst.request(frame).await {
            Ok(ok) => reply.send(ok),
            Err(e) if dst_closed.load(Ordering::Acquire) => {
                debug!(kind = %kind, to, error = %e, "request not forwarded to a closed peer");
                reply.send(false);
            }
            Err(e) => return Err(e).with_context(|| format!("forwarding {kind} request {to}")),
        }
    }

    src_closed.store(true, Ordering::Release);
    debug!(to, "peer closed its channel, draining");
    let _ = pump.await;
    if let Err(e) = dst.close().await {
        debug!(to, error = %e, "close failed");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::ssh::channel::{source_pair, SourceFeed};
    use crate::ssh::fake::{send_request, Event, RecordingSink};

    struct Harness {
        down_feed: SourceFeed,
        up_feed: SourceFeed,
        down: Arc<RecordingSink>,
        up: Arc<RecordingSink>,
        relay: JoinHandle<Result<()>>,
    }

    fn start(down: Arc<RecordingSink>, up: Arc<RecordingSink>) -> Harness {
        let (down_feed, down_source) = source_pair();
        let (up_feed, up_source) = source_pair();
        let relay = tokio::spawn(relay(
            Side {
                sink: down.clone(),
                source: down_source,
            },
            Side {
                sink: up.clone(),
                source: up_source,
            },
        ));
        Harness {
            down_feed,
            up_feed,
            down,
            up,
            relay,
        }
    }

    #[tokio::test]
    async fn downstream_eof_only_half_closes_upstream() {
        let mut h = start(RecordingSink::new(), RecordingSink::new());

        h.down_feed.data(Chunk::primary(Bytes::from_static(b"in"))).await;
        h.down_feed.eof();
        h.up_feed.data(Chunk::primary(Bytes::from_static(b"out1"))).await;

        h.up.wait_until(|ev| ev.contains(&Event::Eof)).await;
        assert_eq!(
            h.up.events(),
            vec![Event::Data(Chunk::primary(Bytes::from_static(b"in"))), Event::Eof]
        );

        // The other direction keeps flowing after the half-close.
        h.up_feed.data(Chunk::primary(Bytes::from_static(b"out2"))).await;
        h.down.wait_until(|_| h.down.stdout() == b"out1out2").await;
        assert!(!h.down.closed());
        assert!(!h.up.closed());

        drop(h.up_feed);
        drop(h.down_feed);
        h.relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stderr_is_relayed_as_extended_data() {
        let h = start(RecordingSink::new(), RecordingSink::new());
        h.up_feed.data(Chunk::stderr(Bytes::from_static(b"warning\n"))).await;
        h.down.wait_until(|_| h.down.stderr() == "warning\n").await;
        assert!(h.down.stdout().is_empty());
        drop(h.up_feed);
        drop(h.down_feed);
        h.relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn replies_go_back_to_the_asking_side() {
        let h = start(RecordingSink::new(), RecordingSink::answering(&[false, true]));

        let first = send_request(&h.down_feed, "subsystem", true, Bytes::new()).unwrap();
        send_request(&h.down_feed, "window-change", false, Bytes::new());
        let second = send_request(&h.down_feed, "exec", true, Bytes::new()).unwrap();
        assert!(!first.await.unwrap());
        assert!(second.await.unwrap());
        assert_eq!(h.up.request_kinds(), vec!["subsystem", "window-change", "exec"]);

        // Backend requests travel the other way.
        send_request(&h.up_feed, "exit-status", false, Bytes::from_static(&[0, 0, 0, 0]));
        h.down
            .wait_until(|ev| matches!(ev, [Event::Request(f)] if f.kind == "exit-status"))
            .await;

        drop(h.up_feed);
        drop(h.down_feed);
        h.relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn upstream_close_drains_then_closes_downstream() {
        let h = start(RecordingSink::new(), RecordingSink::new());

        h.up_feed.data(Chunk::primary(Bytes::from_static(b"tail"))).await;
        drop(h.up_feed);

        h.down.wait_until(|ev| ev.contains(&Event::Close)).await;
        assert_eq!(
            h.down.events(),
            vec![
                Event::Data(Chunk::primary(Bytes::from_static(b"tail"))),
                Event::Eof,
                Event::Close,
            ]
        );
        // Still relaying until the client acknowledges.
        assert!(!h.relay.is_finished());

        drop(h.down_feed);
        tokio::time::timeout(Duration::from_secs(5), h.relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(h.up.closed());
    }

    #[tokio::test]
    async fn data_write_failure_is_fatal() {
        let h = start(RecordingSink::new(), RecordingSink::broken());

        h.down_feed.data(Chunk::primary(Bytes::from_static(b"lost"))).await;
        let result = tokio::time::timeout(Duration::from_secs(5), h.relay)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
        assert!(h.down.closed());
        assert!(h.up.closed());
        drop(h.up_feed);
        drop(h.down_feed);
    }

    #[tokio::test]
    async fn write_failure_towards_an_open_peer_stays_fatal_after_the_other_closes() {
        let h = start(RecordingSink::new(), RecordingSink::broken());

        // The client leaves with data still queued for the backend, which
        // is still connected.
        h.down_feed
            .data(Chunk::primary(Bytes::from_static(b"lost")))
            .await;
        drop(h.down_feed);

        let result = tokio::time::timeout(Duration::from_secs(5), h.relay)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
        assert!(h.up.closed());
        drop(h.up_feed);
    }

    #[tokio::test]
    async fn write_failure_towards_a_closed_peer_is_ignored() {
        let h = start(RecordingSink::new(), RecordingSink::broken());

        // The backend closes first and the relay starts closing the client.
        drop(h.up_feed);
        h.down.wait_until(|ev| ev.contains(&Event::Close)).await;

        // Late client data can no longer reach the backend.
        h.down_feed
            .data(Chunk::primary(Bytes::from_static(b"late")))
            .await;
        drop(h.down_feed);

        let result = tokio::time::timeout(Duration::from_secs(5), h.relay)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok(), "{result:?}");
    }
}
