//! In-process transport.
//!
//! [`MemoryConnector`] hands the client one end of a channel pair per stream
//! and queues the other end ([`ServerStream`]) on a [`MemoryBroker`], where a
//! test or an embedded broker accepts it and plays the server role. The
//! broker handle also counts connects, pings and frames written so callers
//! can assert on network traffic.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use futures::channel::mpsc as frames;
use futures_util::{SinkExt, StreamExt, future};
use tokio::sync::{Mutex, mpsc};

use super::{Connection, Connector, Duplex, ServerInfo};
use crate::{
    config::ClientConfig,
    error::{QueueError, QueueResult},
    wire::{DownstreamRequest, DownstreamResponse, UpstreamRequest, UpstreamResponse},
};

/// Server side of one in-process stream.
pub struct ServerStream<Req, Resp> {
    requests: frames::UnboundedReceiver<Req>,
    responses: frames::UnboundedSender<QueueResult<Resp>>,
}

impl<Req, Resp> ServerStream<Req, Resp> {
    /// Next request written by the client, `None` once the client side is gone.
    pub async fn recv(&mut self) -> Option<Req> {
        self.requests.next().await
    }

    /// Deliver a response. Returns `false` if the client stopped reading.
    pub fn respond(&self, response: Resp) -> bool {
        self.responses.unbounded_send(Ok(response)).is_ok()
    }

    /// Surface a transport failure on the client's read side.
    pub fn fail(&self, error: QueueError) -> bool {
        self.responses.unbounded_send(Err(error)).is_ok()
    }
}

type UpstreamServer = ServerStream<UpstreamRequest, UpstreamResponse>;
type DownstreamServer = ServerStream<DownstreamRequest, DownstreamResponse>;

struct BrokerShared {
    reachable: AtomicBool,
    connects: AtomicUsize,
    pings: AtomicUsize,
    upstream_frames: Arc<AtomicUsize>,
    downstream_frames: Arc<AtomicUsize>,
    server_info: ServerInfo,
    upstream_tx: mpsc::UnboundedSender<UpstreamServer>,
    upstream_rx: Mutex<mpsc::UnboundedReceiver<UpstreamServer>>,
    downstream_tx: mpsc::UnboundedSender<DownstreamServer>,
    downstream_rx: Mutex<mpsc::UnboundedReceiver<DownstreamServer>>,
}

/// Broker-side handle of the in-process transport.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<BrokerShared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();
        let (downstream_tx, downstream_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(BrokerShared {
                reachable: AtomicBool::new(true),
                connects: AtomicUsize::new(0),
                pings: AtomicUsize::new(0),
                upstream_frames: Arc::new(AtomicUsize::new(0)),
                downstream_frames: Arc::new(AtomicUsize::new(0)),
                server_info: ServerInfo {
                    host: "memory".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    server_start_time: 0,
                    server_up_time_seconds: 0,
                },
                upstream_tx,
                upstream_rx: Mutex::new(upstream_rx),
                downstream_tx,
                downstream_rx: Mutex::new(downstream_rx),
            }),
        }
    }

    /// Connector that dials this broker.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Make connects, pings and stream opens fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.shared.reachable.load(Ordering::SeqCst)
    }

    /// Wait for the client to open its next upstream stream.
    pub async fn accept_upstream(&self) -> Option<UpstreamServer> {
        self.shared.upstream_rx.lock().await.recv().await
    }

    /// Wait for the client to open its next downstream stream.
    pub async fn accept_downstream(&self) -> Option<DownstreamServer> {
        self.shared.downstream_rx.lock().await.recv().await
    }

    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn ping_count(&self) -> usize {
        self.shared.pings.load(Ordering::SeqCst)
    }

    /// Frames the client has written on upstream streams.
    pub fn upstream_frames(&self) -> usize {
        self.shared.upstream_frames.load(Ordering::SeqCst)
    }

    /// Frames the client has written on downstream streams.
    pub fn downstream_frames(&self) -> usize {
        self.shared.downstream_frames.load(Ordering::SeqCst)
    }

    fn ensure_reachable(&self) -> QueueResult<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(QueueError::transport("memory broker unreachable"))
        }
    }
}

/// Connector for [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _config: &ClientConfig) -> QueueResult<Arc<dyn Connection>> {
        self.broker.ensure_reachable()?;
        self.broker.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn ping(&self) -> QueueResult<ServerInfo> {
        self.broker.ensure_reachable()?;
        self.broker.shared.pings.fetch_add(1, Ordering::SeqCst);
        Ok(self.broker.shared.server_info.clone())
    }

    async fn open_upstream(&self) -> QueueResult<Duplex<UpstreamRequest, UpstreamResponse>> {
        self.broker.ensure_reachable()?;
        let (duplex, server) = duplex_pair(Arc::clone(&self.broker.shared.upstream_frames));
        self.broker
            .shared
            .upstream_tx
            .send(server)
            .map_err(|_| QueueError::transport("memory broker dropped"))?;
        Ok(duplex)
    }

    async fn open_downstream(&self) -> QueueResult<Duplex<DownstreamRequest, DownstreamResponse>> {
        self.broker.ensure_reachable()?;
        let (duplex, server) = duplex_pair(Arc::clone(&self.broker.shared.downstream_frames));
        self.broker
            .shared
            .downstream_tx
            .send(server)
            .map_err(|_| QueueError::transport("memory broker dropped"))?;
        Ok(duplex)
    }
}

fn duplex_pair<Req, Resp>(
    written: Arc<AtomicUsize>,
) -> (Duplex<Req, Resp>, ServerStream<Req, Resp>)
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let (request_tx, request_rx) = frames::unbounded();
    let (response_tx, response_rx) = frames::unbounded();

    let sink = request_tx
        .sink_map_err(|e| QueueError::transport(e.to_string()))
        .with(move |request: Req| {
            written.fetch_add(1, Ordering::SeqCst);
            future::ready(Ok::<_, QueueError>(request))
        });

    let duplex = Duplex::new(Box::pin(sink), Box::pin(response_rx));
    let server = ServerStream {
        requests: request_rx,
        responses: response_tx,
    };
    (duplex, server)
}
