//! Transport seam between the engine and the physical connection.
//!
//! A [`Connector`] builds a [`Connection`]; a connection answers liveness
//! pings and opens one [`Duplex`] per logical stream. The engine never
//! touches sockets directly, so any framing (TCP, in-process channels, a
//! tunnelled RPC stream) can sit behind these traits.

use std::{fmt, pin::Pin, sync::Arc};

use async_trait::async_trait;
use futures_util::{Sink, Stream};
use serde::{Deserialize, Serialize};

use crate::{
    config::ClientConfig,
    error::QueueResult,
    wire::{DownstreamRequest, DownstreamResponse, UpstreamRequest, UpstreamResponse},
};

pub mod memory;
pub mod tcp;

pub use memory::{MemoryBroker, MemoryConnector, ServerStream};
pub use tcp::TcpConnector;

/// Outbound half of a logical stream.
pub type FrameSink<T> = Pin<Box<dyn Sink<T, Error = crate::error::QueueError> + Send>>;

/// Inbound half of a logical stream.
pub type FrameStream<T> = Pin<Box<dyn Stream<Item = QueueResult<T>> + Send>>;

/// Both halves of one bidirectional stream.
pub struct Duplex<Out, In> {
    pub sink: FrameSink<Out>,
    pub stream: FrameStream<In>,
}

impl<Out, In> Duplex<Out, In> {
    pub fn new(sink: FrameSink<Out>, stream: FrameStream<In>) -> Self {
        Self { sink, stream }
    }
}

impl<Out, In> fmt::Debug for Duplex<Out, In> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Duplex").finish_non_exhaustive()
    }
}

/// Liveness ping reply.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub host: String,
    pub version: String,
    pub server_start_time: u64,
    pub server_up_time_seconds: u64,
}

/// Builds physical connections with the configured address and credentials.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, config: &ClientConfig) -> QueueResult<Arc<dyn Connection>>;
}

/// A live connection to the broker.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Lightweight liveness call.
    async fn ping(&self) -> QueueResult<ServerInfo>;

    /// Open the stream that carries send requests.
    async fn open_upstream(&self) -> QueueResult<Duplex<UpstreamRequest, UpstreamResponse>>;

    /// Open the stream that carries poll and settlement requests.
    async fn open_downstream(&self) -> QueueResult<Duplex<DownstreamRequest, DownstreamResponse>>;

    /// Release the connection. Streams already opened may keep running until
    /// their peers notice.
    async fn close(&self) {}
}
