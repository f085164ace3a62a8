//! # Queue Stream
//!
//! Client-side streaming correlation and transaction engine for queue brokers.
//!
//! Many concurrent sends, polls and settlements are multiplexed onto one
//! long-lived bidirectional stream per direction. Each request is matched to
//! its response by correlation id, every delivered message tracks its own
//! settlement state, and a broken stream is recreated without the caller
//! having to reconnect.
//!
//! ## Features
//!
//! - **Correlation**: lock-free pending table, bounded waits, late responses discarded
//! - **Transactions**: ack / reject / re-queue per message, per range or per batch
//! - **Visibility timers**: extend or reset the window, automatic reject on expiry
//! - **Recovery**: pending requests fail with their own message id, then the
//!   connection is rebuilt with exponential backoff
//! - **Pluggable transport**: framed TCP by default, in-process for tests and embedding
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use queue_stream::{ClientConfig, PollRequest, QueueMessage, QueuesClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("127.0.0.1:50000", "worker-1")
//!         .request_timeout(std::time::Duration::from_secs(10));
//!     let client = QueuesClient::connect_tcp(config).await?;
//!
//!     client.send(QueueMessage::new("orders", "hello")).await?;
//!
//!     let response = client.poll(PollRequest::new("orders").max_items(10)).await?;
//!     response.ack_all().await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod downstream;
pub(crate) mod engine;
pub mod error;
pub mod message;
pub mod pending;
pub mod received;
pub(crate) mod reconnect;
pub mod transport;
pub mod types;
pub mod upstream;
pub mod wire;

// Re-export commonly used types
pub use channel::LinkStatus;
pub use client::QueuesClient;
pub use config::ClientConfig;
pub use downstream::DownstreamReceiver;
pub use error::{QueueError, QueueResult};
pub use message::{MessagePolicy, PollRequest, QueueMessage, SendResult};
pub use received::{
    ControlKind, ControlOp, MessageState, PollResponse, ReceivedMessage, Transaction,
    TransactionControl,
};
pub use transport::{
    Connection, Connector, MemoryBroker, MemoryConnector, ServerInfo, ServerStream, TcpConnector,
};
pub use types::{ConnectionEpoch, RequestId};
pub use upstream::UpstreamSender;
