//! User-facing queue client.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    channel::{ChannelManager, LinkStatus},
    config::ClientConfig,
    downstream::{DownstreamExchange, DownstreamReceiver},
    engine::StreamEngine,
    error::{QueueError, QueueResult},
    message::{PollRequest, QueueMessage, SendResult},
    received::PollResponse,
    transport::{Connector, ServerInfo, TcpConnector},
    upstream::{UpstreamExchange, UpstreamSender},
};

/// Queue client owning one connection and one stream per direction.
///
/// Sends and polls from any number of tasks are multiplexed onto the two
/// streams. Dropping the client stops both streams; outstanding calls fail
/// with [`QueueError::ConnectionClosed`].
///
/// # Example
///
/// ```rust,no_run
/// use queue_stream::{ClientConfig, PollRequest, QueueMessage, QueuesClient};
///
/// # async fn run() -> queue_stream::QueueResult<()> {
/// let client = QueuesClient::connect_tcp(ClientConfig::new("127.0.0.1:50000", "worker-1")).await?;
///
/// let sent = client.send(QueueMessage::new("orders", "payload")).await?;
/// assert!(!sent.is_error());
///
/// let polled = client.poll(PollRequest::new("orders").max_items(10)).await?;
/// for message in &polled.messages {
///     message.ack().await?;
/// }
/// client.close().await;
/// # Ok(())
/// # }
/// ```
pub struct QueuesClient {
    config: Arc<ClientConfig>,
    manager: Arc<ChannelManager>,
    sender: UpstreamSender,
    receiver: DownstreamReceiver,
    shutdown: CancellationToken,
}

impl QueuesClient {
    /// Validate `config`, connect through `connector` and open both streams.
    pub async fn connect(config: ClientConfig, connector: impl Connector) -> QueueResult<Self> {
        config.validate().map_err(QueueError::config)?;
        let config = Arc::new(config);

        let manager = ChannelManager::connect(Arc::clone(&config), Arc::new(connector)).await?;
        let shutdown = CancellationToken::new();

        let engines = async {
            let upstream = StreamEngine::<UpstreamExchange>::start(
                Arc::clone(&manager),
                shutdown.child_token(),
            )
            .await?;
            let downstream = StreamEngine::<DownstreamExchange>::start(
                Arc::clone(&manager),
                shutdown.child_token(),
            )
            .await?;
            Ok::<_, QueueError>((upstream, downstream))
        };
        let (upstream, downstream) = match engines.await {
            Ok(engines) => engines,
            Err(e) => {
                shutdown.cancel();
                manager.close().await;
                return Err(e);
            }
        };

        info!(client_id = %config.client_id, address = %config.address, "Queue client ready");
        Ok(Self {
            config,
            manager,
            sender: UpstreamSender::new(upstream),
            receiver: DownstreamReceiver::new(downstream),
            shutdown,
        })
    }

    /// Connect over the framed TCP transport.
    pub async fn connect_tcp(config: ClientConfig) -> QueueResult<Self> {
        Self::connect(config, TcpConnector).await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Status of the underlying connection.
    pub fn status(&self) -> LinkStatus {
        self.manager.state().status()
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    /// Liveness ping.
    pub async fn ping(&self) -> QueueResult<ServerInfo> {
        self.manager.ping().await
    }

    pub async fn send(&self, message: QueueMessage) -> QueueResult<SendResult> {
        self.sender.send(message).await
    }

    pub async fn send_batch(&self, messages: Vec<QueueMessage>) -> QueueResult<Vec<SendResult>> {
        self.sender.send_batch(messages).await
    }

    pub async fn poll(&self, request: PollRequest) -> QueueResult<PollResponse> {
        self.receiver.poll(request).await
    }

    /// Cloneable handle for sending from other tasks.
    pub fn sender(&self) -> UpstreamSender {
        self.sender.clone()
    }

    /// Cloneable handle for polling from other tasks.
    pub fn receiver(&self) -> DownstreamReceiver {
        self.receiver.clone()
    }

    /// Stop both streams and close the connection.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.manager.close().await;
        info!(client_id = %self.config.client_id, "Queue client closed");
    }
}

impl Drop for QueuesClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
