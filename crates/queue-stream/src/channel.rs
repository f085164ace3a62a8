//! Connection state and the channel manager.
//!
//! The manager owns the physical connection. Engines never cache the handle
//! across a reconnection; they call [`ChannelManager::current`] and carry the
//! returned [`ConnectionEpoch`] so concurrent recreation requests for the same
//! failure collapse into a single rebuild.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::{sync::Mutex as AsyncMutex, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    config::ClientConfig,
    error::{QueueError, QueueResult},
    transport::{Connection, Connector, ServerInfo},
    types::ConnectionEpoch,
};

/// Link status states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    /// Accepting new work.
    Connected,
    /// Transport failed; a reconnection may bring it back.
    Disconnected,
    /// Transport failed and auto-reconnect is disabled.
    Failed,
    /// Closed by the application.
    Closed,
}

/// Mutex-guarded link status shared between callers and background loops.
#[derive(Debug)]
pub struct ConnectionState {
    status: Mutex<LinkStatus>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new(LinkStatus::Disconnected)
    }
}

impl ConnectionState {
    pub fn new(status: LinkStatus) -> Self {
        Self {
            status: Mutex::new(status),
        }
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == LinkStatus::Connected
    }

    /// `Failed` and `Closed` are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status(), LinkStatus::Failed | LinkStatus::Closed)
    }

    /// Move to `Connected` unless the state is terminal.
    pub fn set_connected(&self) -> bool {
        let mut status = self.status.lock();
        match *status {
            LinkStatus::Failed | LinkStatus::Closed => false,
            _ => {
                *status = LinkStatus::Connected;
                true
            }
        }
    }

    /// Move `Connected` to `Disconnected`. Returns `true` on transition.
    pub fn set_disconnected(&self) -> bool {
        let mut status = self.status.lock();
        if *status == LinkStatus::Connected {
            *status = LinkStatus::Disconnected;
            true
        } else {
            false
        }
    }

    /// Permanent failure, unless already closed.
    pub fn set_failed(&self) {
        let mut status = self.status.lock();
        if *status != LinkStatus::Closed {
            *status = LinkStatus::Failed;
        }
    }

    pub fn set_closed(&self) {
        *self.status.lock() = LinkStatus::Closed;
    }

    /// The error a caller gets when the link is not accepting work.
    pub fn check(&self) -> QueueResult<()> {
        match self.status() {
            LinkStatus::Connected => Ok(()),
            LinkStatus::Disconnected => Err(QueueError::not_connected(
                "stream is reconnecting and not accepting new requests",
            )),
            LinkStatus::Failed => Err(QueueError::permanent(
                "connection lost and auto-reconnect is disabled",
            )),
            LinkStatus::Closed => Err(QueueError::connection_closed(Some(
                "client closed".to_string(),
            ))),
        }
    }
}

struct Current {
    epoch: ConnectionEpoch,
    connection: Option<Arc<dyn Connection>>,
}

/// Owns connection construction, probing and recreation.
pub struct ChannelManager {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    current: AsyncMutex<Current>,
    state: ConnectionState,
}

impl ChannelManager {
    /// Build the first connection and ping it.
    pub async fn connect(
        config: Arc<ClientConfig>,
        connector: Arc<dyn Connector>,
    ) -> QueueResult<Arc<Self>> {
        let connection = build_and_ping(&config, connector.as_ref()).await?;
        info!(address = %config.address, client_id = %config.client_id, "Connected to broker");

        Ok(Arc::new(Self {
            config,
            connector,
            current: AsyncMutex::new(Current {
                epoch: ConnectionEpoch(1),
                connection: Some(connection),
            }),
            state: ConnectionState::new(LinkStatus::Connected),
        }))
    }

    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Current connection and its epoch.
    pub async fn current(&self) -> QueueResult<(ConnectionEpoch, Arc<dyn Connection>)> {
        self.state.check()?;
        let current = self.current.lock().await;
        match &current.connection {
            Some(connection) => Ok((current.epoch, Arc::clone(connection))),
            None => Err(QueueError::not_connected("no active connection")),
        }
    }

    /// Ping the current connection.
    pub async fn ping(&self) -> QueueResult<ServerInfo> {
        let (_, connection) = self.current().await?;
        timeout(self.config.connect_timeout, connection.ping())
            .await
            .map_err(|_| QueueError::timeout(self.config.connect_timeout))?
    }

    /// Replace the connection observed at `seen` with a freshly pinged one.
    ///
    /// Returns the existing connection when another caller already rebuilt
    /// past `seen`. Fails with [`QueueError::Permanent`] when auto-reconnect
    /// is disabled.
    pub async fn recreate_channel(
        &self,
        seen: ConnectionEpoch,
    ) -> QueueResult<(ConnectionEpoch, Arc<dyn Connection>)> {
        if self.config.disable_auto_reconnect {
            self.state.set_failed();
            warn!("Auto-reconnect disabled; giving up on the connection");
            return Err(QueueError::permanent(
                "connection lost and auto-reconnect is disabled",
            ));
        }

        let mut current = self.current.lock().await;
        self.state.check_not_terminal()?;

        if current.epoch > seen
            && let Some(connection) = &current.connection
        {
            debug!(epoch = %current.epoch, "Connection already recreated");
            return Ok((current.epoch, Arc::clone(connection)));
        }

        self.state.set_disconnected();
        if let Some(stale) = current.connection.take() {
            stale.close().await;
        }

        tokio::time::sleep(self.config.reconnect_interval).await;
        self.state.check_not_terminal()?;

        let connection = build_and_ping(&self.config, self.connector.as_ref()).await?;
        current.epoch = ConnectionEpoch(current.epoch.0 + 1);
        current.connection = Some(Arc::clone(&connection));
        self.state.set_connected();
        info!(epoch = %current.epoch, "Connection recreated");

        Ok((current.epoch, connection))
    }

    /// Close the connection; later calls fail with `ConnectionClosed`.
    pub async fn close(&self) {
        self.state.set_closed();
        let mut current = self.current.lock().await;
        if let Some(connection) = current.connection.take() {
            connection.close().await;
        }
    }
}

impl ConnectionState {
    fn check_not_terminal(&self) -> QueueResult<()> {
        if self.is_terminal() {
            self.check()
        } else {
            Ok(())
        }
    }
}

async fn build_and_ping(
    config: &ClientConfig,
    connector: &dyn Connector,
) -> QueueResult<Arc<dyn Connection>> {
    let connection = timeout(config.connect_timeout, connector.connect(config))
        .await
        .map_err(|_| QueueError::timeout(config.connect_timeout))??;

    match timeout(config.connect_timeout, connection.ping()).await {
        Ok(Ok(info)) => {
            debug!(host = %info.host, version = %info.version, "Liveness ping succeeded");
            Ok(connection)
        }
        Ok(Err(e)) => {
            connection.close().await;
            Err(e)
        }
        Err(_) => {
            connection.close().await;
            Err(QueueError::timeout(config.connect_timeout))
        }
    }
}
