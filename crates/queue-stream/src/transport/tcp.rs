//! Length-delimited JSON frames over TCP.
//!
//! Every logical stream (ping, upstream, downstream) is its own TCP
//! connection. The first frame is a [`Handshake`]; every later frame is one
//! JSON envelope.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt, future};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{net::TcpStream, time::timeout};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use super::{Connection, Connector, Duplex, ServerInfo};
use crate::{
    config::ClientConfig,
    error::{QueueError, QueueResult},
    wire::{
        DownstreamRequest, DownstreamResponse, Handshake, StreamKind, UpstreamRequest,
        UpstreamResponse,
    },
};

/// Connector for brokers speaking the framed TCP protocol.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, config: &ClientConfig) -> QueueResult<Arc<dyn Connection>> {
        Ok(Arc::new(TcpConnection {
            address: config.address.clone(),
            client_id: config.client_id.clone(),
            auth_token: config.auth_token.clone(),
            connect_timeout: config.connect_timeout,
            max_frame_size: config.max_frame_size,
        }))
    }
}

struct TcpConnection {
    address: String,
    client_id: String,
    auth_token: Option<String>,
    connect_timeout: Duration,
    max_frame_size: usize,
}

type FramedTcp = Framed<TcpStream, LengthDelimitedCodec>;

impl TcpConnection {
    async fn open(&self, stream: StreamKind) -> QueueResult<FramedTcp> {
        debug!(address = %self.address, ?stream, "Opening TCP stream");
        let socket = timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| QueueError::timeout(self.connect_timeout))??;
        socket.set_nodelay(true)?;

        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(self.max_frame_size)
            .new_codec();
        let mut framed = Framed::new(socket, codec);

        let handshake = Handshake {
            stream,
            client_id: self.client_id.clone(),
            auth_token: self.auth_token.clone(),
        };
        framed.send(encode(&handshake)?).await?;
        Ok(framed)
    }

    async fn open_duplex<Out, In>(&self, kind: StreamKind) -> QueueResult<Duplex<Out, In>>
    where
        Out: Serialize + Send + 'static,
        In: DeserializeOwned + Send + 'static,
    {
        let (sink, stream) = self.open(kind).await?.split::<Bytes>();

        let sink = sink
            .sink_map_err(QueueError::from)
            .with(|frame: Out| future::ready(encode(&frame)));
        let stream = stream.map(|frame| decode::<In>(&frame?));

        Ok(Duplex::new(Box::pin(sink), Box::pin(stream)))
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn ping(&self) -> QueueResult<ServerInfo> {
        let mut framed = self.open(StreamKind::Ping).await?;
        let frame = timeout(self.connect_timeout, framed.next())
            .await
            .map_err(|_| QueueError::timeout(self.connect_timeout))?
            .ok_or_else(|| QueueError::connection_closed(Some("ping stream ended".into())))??;
        decode(&frame)
    }

    async fn open_upstream(&self) -> QueueResult<Duplex<UpstreamRequest, UpstreamResponse>> {
        self.open_duplex(StreamKind::Upstream).await
    }

    async fn open_downstream(&self) -> QueueResult<Duplex<DownstreamRequest, DownstreamResponse>> {
        self.open_duplex(StreamKind::Downstream).await
    }
}

fn encode<T: Serialize>(frame: &T) -> QueueResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(frame)?))
}

fn decode<T: DeserializeOwned>(frame: &[u8]) -> QueueResult<T> {
    Ok(serde_json::from_slice(frame)?)
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn serve_ping_once(info: ServerInfo) -> std::io::Result<String> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        tokio::spawn(async move {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
            let Some(Ok(frame)) = framed.next().await else {
                return;
            };
            let Ok(handshake) = decode::<Handshake>(&frame) else {
                return;
            };
            if handshake.stream == StreamKind::Ping
                && let Ok(reply) = encode(&info)
            {
                let _ = framed.send(reply).await;
            }
        });

        Ok(addr.to_string())
    }

    #[tokio::test]
    async fn ping_returns_server_info() {
        let info = ServerInfo {
            host: "broker-1".to_string(),
            version: "2.0".to_string(),
            server_start_time: 1,
            server_up_time_seconds: 42,
        };
        let address = serve_ping_once(info.clone()).await.expect("server");
        let config = ClientConfig::new(address, "client-a");

        let connection = TcpConnector.connect(&config).await.expect("connect");
        let reply = connection.ping().await.expect("ping");
        assert_eq!(reply, info);
    }

    #[tokio::test]
    async fn ping_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let config = ClientConfig::new(address, "client-a");
        let connection = TcpConnector.connect(&config).await.expect("connect");
        let err = connection.ping().await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::Transport { .. } | QueueError::Timeout { .. }
        ));
    }
}
