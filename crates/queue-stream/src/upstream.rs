//! Upstream sender: enqueue messages on the broker.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::debug;

use crate::{
    channel::LinkStatus,
    engine::{Exchange, StreamEngine},
    error::{QueueError, QueueResult},
    message::{QueueMessage, SendResult},
    transport::{Connection, Duplex},
    types::RequestId,
    wire::{UpstreamRequest, UpstreamResponse},
};

/// The send direction.
pub(crate) struct UpstreamExchange;

impl Exchange for UpstreamExchange {
    type Request = UpstreamRequest;
    type Response = UpstreamResponse;

    const NAME: &'static str = "upstream";

    fn open(
        connection: Arc<dyn Connection>,
    ) -> BoxFuture<'static, QueueResult<Duplex<UpstreamRequest, UpstreamResponse>>> {
        Box::pin(async move { connection.open_upstream().await })
    }
}

/// Sends messages over the shared upstream stream.
///
/// Cloning is cheap; every clone multiplexes onto the same stream.
#[derive(Clone)]
pub struct UpstreamSender {
    engine: Arc<StreamEngine<UpstreamExchange>>,
}

impl UpstreamSender {
    pub(crate) fn new(engine: Arc<StreamEngine<UpstreamExchange>>) -> Self {
        Self { engine }
    }

    /// Requests awaiting a response on this stream.
    pub fn pending_count(&self) -> usize {
        self.engine.pending_count()
    }

    pub fn status(&self) -> LinkStatus {
        self.engine.status()
    }

    /// Send one message.
    ///
    /// Returns `Err` only when the message fails validation. Every other
    /// failure is reported in the [`SendResult`], tagged with the message id.
    pub async fn send(&self, mut message: QueueMessage) -> QueueResult<SendResult> {
        message.validate()?;
        let id = message.ensure_id();

        if let Err(e) = self.engine.check_accepting() {
            return Ok(SendResult::failed(id, e));
        }

        let request = UpstreamRequest {
            request_id: RequestId::new(),
            messages: vec![message.to_wire(&self.engine.config().client_id)],
        };
        debug!(
            request_id = %request.request_id,
            message_id = %id,
            channel = %message.channel,
            "Sending message"
        );

        let wait = self.engine.config().request_timeout;
        let result = match self.engine.execute(request, Some(id.clone()), wait).await {
            Ok(response) => receipt_for(&id, &response),
            Err(e) => SendResult::failed(id, e),
        };
        Ok(result)
    }

    /// Send several messages in one envelope.
    ///
    /// Results come back in input order, one per message id.
    pub async fn send_batch(&self, messages: Vec<QueueMessage>) -> QueueResult<Vec<SendResult>> {
        if messages.is_empty() {
            return Err(QueueError::validation("batch must contain at least one message"));
        }
        for message in &messages {
            message.validate()?;
        }

        let mut messages = messages;
        let ids: Vec<String> = messages.iter_mut().map(QueueMessage::ensure_id).collect();

        if let Err(e) = self.engine.check_accepting() {
            return Ok(ids.into_iter().map(|id| SendResult::failed(id, e.clone())).collect());
        }

        let client_id = &self.engine.config().client_id;
        let request = UpstreamRequest {
            request_id: RequestId::new(),
            messages: messages.iter().map(|m| m.to_wire(client_id)).collect(),
        };
        debug!(request_id = %request.request_id, count = ids.len(), "Sending batch");

        let wait = self.engine.config().request_timeout;
        let results = match self.engine.execute(request, Some(ids.join(",")), wait).await {
            Ok(response) => ids.iter().map(|id| receipt_for(id, &response)).collect(),
            Err(e) => ids
                .into_iter()
                .map(|id| {
                    let error = for_message(&e, &id);
                    SendResult::failed(id, error)
                })
                .collect(),
        };
        Ok(results)
    }
}

fn receipt_for(id: &str, response: &UpstreamResponse) -> SendResult {
    if response.is_error {
        return SendResult::failed(id.to_string(), QueueError::broker(response.error.clone()));
    }
    match response.results.iter().find(|r| r.message_id == id) {
        Some(receipt) => SendResult::from_receipt(id.to_string(), receipt),
        None => SendResult::failed(
            id.to_string(),
            QueueError::broker(format!("no send result for message {id}")),
        ),
    }
}

/// Re-tag a batch-wide failure with one message's id.
fn for_message(error: &QueueError, id: &str) -> QueueError {
    match error {
        QueueError::ConnectionLost { reason, .. } => {
            QueueError::connection_lost(id, reason.clone())
        }
        QueueError::RequestTimeout { duration, .. } => QueueError::request_timeout(*duration, id),
        other => other.clone(),
    }
}
