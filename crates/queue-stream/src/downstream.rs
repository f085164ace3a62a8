//! Downstream receiver: poll messages and forward settlements.

use std::{
    collections::HashSet,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::{
    channel::LinkStatus,
    engine::{Exchange, StreamEngine},
    error::{QueueError, QueueResult},
    message::PollRequest,
    received::{ControlKind, ControlOp, PollResponse, Transaction, TransactionControl},
    transport::{Connection, Duplex},
    types::RequestId,
    wire::{
        DownstreamKind, DownstreamRequest, DownstreamResponse, WireMessage, seconds_to_duration,
        seconds_to_millis,
    },
};

/// The poll and settlement direction.
pub(crate) struct DownstreamExchange;

impl Exchange for DownstreamExchange {
    type Request = DownstreamRequest;
    type Response = DownstreamResponse;

    const NAME: &'static str = "downstream";

    fn open(
        connection: Arc<dyn Connection>,
    ) -> BoxFuture<'static, QueueResult<Duplex<DownstreamRequest, DownstreamResponse>>> {
        Box::pin(async move { connection.open_downstream().await })
    }
}

/// Polls messages over the shared downstream stream.
#[derive(Clone)]
pub struct DownstreamReceiver {
    engine: Arc<StreamEngine<DownstreamExchange>>,
}

impl DownstreamReceiver {
    pub(crate) fn new(engine: Arc<StreamEngine<DownstreamExchange>>) -> Self {
        Self { engine }
    }

    /// Requests awaiting a response on this stream.
    pub fn pending_count(&self) -> usize {
        self.engine.pending_count()
    }

    pub fn status(&self) -> LinkStatus {
        self.engine.status()
    }

    /// Poll a channel.
    ///
    /// Returns `Err` only when the request fails validation. Transport,
    /// timeout and broker failures are reported in [`PollResponse::error`].
    pub async fn poll(&self, request: PollRequest) -> QueueResult<PollResponse> {
        request.validate()?;

        let client_id = self.engine.config().client_id.clone();
        let request_id = RequestId::new();
        if let Err(e) = self.engine.check_accepting() {
            return Ok(PollResponse::failed(request_id.to_string(), client_id, e));
        }

        let envelope = DownstreamRequest {
            request_id: request_id.clone(),
            client_id: client_id.clone(),
            kind: DownstreamKind::Get,
            channel: request.channel.clone(),
            max_items: request.max_items,
            wait_timeout_ms: seconds_to_millis(request.wait_timeout_in_seconds),
            auto_ack: request.auto_ack,
            ref_transaction_id: None,
            sequence_range: Vec::new(),
            re_queue_channel: None,
        };
        debug!(%request_id, channel = %request.channel, max_items = request.max_items, "Polling");

        let wait = seconds_to_duration(request.wait_timeout_in_seconds)
            + self.engine.config().request_timeout;
        let response = match self.engine.execute(envelope, None, wait).await {
            Ok(response) => response,
            Err(e) => return Ok(PollResponse::failed(request_id.to_string(), client_id, e)),
        };
        if response.is_error {
            return Ok(PollResponse::failed(
                request_id.to_string(),
                client_id,
                QueueError::broker(response.error),
            ));
        }

        let DownstreamResponse {
            transaction_id,
            messages,
            active_offsets,
            transaction_complete,
            ..
        } = response;

        if messages.is_empty() {
            return Ok(PollResponse::delivered(
                request_id.to_string(),
                &client_id,
                None,
                Vec::new(),
                active_offsets,
                request.visibility_seconds,
                request.auto_ack,
            ));
        }

        let Some(sequences) = unique_sequences(&messages) else {
            warn!(
                %request_id,
                %transaction_id,
                "Poll response has missing or duplicate sequences"
            );
            return Ok(PollResponse::failed(
                request_id.to_string(),
                client_id,
                QueueError::broker("poll response has missing or duplicate message sequences"),
            ));
        };

        let completed = request.auto_ack || transaction_complete;
        let control: Arc<dyn TransactionControl> = Arc::new(EngineControl {
            engine: Arc::downgrade(&self.engine),
            client_id: client_id.clone(),
        });
        let transaction = Arc::new(Transaction::new(
            transaction_id,
            request.channel,
            control,
            sequences,
            completed,
        ));
        debug!(
            %request_id,
            transaction_id = %transaction.id(),
            count = messages.len(),
            "Poll delivered messages"
        );

        let visibility_seconds = if completed { 0 } else { request.visibility_seconds };
        Ok(PollResponse::delivered(
            request_id.to_string(),
            &client_id,
            Some(transaction),
            messages,
            active_offsets,
            visibility_seconds,
            request.auto_ack,
        ))
    }
}

/// Settlement capability handed to transactions.
///
/// Holds the engine weakly so outstanding messages do not keep the stream
/// alive after the client is gone.
struct EngineControl {
    engine: Weak<StreamEngine<DownstreamExchange>>,
    client_id: String,
}

#[async_trait]
impl TransactionControl for EngineControl {
    async fn submit(&self, op: ControlOp) -> QueueResult<()> {
        let engine = self.engine.upgrade().ok_or_else(|| {
            QueueError::connection_closed(Some("downstream receiver dropped".to_string()))
        })?;

        let request = control_request(&self.client_id, op);
        debug!(
            request_id = %request.request_id,
            transaction_id = ?request.ref_transaction_id,
            kind = ?request.kind,
            "Submitting settlement"
        );

        let wait = engine.config().request_timeout;
        let response = engine.execute(request, None, wait).await?;
        if response.is_error {
            return Err(QueueError::broker(response.error));
        }
        Ok(())
    }
}

/// Sequence of every message, or `None` if one is missing or repeated.
fn unique_sequences(messages: &[WireMessage]) -> Option<Vec<u64>> {
    let mut seen = HashSet::with_capacity(messages.len());
    messages
        .iter()
        .map(|m| {
            let sequence = m.attributes.as_ref()?.sequence;
            seen.insert(sequence).then_some(sequence)
        })
        .collect()
}

fn control_request(client_id: &str, op: ControlOp) -> DownstreamRequest {
    let (kind, sequence_range, re_queue_channel) = match op.kind {
        ControlKind::AckRange(sequences) => (DownstreamKind::AckRange, sequences, None),
        ControlKind::NAckRange(sequences) => (DownstreamKind::NAckRange, sequences, None),
        ControlKind::ReQueueRange { sequences, channel } => {
            (DownstreamKind::ReQueueRange, sequences, Some(channel))
        }
        ControlKind::AckAll => (DownstreamKind::AckAll, Vec::new(), None),
        ControlKind::NAckAll => (DownstreamKind::NAckAll, Vec::new(), None),
        ControlKind::ReQueueAll { channel } => {
            (DownstreamKind::ReQueueAll, Vec::new(), Some(channel))
        }
    };

    DownstreamRequest {
        request_id: RequestId::new(),
        client_id: client_id.to_string(),
        kind,
        channel: op.channel,
        max_items: 0,
        wait_timeout_ms: 0,
        auto_ack: false,
        ref_transaction_id: Some(op.transaction_id),
        sequence_range,
        re_queue_channel,
    }
}
