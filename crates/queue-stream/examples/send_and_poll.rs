//! Send and Poll Example
//!
//! Sends a few messages, polls them back with a visibility window and
//! settles them, all against an in-process broker.
//!
//! Run with: `cargo run -p queue-stream --example send_and_poll`

use std::sync::Arc;

use parking_lot::Mutex;
use queue_stream::{
    ClientConfig, MemoryBroker, PollRequest, QueueMessage, QueueResult, QueuesClient,
    wire::{
        DownstreamKind, DownstreamResponse, SendReceipt, UpstreamResponse, WireAttributes,
        WireMessage,
    },
};
use tracing::info;

/// Minimal broker: upstream appends, `Get` drains, settlements are accepted.
fn spawn_broker(broker: &MemoryBroker) {
    let queue: Arc<Mutex<Vec<WireMessage>>> = Arc::default();

    let upstream = broker.clone();
    let stored = Arc::clone(&queue);
    tokio::spawn(async move {
        while let Some(mut server) = upstream.accept_upstream().await {
            let stored = Arc::clone(&stored);
            tokio::spawn(async move {
                while let Some(request) = server.recv().await {
                    let mut queue = stored.lock();
                    let results = request
                        .messages
                        .iter()
                        .map(|m| SendReceipt {
                            message_id: m.id.clone(),
                            ..Default::default()
                        })
                        .collect();
                    queue.extend(request.messages);
                    server.respond(UpstreamResponse {
                        ref_request_id: request.request_id,
                        results,
                        is_error: false,
                        error: String::new(),
                    });
                }
            });
        }
    });

    let downstream = broker.clone();
    tokio::spawn(async move {
        while let Some(mut server) = downstream.accept_downstream().await {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                while let Some(request) = server.recv().await {
                    let response = if request.kind == DownstreamKind::Get {
                        let mut queue = queue.lock();
                        let take = (request.max_items as usize).min(queue.len());
                        let mut messages: Vec<WireMessage> = queue.drain(..take).collect();
                        for (i, message) in messages.iter_mut().enumerate() {
                            message.attributes = Some(WireAttributes {
                                sequence: i as u64 + 1,
                                receive_count: 1,
                                ..Default::default()
                            });
                        }
                        DownstreamResponse {
                            transaction_id: ulid::Ulid::new().to_string(),
                            messages,
                            ..DownstreamResponse::accepted(&request)
                        }
                    } else {
                        DownstreamResponse::accepted(&request)
                    };
                    server.respond(response);
                }
            });
        }
    });
}

#[tokio::main]
async fn main() -> QueueResult<()> {
    tracing_subscriber::fmt::init();

    let broker = MemoryBroker::new();
    spawn_broker(&broker);

    let config = ClientConfig::new("memory", "demo");
    let client = QueuesClient::connect(config, broker.connector()).await?;

    for i in 0..3 {
        let result = client
            .send(QueueMessage::new("demo.orders", format!("order #{i}")).tag("source", "example"))
            .await?;
        info!(id = %result.id, error = ?result.error, "Sent");
    }

    let response = client
        .poll(
            PollRequest::new("demo.orders")
                .max_items(10)
                .visibility_seconds(30),
        )
        .await?;
    info!(
        transaction_id = %response.transaction_id,
        count = response.messages.len(),
        "Polled"
    );

    if let Some(first) = response.messages.first() {
        first.extend_visibility_timer(30)?;
        first.ack().await?;
        info!(id = %first.id, "Acked first message");
    }
    if response.messages.len() > 1 {
        response.re_queue_all("demo.orders.retry").await?;
        info!("Re-queued the rest");
    }

    client.close().await;
    Ok(())
}
