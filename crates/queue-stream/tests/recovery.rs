//! Stream failure, reconnection and shutdown behavior.

mod support;

use std::time::Duration;

use queue_stream::{
    LinkStatus, PollRequest, QueueError, QueueMessage, QueuesClient,
    transport::{MemoryBroker, ServerStream},
    wire::{SendReceipt, UpstreamRequest, UpstreamResponse},
};
use support::config;

fn receipts(request: &UpstreamRequest) -> UpstreamResponse {
    UpstreamResponse {
        ref_request_id: request.request_id.clone(),
        results: request
            .messages
            .iter()
            .map(|m| SendReceipt {
                message_id: m.id.clone(),
                sent_at: 1,
                ..Default::default()
            })
            .collect(),
        is_error: false,
        error: String::new(),
    }
}

fn serve_receipts(mut server: ServerStream<UpstreamRequest, UpstreamResponse>) {
    tokio::spawn(async move {
        while let Some(request) = server.recv().await {
            server.respond(receipts(&request));
        }
    });
}

async fn wait_for_status(client: &QueuesClient, status: LinkStatus) {
    for _ in 0..200 {
        if client.sender().status() == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("sender never reached {status:?}");
}

#[tokio::test]
async fn transport_failure_fails_in_flight_send_with_its_id() {
    let broker = MemoryBroker::new();
    let client = QueuesClient::connect(config("worker"), broker.connector())
        .await
        .expect("connect");
    let mut server = broker.accept_upstream().await.expect("accept");

    let sender = client.sender();
    let in_flight = tokio::spawn(async move {
        sender
            .send(QueueMessage::new("orders", "body").id("m1"))
            .await
            .expect("valid message")
    });

    let request = server.recv().await.expect("request written");
    assert_eq!(request.messages[0].id, "m1");
    server.fail(QueueError::transport("connection reset by peer"));

    let result = in_flight.await.expect("join");
    assert_eq!(result.id, "m1");
    assert!(matches!(
        result.error,
        Some(QueueError::ConnectionLost { ref id, .. }) if id == "m1"
    ));
    assert_eq!(client.sender().pending_count(), 0);
}

#[tokio::test]
async fn sends_succeed_after_reconnect() {
    let broker = MemoryBroker::new();
    let client = QueuesClient::connect(config("worker"), broker.connector())
        .await
        .expect("connect");
    let server = broker.accept_upstream().await.expect("accept");
    assert_eq!(broker.connect_count(), 1);

    drop(server);
    let reopened = broker.accept_upstream().await.expect("stream reopened");
    serve_receipts(reopened);
    wait_for_status(&client, LinkStatus::Connected).await;

    let result = client
        .send(QueueMessage::new("orders", "body").id("m2"))
        .await
        .expect("valid message");
    assert_eq!(result.id, "m2");
    assert!(!result.is_error(), "unexpected error: {:?}", result.error);
    assert_eq!(broker.connect_count(), 2);
    assert!(client.is_connected());
}

#[tokio::test]
async fn sends_fail_fast_while_reconnecting() {
    let broker = MemoryBroker::new();
    let client = QueuesClient::connect(
        config("worker").reconnect_interval(Duration::from_millis(300)),
        broker.connector(),
    )
    .await
    .expect("connect");
    let server = broker.accept_upstream().await.expect("accept");
    let frames_before = broker.upstream_frames();

    drop(server);
    wait_for_status(&client, LinkStatus::Disconnected).await;

    let result = client
        .send(QueueMessage::new("orders", "body").id("m3"))
        .await
        .expect("valid message");
    assert_eq!(result.id, "m3");
    assert!(matches!(result.error, Some(QueueError::NotConnected { .. })));
    assert_eq!(broker.upstream_frames(), frames_before);
}

#[tokio::test]
async fn reconnect_retries_until_broker_returns() {
    let broker = MemoryBroker::new();
    let client = QueuesClient::connect(config("worker"), broker.connector())
        .await
        .expect("connect");
    let server = broker.accept_upstream().await.expect("accept");

    broker.set_reachable(false);
    drop(server);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(client.sender().status(), LinkStatus::Disconnected);

    broker.set_reachable(true);
    serve_receipts(broker.accept_upstream().await.expect("stream reopened"));
    wait_for_status(&client, LinkStatus::Connected).await;

    let result = client
        .send(QueueMessage::new("orders", "body"))
        .await
        .expect("valid message");
    assert!(!result.is_error(), "unexpected error: {:?}", result.error);
}

#[tokio::test]
async fn permanent_failure_when_auto_reconnect_disabled() {
    let broker = MemoryBroker::new();
    let client = QueuesClient::connect(
        config("worker").disable_auto_reconnect(true),
        broker.connector(),
    )
    .await
    .expect("connect");
    let server = broker.accept_upstream().await.expect("accept");

    drop(server);
    wait_for_status(&client, LinkStatus::Failed).await;
    assert_eq!(client.status(), LinkStatus::Failed);

    let result = client
        .send(QueueMessage::new("orders", "body").id("m4"))
        .await
        .expect("valid message");
    assert!(matches!(result.error, Some(QueueError::Permanent { .. })));

    let polled = client
        .poll(PollRequest::new("orders"))
        .await
        .expect("valid poll");
    assert!(polled.is_error());
    assert_eq!(broker.connect_count(), 1);
}

#[tokio::test]
async fn close_fails_outstanding_poll() {
    let broker = MemoryBroker::new();
    let client = QueuesClient::connect(config("worker"), broker.connector())
        .await
        .expect("connect");
    let mut downstream = broker.accept_downstream().await.expect("accept");

    let receiver = client.receiver();
    let poll = tokio::spawn(async move {
        receiver
            .poll(PollRequest::new("orders").wait_timeout_in_seconds(30))
            .await
            .expect("valid poll")
    });
    let _ = downstream.recv().await.expect("poll written");

    client.close().await;
    let response = poll.await.expect("join");
    assert!(matches!(
        response.error,
        Some(QueueError::ConnectionClosed { .. })
    ));
    assert_eq!(client.status(), LinkStatus::Closed);
}

#[tokio::test]
async fn dropping_client_stops_streams() {
    let broker = MemoryBroker::new();
    let client = QueuesClient::connect(config("worker"), broker.connector())
        .await
        .expect("connect");
    let mut upstream = broker.accept_upstream().await.expect("accept");
    let sender = client.sender();

    drop(client);
    // The writer drops its sink once the streams stop
    let ended = tokio::time::timeout(Duration::from_secs(1), upstream.recv()).await;
    assert!(matches!(ended, Ok(None)));

    let result = sender
        .send(QueueMessage::new("orders", "body"))
        .await
        .expect("valid message");
    assert!(matches!(result.error, Some(QueueError::ConnectionClosed { .. })));
}
