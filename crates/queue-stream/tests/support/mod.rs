//! Scripted in-memory queue broker for integration tests.

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use queue_stream::{
    ClientConfig, MemoryBroker, QueuesClient, ServerStream,
    wire::{
        DownstreamKind, DownstreamRequest, DownstreamResponse, SendReceipt, UpstreamRequest,
        UpstreamResponse, WireAttributes, WireMessage,
    },
};

#[derive(Default)]
struct Store {
    queues: HashMap<String, VecDeque<WireMessage>>,
    in_flight: HashMap<String, Vec<WireMessage>>,
    next_sequence: u64,
    next_transaction: u64,
    control_requests: Vec<DownstreamRequest>,
}

/// Memory broker with queue semantics on both streams.
#[derive(Clone)]
pub struct QueueBroker {
    pub broker: MemoryBroker,
    store: Arc<Mutex<Store>>,
}

impl QueueBroker {
    pub fn start() -> Self {
        let broker = MemoryBroker::new();
        let store = Arc::new(Mutex::new(Store::default()));

        let upstream = broker.clone();
        let upstream_store = Arc::clone(&store);
        tokio::spawn(async move {
            while let Some(server) = upstream.accept_upstream().await {
                tokio::spawn(serve_upstream(server, Arc::clone(&upstream_store)));
            }
        });

        let downstream = broker.clone();
        let downstream_store = Arc::clone(&store);
        tokio::spawn(async move {
            while let Some(server) = downstream.accept_downstream().await {
                tokio::spawn(serve_downstream(server, Arc::clone(&downstream_store)));
            }
        });

        Self { broker, store }
    }

    pub async fn client(&self, client_id: &str) -> QueuesClient {
        QueuesClient::connect(config(client_id), self.broker.connector())
            .await
            .expect("connect to memory broker")
    }

    pub fn depth(&self, channel: &str) -> usize {
        self.store
            .lock()
            .unwrap()
            .queues
            .get(channel)
            .map_or(0, VecDeque::len)
    }

    pub fn control_requests(&self) -> Vec<DownstreamRequest> {
        self.store.lock().unwrap().control_requests.clone()
    }
}

pub fn config(client_id: &str) -> ClientConfig {
    ClientConfig::new("memory", client_id)
        .request_timeout(Duration::from_secs(2))
        .reconnect_interval(Duration::from_millis(10))
        .reconnect_initial_delay(Duration::from_millis(10))
        .reconnect_max_delay(Duration::from_millis(50))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

async fn serve_upstream(
    mut server: ServerStream<UpstreamRequest, UpstreamResponse>,
    store: Arc<Mutex<Store>>,
) {
    while let Some(request) = server.recv().await {
        let results = {
            let mut store = store.lock().unwrap();
            request
                .messages
                .into_iter()
                .map(|message| {
                    let id = message.id.clone();
                    store.enqueue(message);
                    SendReceipt {
                        message_id: id,
                        sent_at: now_millis(),
                        ..Default::default()
                    }
                })
                .collect()
        };
        server.respond(UpstreamResponse {
            ref_request_id: request.request_id,
            results,
            is_error: false,
            error: String::new(),
        });
    }
}

async fn serve_downstream(
    mut server: ServerStream<DownstreamRequest, DownstreamResponse>,
    store: Arc<Mutex<Store>>,
) {
    while let Some(request) = server.recv().await {
        let response = store.lock().unwrap().handle(&request);
        server.respond(response);
    }
}

impl Store {
    fn enqueue(&mut self, mut message: WireMessage) {
        self.next_sequence += 1;
        let attributes = message.attributes.get_or_insert_with(WireAttributes::default);
        attributes.sequence = self.next_sequence;
        attributes.timestamp = now_millis();
        self.queues
            .entry(message.channel.clone())
            .or_default()
            .push_back(message);
    }

    fn redeliver(&mut self, mut message: WireMessage, channel: Option<&str>) {
        let attributes = message.attributes.get_or_insert_with(WireAttributes::default);
        attributes.receive_count += 1;
        if let Some(channel) = channel {
            attributes.re_routed = true;
            attributes.re_routed_from_queue = Some(message.channel.clone());
            message.channel = channel.to_string();
        }
        self.queues
            .entry(message.channel.clone())
            .or_default()
            .push_front(message);
    }

    fn handle(&mut self, request: &DownstreamRequest) -> DownstreamResponse {
        if request.kind == DownstreamKind::Get {
            return self.get(request);
        }

        self.control_requests.push(request.clone());
        let Some(transaction_id) = request.ref_transaction_id.clone() else {
            return DownstreamResponse::rejected(request, "missing transaction id");
        };
        let Some(mut messages) = self.in_flight.remove(&transaction_id) else {
            return DownstreamResponse::rejected(request, "unknown transaction");
        };

        let (settled, remaining): (Vec<_>, Vec<_>) = match request.kind {
            DownstreamKind::AckAll | DownstreamKind::NAckAll | DownstreamKind::ReQueueAll => {
                (std::mem::take(&mut messages), Vec::new())
            }
            _ => messages.into_iter().partition(|m| {
                let sequence = m.attributes.as_ref().map_or(0, |a| a.sequence);
                request.sequence_range.contains(&sequence)
            }),
        };

        for message in settled {
            match request.kind {
                DownstreamKind::NAckAll | DownstreamKind::NAckRange => {
                    self.redeliver(message, None);
                }
                DownstreamKind::ReQueueAll | DownstreamKind::ReQueueRange => {
                    self.redeliver(message, request.re_queue_channel.as_deref());
                }
                _ => {}
            }
        }
        if !remaining.is_empty() {
            self.in_flight.insert(transaction_id, remaining);
        }
        DownstreamResponse::accepted(request)
    }

    fn get(&mut self, request: &DownstreamRequest) -> DownstreamResponse {
        let queue = self.queues.entry(request.channel.clone()).or_default();
        let take = (request.max_items as usize).min(queue.len());
        let messages: Vec<WireMessage> = queue.drain(..take).collect();
        if messages.is_empty() {
            return DownstreamResponse::accepted(request);
        }

        self.next_transaction += 1;
        let transaction_id = format!("T{}", self.next_transaction);
        if !request.auto_ack {
            self.in_flight
                .insert(transaction_id.clone(), messages.clone());
        }

        DownstreamResponse {
            transaction_id,
            messages,
            active_offsets: Vec::new(),
            transaction_complete: request.auto_ack,
            ..DownstreamResponse::accepted(request)
        }
    }
}
