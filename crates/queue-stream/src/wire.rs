//! Wire envelopes exchanged over the upstream and downstream streams.
//!
//! Durations travel as milliseconds and timestamps as unix milliseconds,
//! where `0` means "unset". Conversions from the second-based API happen
//! at the edges of this module.

use std::{
    collections::HashMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::RequestId;

/// Envelopes that carry a correlation id.
pub trait Correlated {
    /// `request_id` for requests, `ref_request_id` for responses.
    fn correlation_id(&self) -> &RequestId;
}

/// Delivery policy attached to an outbound message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WirePolicy {
    pub delay_ms: u64,
    pub expiration_ms: u64,
    pub max_receive_count: u32,
    pub max_receive_queue: Option<String>,
}

/// Broker-assigned delivery attributes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireAttributes {
    pub timestamp: u64,
    pub sequence: u64,
    pub receive_count: u32,
    pub re_routed: bool,
    pub re_routed_from_queue: Option<String>,
    pub expiration_at: u64,
    pub delayed_to: u64,
}

/// A message as it travels in either direction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireMessage {
    pub id: String,
    pub client_id: String,
    pub channel: String,
    pub metadata: String,
    pub body: Bytes,
    pub tags: HashMap<String, String>,
    pub policy: Option<WirePolicy>,
    pub attributes: Option<WireAttributes>,
}

/// One or more messages to enqueue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpstreamRequest {
    pub request_id: RequestId,
    pub messages: Vec<WireMessage>,
}

/// Per-message outcome of an upstream request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendReceipt {
    pub message_id: String,
    pub sent_at: u64,
    pub expiration_at: u64,
    pub delayed_to: u64,
    pub is_error: bool,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpstreamResponse {
    pub ref_request_id: RequestId,
    #[serde(default)]
    pub results: Vec<SendReceipt>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub error: String,
}

/// Downstream request kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownstreamKind {
    Get,
    AckAll,
    AckRange,
    NAckAll,
    NAckRange,
    ReQueueAll,
    ReQueueRange,
}

impl DownstreamKind {
    /// True for every kind that settles messages of an existing transaction.
    pub fn is_control(&self) -> bool {
        !matches!(self, Self::Get)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownstreamRequest {
    pub request_id: RequestId,
    pub client_id: String,
    pub kind: DownstreamKind,
    pub channel: String,
    #[serde(default)]
    pub max_items: u32,
    #[serde(default)]
    pub wait_timeout_ms: u64,
    #[serde(default)]
    pub auto_ack: bool,
    #[serde(default)]
    pub ref_transaction_id: Option<String>,
    #[serde(default)]
    pub sequence_range: Vec<u64>,
    #[serde(default)]
    pub re_queue_channel: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownstreamResponse {
    pub ref_request_id: RequestId,
    pub kind: DownstreamKind,
    #[serde(default)]
    pub transaction_id: String,
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub active_offsets: Vec<u64>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub transaction_complete: bool,
}

impl DownstreamResponse {
    /// Acceptance of a control request.
    pub fn accepted(request: &DownstreamRequest) -> Self {
        Self {
            ref_request_id: request.request_id.clone(),
            kind: request.kind,
            transaction_id: request.ref_transaction_id.clone().unwrap_or_default(),
            messages: Vec::new(),
            active_offsets: Vec::new(),
            is_error: false,
            error: String::new(),
            transaction_complete: false,
        }
    }

    /// Broker-side rejection of any downstream request.
    pub fn rejected(request: &DownstreamRequest, error: impl Into<String>) -> Self {
        Self {
            is_error: true,
            error: error.into(),
            ..Self::accepted(request)
        }
    }
}

impl Correlated for UpstreamRequest {
    fn correlation_id(&self) -> &RequestId {
        &self.request_id
    }
}

impl Correlated for UpstreamResponse {
    fn correlation_id(&self) -> &RequestId {
        &self.ref_request_id
    }
}

impl Correlated for DownstreamRequest {
    fn correlation_id(&self) -> &RequestId {
        &self.request_id
    }
}

impl Correlated for DownstreamResponse {
    fn correlation_id(&self) -> &RequestId {
        &self.ref_request_id
    }
}

/// Which logical stream a transport connection carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Ping,
    Upstream,
    Downstream,
}

/// First frame on every transport stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub stream: StreamKind,
    pub client_id: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

pub(crate) fn seconds_to_millis(seconds: u32) -> u64 {
    u64::from(seconds) * 1000
}

pub(crate) fn seconds_to_duration(seconds: u32) -> Duration {
    Duration::from_secs(u64::from(seconds))
}

/// `None` for the unset (`0`) timestamp.
pub(crate) fn timestamp_from_millis(millis: u64) -> Option<SystemTime> {
    if millis == 0 {
        return None;
    }
    UNIX_EPOCH.checked_add(Duration::from_millis(millis))
}
