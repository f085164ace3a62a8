//! Application-facing message and request types.

use std::{collections::HashMap, time::SystemTime};

use bytes::Bytes;

use crate::{
    error::{QueueError, QueueResult},
    types::new_message_id,
    wire::{SendReceipt, WireMessage, WirePolicy, seconds_to_millis, timestamp_from_millis},
};

/// Delivery policy, in seconds at the API boundary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessagePolicy {
    /// Hold the message back for this many seconds.
    pub delay_in_seconds: u32,
    /// Drop the message after this many seconds.
    pub expiration_in_seconds: u32,
    /// Receive count after which the broker dead-letters the message.
    pub attempts_before_dead_letter_queue: u32,
    /// Dead-letter channel name.
    pub dead_letter_queue: Option<String>,
}

/// A message to send.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueMessage {
    /// Caller-assigned id; generated on send when `None`.
    pub id: Option<String>,
    pub channel: String,
    pub metadata: Option<String>,
    pub body: Bytes,
    pub tags: HashMap<String, String>,
    pub policy: MessagePolicy,
}

impl QueueMessage {
    /// Create a message for `channel` with the given body.
    pub fn new(channel: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn delay_in_seconds(mut self, seconds: u32) -> Self {
        self.policy.delay_in_seconds = seconds;
        self
    }

    #[must_use]
    pub fn expiration_in_seconds(mut self, seconds: u32) -> Self {
        self.policy.expiration_in_seconds = seconds;
        self
    }

    /// Route to `queue` after `attempts` receives.
    #[must_use]
    pub fn dead_letter(mut self, queue: impl Into<String>, attempts: u32) -> Self {
        self.policy.dead_letter_queue = Some(queue.into());
        self.policy.attempts_before_dead_letter_queue = attempts;
        self
    }

    /// Check the message before any network activity.
    pub fn validate(&self) -> QueueResult<()> {
        if self.channel.is_empty() {
            return Err(QueueError::validation("queue message must have a channel"));
        }
        let has_metadata = self.metadata.as_deref().is_some_and(|m| !m.is_empty());
        if !has_metadata && self.body.is_empty() && self.tags.is_empty() {
            return Err(QueueError::validation(
                "queue message must have at least one of metadata, body or tags",
            ));
        }
        if self
            .policy
            .dead_letter_queue
            .as_deref()
            .is_some_and(str::is_empty)
        {
            return Err(QueueError::validation(
                "dead letter queue name cannot be empty",
            ));
        }
        Ok(())
    }

    /// Assign an id if the caller did not.
    pub(crate) fn ensure_id(&mut self) -> String {
        self.id.get_or_insert_with(new_message_id).clone()
    }

    pub(crate) fn to_wire(&self, client_id: &str) -> WireMessage {
        WireMessage {
            id: self.id.clone().unwrap_or_default(),
            client_id: client_id.to_string(),
            channel: self.channel.clone(),
            metadata: self.metadata.clone().unwrap_or_default(),
            body: self.body.clone(),
            tags: self.tags.clone(),
            policy: Some(WirePolicy {
                delay_ms: seconds_to_millis(self.policy.delay_in_seconds),
                expiration_ms: seconds_to_millis(self.policy.expiration_in_seconds),
                max_receive_count: self.policy.attempts_before_dead_letter_queue,
                max_receive_queue: self.policy.dead_letter_queue.clone(),
            }),
            attributes: None,
        }
    }
}

/// Outcome of one send, always tagged with the message id.
#[derive(Clone, Debug, PartialEq)]
pub struct SendResult {
    pub id: String,
    pub sent_at: Option<SystemTime>,
    pub expired_at: Option<SystemTime>,
    pub delayed_to: Option<SystemTime>,
    pub error: Option<QueueError>,
}

impl SendResult {
    pub(crate) fn from_receipt(id: String, receipt: &SendReceipt) -> Self {
        let error = receipt
            .is_error
            .then(|| QueueError::broker(receipt.error.clone()));
        Self {
            id,
            sent_at: timestamp_from_millis(receipt.sent_at),
            expired_at: timestamp_from_millis(receipt.expiration_at),
            delayed_to: timestamp_from_millis(receipt.delayed_to),
            error,
        }
    }

    pub(crate) fn failed(id: String, error: QueueError) -> Self {
        Self {
            id,
            sent_at: None,
            expired_at: None,
            delayed_to: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Parameters of one poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollRequest {
    pub channel: String,
    /// Upper bound on messages returned.
    pub max_items: u32,
    /// How long the broker may wait for messages.
    pub wait_timeout_in_seconds: u32,
    /// Let the broker settle the batch on delivery.
    pub auto_ack: bool,
    /// Local visibility window per message; `0` disables the timer.
    pub visibility_seconds: u32,
}

impl PollRequest {
    /// One message, one second wait, manual settlement.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            max_items: 1,
            wait_timeout_in_seconds: 1,
            auto_ack: false,
            visibility_seconds: 0,
        }
    }

    #[must_use]
    pub fn max_items(mut self, max_items: u32) -> Self {
        self.max_items = max_items;
        self
    }

    #[must_use]
    pub fn wait_timeout_in_seconds(mut self, seconds: u32) -> Self {
        self.wait_timeout_in_seconds = seconds;
        self
    }

    #[must_use]
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    #[must_use]
    pub fn visibility_seconds(mut self, seconds: u32) -> Self {
        self.visibility_seconds = seconds;
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.channel.is_empty() {
            return Err(QueueError::validation("poll request must have a channel"));
        }
        if self.max_items < 1 {
            return Err(QueueError::validation("max_items must be greater than 0"));
        }
        if self.wait_timeout_in_seconds < 1 {
            return Err(QueueError::validation(
                "wait_timeout_in_seconds must be greater than 0",
            ));
        }
        if self.auto_ack && self.visibility_seconds > 0 {
            return Err(QueueError::validation(
                "auto_ack and visibility_seconds cannot be combined",
            ));
        }
        Ok(())
    }
}
