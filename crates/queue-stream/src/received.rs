//! Received messages, their transaction and settlement.
//!
//! Every message of one poll response shares a [`Transaction`]. Settlement
//! follows check, reserve, submit, commit: the per-sequence state is checked
//! and moved to `Settling` under the transaction mutex, the control request
//! goes out with the mutex released, and the outcome either commits the
//! final state or rolls the reservation back.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    sync::{Notify, watch},
    task::AbortHandle,
    time::{Instant, sleep_until},
};
use tracing::{debug, warn};

use crate::{
    error::{QueueError, QueueResult},
    wire::{WireMessage, seconds_to_duration, timestamp_from_millis},
};

/// Delivery state of one received message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageState {
    Delivered,
    /// A settlement request is in flight.
    Settling,
    Acked,
    Rejected,
    ReQueued,
    /// The visibility timer fired and the message was rejected.
    Expired,
}

impl MessageState {
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Delivered | Self::Settling)
    }
}

/// Settlement request for an existing transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlKind {
    AckRange(Vec<u64>),
    NAckRange(Vec<u64>),
    ReQueueRange { sequences: Vec<u64>, channel: String },
    AckAll,
    NAckAll,
    ReQueueAll { channel: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlOp {
    pub transaction_id: String,
    /// Channel the transaction was received from.
    pub channel: String,
    pub kind: ControlKind,
}

/// Forwards settlement requests to the broker.
#[async_trait]
pub trait TransactionControl: Send + Sync {
    /// Send the request and wait for the broker to accept it.
    async fn submit(&self, op: ControlOp) -> QueueResult<()>;
}

#[derive(Clone, Debug)]
pub(crate) enum Settlement {
    Ack,
    Reject,
    ReQueue(String),
}

impl Settlement {
    fn final_state(&self) -> MessageState {
        match self {
            Self::Ack => MessageState::Acked,
            Self::Reject => MessageState::Rejected,
            Self::ReQueue(_) => MessageState::ReQueued,
        }
    }

    fn range(&self, sequences: Vec<u64>) -> ControlKind {
        match self {
            Self::Ack => ControlKind::AckRange(sequences),
            Self::Reject => ControlKind::NAckRange(sequences),
            Self::ReQueue(channel) => ControlKind::ReQueueRange {
                sequences,
                channel: channel.clone(),
            },
        }
    }

    fn all(&self) -> ControlKind {
        match self {
            Self::Ack => ControlKind::AckAll,
            Self::Reject => ControlKind::NAckAll,
            Self::ReQueue(channel) => ControlKind::ReQueueAll {
                channel: channel.clone(),
            },
        }
    }

    fn validate(&self) -> QueueResult<()> {
        match self {
            Self::ReQueue(channel) if channel.is_empty() => Err(QueueError::validation(
                "re-queue channel cannot be empty",
            )),
            _ => Ok(()),
        }
    }
}

struct TransactionInner {
    completed: bool,
    /// A batch operation holds every unsettled message.
    settling_all: bool,
    states: BTreeMap<u64, MessageState>,
}

/// Settlement state shared by every message of one poll response.
pub struct Transaction {
    id: String,
    channel: String,
    control: Arc<dyn TransactionControl>,
    inner: Mutex<TransactionInner>,
    /// Signalled whenever a reservation is committed or rolled back.
    settled: Notify,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("completed", &inner.completed)
            .field("states", &inner.states)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn new(
        id: impl Into<String>,
        channel: impl Into<String>,
        control: Arc<dyn TransactionControl>,
        sequences: impl IntoIterator<Item = u64>,
        auto_acked: bool,
    ) -> Self {
        let state = if auto_acked {
            MessageState::Acked
        } else {
            MessageState::Delivered
        };
        Self {
            id: id.into(),
            channel: channel.into(),
            control,
            inner: Mutex::new(TransactionInner {
                completed: auto_acked,
                settling_all: false,
                states: sequences.into_iter().map(|s| (s, state)).collect(),
            }),
            settled: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_completed(&self) -> bool {
        self.inner.lock().completed
    }

    pub fn state(&self, sequence: u64) -> Option<MessageState> {
        self.inner.lock().states.get(&sequence).copied()
    }

    /// Settle the given sequences with one range request.
    pub(crate) async fn settle(
        &self,
        sequences: &[u64],
        settlement: Settlement,
    ) -> QueueResult<()> {
        settlement.validate()?;
        let reserved = self.reserve(sequences)?;

        let op = self.op(settlement.range(reserved.clone()));
        match self.control.submit(op).await {
            Ok(()) => {
                self.commit(&reserved, settlement.final_state());
                Ok(())
            }
            Err(e) => {
                self.rollback(&reserved);
                Err(e)
            }
        }
    }

    /// Settle every unsettled message and complete the transaction.
    pub(crate) async fn settle_all(&self, settlement: Settlement) -> QueueResult<()> {
        settlement.validate()?;
        let reserved = self.reserve_all()?;

        match self.control.submit(self.op(settlement.all())).await {
            Ok(()) => {
                {
                    let mut inner = self.inner.lock();
                    for sequence in &reserved {
                        inner.states.insert(*sequence, settlement.final_state());
                    }
                    inner.settling_all = false;
                    inner.completed = true;
                }
                self.settled.notify_waiters();
                debug!(transaction_id = %self.id, "Transaction completed");
                Ok(())
            }
            Err(e) => {
                {
                    let mut inner = self.inner.lock();
                    for sequence in &reserved {
                        inner.states.insert(*sequence, MessageState::Delivered);
                    }
                    inner.settling_all = false;
                }
                self.settled.notify_waiters();
                Err(e)
            }
        }
    }

    /// Reject a message whose visibility window elapsed.
    ///
    /// Returns `false` when another settlement of the message is in flight;
    /// the caller waits for it with [`Transaction::settled`] and retries.
    pub(crate) async fn expire(&self, sequence: u64) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.completed {
                return true;
            }
            match inner.states.get(&sequence) {
                Some(MessageState::Delivered) => {
                    inner.states.insert(sequence, MessageState::Settling);
                }
                Some(MessageState::Settling) => return false,
                _ => return true,
            }
        }

        let reserved = [sequence];
        if let Err(e) = self
            .control
            .submit(self.op(ControlKind::NAckRange(reserved.to_vec())))
            .await
        {
            warn!(
                transaction_id = %self.id,
                sequence,
                error = %e,
                "Failed to reject expired message"
            );
        }
        self.commit(&reserved, MessageState::Expired);
        debug!(transaction_id = %self.id, sequence, "Visibility expired");
        true
    }

    /// Wait until `sequence` is no longer reserved by a settlement.
    pub(crate) async fn settled(&self, sequence: u64) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state(sequence) != Some(MessageState::Settling) {
                return;
            }
            notified.await;
        }
    }

    /// Usage error for an operation on `sequence`, if it is not deliverable.
    pub(crate) fn check_delivered(&self, sequence: u64) -> QueueResult<()> {
        let inner = self.inner.lock();
        if inner.completed {
            return Err(QueueError::transaction_completed(&self.id));
        }
        match inner.states.get(&sequence) {
            Some(MessageState::Delivered) => Ok(()),
            Some(state) => Err(QueueError::usage(format!(
                "message {sequence} is {state:?}"
            ))),
            None => Err(QueueError::validation(format!(
                "sequence {sequence} is not part of transaction {}",
                self.id
            ))),
        }
    }

    fn op(&self, kind: ControlKind) -> ControlOp {
        ControlOp {
            transaction_id: self.id.clone(),
            channel: self.channel.clone(),
            kind,
        }
    }

    fn reserve(&self, sequences: &[u64]) -> QueueResult<Vec<u64>> {
        if sequences.is_empty() {
            return Err(QueueError::validation("sequence range cannot be empty"));
        }
        let unique: BTreeSet<u64> = sequences.iter().copied().collect();

        let mut inner = self.inner.lock();
        if inner.completed {
            return Err(QueueError::transaction_completed(&self.id));
        }
        if inner.settling_all {
            return Err(self.in_flight());
        }
        for sequence in &unique {
            match inner.states.get(sequence) {
                Some(MessageState::Delivered) => {}
                Some(state) => {
                    return Err(QueueError::usage(format!(
                        "message {sequence} is {state:?}"
                    )));
                }
                None => {
                    return Err(QueueError::validation(format!(
                        "sequence {sequence} is not part of transaction {}",
                        self.id
                    )));
                }
            }
        }
        for sequence in &unique {
            inner.states.insert(*sequence, MessageState::Settling);
        }
        Ok(unique.into_iter().collect())
    }

    fn reserve_all(&self) -> QueueResult<Vec<u64>> {
        let mut inner = self.inner.lock();
        if inner.completed {
            return Err(QueueError::transaction_completed(&self.id));
        }
        if inner.settling_all || inner.states.values().any(|s| *s == MessageState::Settling) {
            return Err(self.in_flight());
        }
        inner.settling_all = true;
        let reserved: Vec<u64> = inner
            .states
            .iter()
            .filter(|(_, s)| **s == MessageState::Delivered)
            .map(|(seq, _)| *seq)
            .collect();
        for sequence in &reserved {
            inner.states.insert(*sequence, MessageState::Settling);
        }
        Ok(reserved)
    }

    fn in_flight(&self) -> QueueError {
        QueueError::usage(format!(
            "transaction {} has a settlement in flight",
            self.id
        ))
    }

    fn commit(&self, sequences: &[u64], state: MessageState) {
        {
            let mut inner = self.inner.lock();
            for sequence in sequences {
                inner.states.insert(*sequence, state);
            }
            if inner.states.values().all(MessageState::is_final) {
                inner.completed = true;
            }
        }
        self.settled.notify_waiters();
    }

    fn rollback(&self, sequences: &[u64]) {
        {
            let mut inner = self.inner.lock();
            for sequence in sequences {
                inner.states.insert(*sequence, MessageState::Delivered);
            }
        }
        self.settled.notify_waiters();
    }
}

struct VisibilityTimer {
    deadline: watch::Sender<Instant>,
    task: AbortHandle,
}

impl VisibilityTimer {
    fn start(transaction: Arc<Transaction>, sequence: u64, window: Duration) -> Self {
        let (deadline, mut rx) = watch::channel(Instant::now() + window);
        let task = tokio::spawn(async move {
            loop {
                let at = *rx.borrow_and_update();
                tokio::select! {
                    _ = sleep_until(at) => {}
                    changed = rx.changed() => {
                        // Message handle dropped: let the last deadline run out.
                        if changed.is_ok() {
                            continue;
                        }
                        sleep_until(at).await;
                    }
                }
                if transaction.expire(sequence).await {
                    break;
                }
                // A settlement holds the message; expire it if that one fails.
                transaction.settled(sequence).await;
            }
        });
        Self {
            deadline,
            task: task.abort_handle(),
        }
    }

    fn stop(&self) {
        self.task.abort();
    }
}

/// A message delivered by a poll.
pub struct ReceivedMessage {
    pub id: String,
    pub channel: String,
    pub metadata: String,
    pub body: Bytes,
    pub tags: HashMap<String, String>,
    pub sequence: u64,
    pub receive_count: u32,
    pub is_re_routed: bool,
    pub re_routed_from_queue: Option<String>,
    pub timestamp: Option<SystemTime>,
    pub expires_at: Option<SystemTime>,
    pub delayed_to: Option<SystemTime>,
    pub transaction_id: String,
    pub receiver_client_id: String,
    transaction: Arc<Transaction>,
    visibility: Option<VisibilityTimer>,
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("sequence", &self.sequence)
            .field("receive_count", &self.receive_count)
            .field("transaction_id", &self.transaction_id)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

impl ReceivedMessage {
    pub(crate) fn from_wire(
        message: WireMessage,
        transaction: Arc<Transaction>,
        receiver_client_id: &str,
        visibility_seconds: u32,
    ) -> Self {
        let attributes = message.attributes.unwrap_or_default();
        let sequence = attributes.sequence;
        let visibility = (visibility_seconds > 0).then(|| {
            VisibilityTimer::start(
                Arc::clone(&transaction),
                sequence,
                seconds_to_duration(visibility_seconds),
            )
        });

        Self {
            id: message.id,
            channel: message.channel,
            metadata: message.metadata,
            body: message.body,
            tags: message.tags,
            sequence,
            receive_count: attributes.receive_count,
            is_re_routed: attributes.re_routed,
            re_routed_from_queue: attributes.re_routed_from_queue,
            timestamp: timestamp_from_millis(attributes.timestamp),
            expires_at: timestamp_from_millis(attributes.expiration_at),
            delayed_to: timestamp_from_millis(attributes.delayed_to),
            transaction_id: transaction.id().to_string(),
            receiver_client_id: receiver_client_id.to_string(),
            transaction,
            visibility,
        }
    }

    /// Whether the transaction this message belongs to is completed.
    pub fn transaction_completed(&self) -> bool {
        self.transaction.is_completed()
    }

    pub fn state(&self) -> MessageState {
        self.transaction
            .state(self.sequence)
            .unwrap_or(MessageState::Delivered)
    }

    pub async fn ack(&self) -> QueueResult<()> {
        self.settle(Settlement::Ack).await
    }

    pub async fn reject(&self) -> QueueResult<()> {
        self.settle(Settlement::Reject).await
    }

    /// Move the message to `channel`.
    pub async fn re_queue(&self, channel: impl Into<String>) -> QueueResult<()> {
        self.settle(Settlement::ReQueue(channel.into())).await
    }

    /// Push the visibility deadline out by `seconds`.
    pub fn extend_visibility_timer(&self, seconds: u32) -> QueueResult<()> {
        let timer = self.visibility_timer(seconds)?;
        let extra = seconds_to_duration(seconds);
        timer.deadline.send_modify(|deadline| *deadline += extra);
        Ok(())
    }

    /// Restart the visibility window at now + `seconds`.
    pub fn reset_visibility_timer(&self, seconds: u32) -> QueueResult<()> {
        let timer = self.visibility_timer(seconds)?;
        timer
            .deadline
            .send_replace(Instant::now() + seconds_to_duration(seconds));
        Ok(())
    }

    async fn settle(&self, settlement: Settlement) -> QueueResult<()> {
        self.transaction
            .settle(&[self.sequence], settlement)
            .await?;
        self.stop_visibility();
        Ok(())
    }

    fn visibility_timer(&self, seconds: u32) -> QueueResult<&VisibilityTimer> {
        if seconds == 0 {
            return Err(QueueError::validation("visibility seconds must be greater than 0"));
        }
        self.transaction.check_delivered(self.sequence)?;
        self.visibility
            .as_ref()
            .ok_or_else(|| QueueError::usage("message was polled without a visibility window"))
    }

    pub(crate) fn stop_visibility(&self) {
        if let Some(timer) = &self.visibility {
            timer.stop();
        }
    }
}

/// Outcome of one poll.
///
/// Transport and broker failures are reported in [`PollResponse::error`].
pub struct PollResponse {
    pub ref_request_id: String,
    pub transaction_id: String,
    pub messages: Vec<ReceivedMessage>,
    pub active_offsets: Vec<u64>,
    pub receiver_client_id: String,
    pub visibility_seconds: u32,
    pub auto_acked: bool,
    pub error: Option<QueueError>,
    transaction: Option<Arc<Transaction>>,
}

impl fmt::Debug for PollResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollResponse")
            .field("ref_request_id", &self.ref_request_id)
            .field("transaction_id", &self.transaction_id)
            .field("messages", &self.messages)
            .field("auto_acked", &self.auto_acked)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl PollResponse {
    pub(crate) fn failed(
        ref_request_id: impl Into<String>,
        receiver_client_id: impl Into<String>,
        error: QueueError,
    ) -> Self {
        Self {
            ref_request_id: ref_request_id.into(),
            transaction_id: String::new(),
            messages: Vec::new(),
            active_offsets: Vec::new(),
            receiver_client_id: receiver_client_id.into(),
            visibility_seconds: 0,
            auto_acked: false,
            error: Some(error),
            transaction: None,
        }
    }

    /// Response carrying `messages`, all sharing `transaction`.
    pub(crate) fn delivered(
        ref_request_id: impl Into<String>,
        receiver_client_id: &str,
        transaction: Option<Arc<Transaction>>,
        messages: Vec<WireMessage>,
        active_offsets: Vec<u64>,
        visibility_seconds: u32,
        auto_acked: bool,
    ) -> Self {
        let messages = match &transaction {
            Some(tx) => messages
                .into_iter()
                .map(|m| {
                    ReceivedMessage::from_wire(
                        m,
                        Arc::clone(tx),
                        receiver_client_id,
                        visibility_seconds,
                    )
                })
                .collect(),
            None => Vec::new(),
        };
        Self {
            ref_request_id: ref_request_id.into(),
            transaction_id: transaction
                .as_ref()
                .map(|t| t.id().to_string())
                .unwrap_or_default(),
            messages,
            active_offsets,
            receiver_client_id: receiver_client_id.to_string(),
            visibility_seconds,
            auto_acked,
            error: None,
            transaction,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_transaction_completed(&self) -> bool {
        self.transaction.as_ref().is_some_and(|t| t.is_completed())
    }

    pub async fn ack_all(&self) -> QueueResult<()> {
        self.settle_all(Settlement::Ack).await
    }

    pub async fn reject_all(&self) -> QueueResult<()> {
        self.settle_all(Settlement::Reject).await
    }

    pub async fn re_queue_all(&self, channel: impl Into<String>) -> QueueResult<()> {
        self.settle_all(Settlement::ReQueue(channel.into())).await
    }

    pub async fn ack_range(&self, sequences: &[u64]) -> QueueResult<()> {
        self.settle_range(sequences, Settlement::Ack).await
    }

    pub async fn reject_range(&self, sequences: &[u64]) -> QueueResult<()> {
        self.settle_range(sequences, Settlement::Reject).await
    }

    pub async fn re_queue_range(
        &self,
        sequences: &[u64],
        channel: impl Into<String>,
    ) -> QueueResult<()> {
        self.settle_range(sequences, Settlement::ReQueue(channel.into()))
            .await
    }

    fn transaction(&self) -> QueueResult<&Arc<Transaction>> {
        self.transaction
            .as_ref()
            .ok_or_else(|| QueueError::usage("no messages received"))
    }

    async fn settle_all(&self, settlement: Settlement) -> QueueResult<()> {
        self.transaction()?.settle_all(settlement).await?;
        for message in &self.messages {
            message.stop_visibility();
        }
        Ok(())
    }

    async fn settle_range(&self, sequences: &[u64], settlement: Settlement) -> QueueResult<()> {
        self.transaction()?.settle(sequences, settlement).await?;
        for message in self
            .messages
            .iter()
            .filter(|m| sequences.contains(&m.sequence))
        {
            message.stop_visibility();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::wire::WireAttributes;

    #[derive(Default)]
    struct RecordingControl {
        submitted: parking_lot::Mutex<Vec<ControlOp>>,
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl TransactionControl for RecordingControl {
        async fn submit(&self, op: ControlOp) -> QueueResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(QueueError::broker("rejected"));
            }
            self.submitted.lock().push(op);
            Ok(())
        }
    }

    fn wire(sequence: u64) -> WireMessage {
        WireMessage {
            id: format!("m{sequence}"),
            channel: "q1".to_string(),
            body: Bytes::from_static(b"payload"),
            attributes: Some(WireAttributes {
                sequence,
                receive_count: 1,
                timestamp: 1_000,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Waits `delay` before answering, then rejects every request.
    struct SlowRejectingControl {
        delay: Duration,
        submitted: parking_lot::Mutex<Vec<ControlOp>>,
    }

    impl SlowRejectingControl {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                submitted: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TransactionControl for SlowRejectingControl {
        async fn submit(&self, op: ControlOp) -> QueueResult<()> {
            tokio::time::sleep(self.delay).await;
            self.submitted.lock().push(op);
            Err(QueueError::broker("rejected"))
        }
    }

    fn response(control: &Arc<RecordingControl>, count: u64, visibility: u32) -> PollResponse {
        response_with(Arc::clone(control) as Arc<dyn TransactionControl>, count, visibility)
    }

    fn response_with(
        control: Arc<dyn TransactionControl>,
        count: u64,
        visibility: u32,
    ) -> PollResponse {
        let transaction = Arc::new(Transaction::new("T1", "q1", control, 1..=count, false));
        PollResponse::delivered(
            "r1",
            "receiver",
            Some(transaction),
            (1..=count).map(wire).collect(),
            Vec::new(),
            visibility,
            false,
        )
    }

    #[tokio::test]
    async fn ack_all_twice_fails_without_traffic() {
        let control = Arc::new(RecordingControl::default());
        let response = response(&control, 3, 0);

        response.ack_all().await.expect("first ack_all");
        assert!(response.is_transaction_completed());
        assert!(response.messages.iter().all(|m| m.state() == MessageState::Acked));

        let err = response.ack_all().await.unwrap_err();
        assert!(err.is_usage());
        assert!(err.to_string().contains("T1"));
        assert_eq!(control.calls.load(Ordering::SeqCst), 1);
        assert_eq!(control.submitted.lock()[0].kind, ControlKind::AckAll);
    }

    #[tokio::test]
    async fn completed_transaction_rejects_message_operations() {
        let control = Arc::new(RecordingControl::default());
        let response = response(&control, 2, 0);
        response.reject_all().await.expect("reject_all");

        let message = &response.messages[0];
        assert!(message.transaction_completed());
        assert!(message.ack().await.unwrap_err().is_usage());
        assert!(message.re_queue("q2").await.unwrap_err().is_usage());
        assert!(response.ack_range(&[1]).await.unwrap_err().is_usage());
        assert_eq!(control.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn settling_every_message_completes_transaction() {
        let control = Arc::new(RecordingControl::default());
        let response = response(&control, 3, 0);

        response.messages[0].ack().await.expect("ack");
        response.messages[1].reject().await.expect("reject");
        assert!(!response.is_transaction_completed());
        assert!(response.messages[0].ack().await.unwrap_err().is_usage());

        response.messages[2].re_queue("q2").await.expect("re-queue");
        assert!(response.is_transaction_completed());

        let kinds: Vec<ControlKind> = control
            .submitted
            .lock()
            .iter()
            .map(|op| op.kind.clone())
            .collect();
        assert_eq!(
            kinds,
            vec![
                ControlKind::AckRange(vec![1]),
                ControlKind::NAckRange(vec![2]),
                ControlKind::ReQueueRange {
                    sequences: vec![3],
                    channel: "q2".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn failed_submit_rolls_back() {
        let control = Arc::new(RecordingControl::default());
        let response = response(&control, 2, 0);

        control.fail.store(true, Ordering::SeqCst);
        assert!(response.ack_range(&[1, 2]).await.is_err());
        assert!(response.ack_all().await.is_err());
        assert!(!response.is_transaction_completed());
        assert_eq!(response.messages[0].state(), MessageState::Delivered);

        control.fail.store(false, Ordering::SeqCst);
        response.ack_range(&[1, 2]).await.expect("retry");
        assert!(response.is_transaction_completed());
    }

    #[tokio::test(start_paused = true)]
    async fn batch_in_flight_is_not_completed() {
        let control = SlowRejectingControl::new(Duration::from_secs(1));
        let response = response_with(Arc::clone(&control) as Arc<dyn TransactionControl>, 2, 0);

        let (batch, (completed_during, concurrent)) = tokio::join!(response.ack_all(), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            (
                response.is_transaction_completed(),
                response.messages[0].ack().await,
            )
        });

        assert!(!completed_during);
        let err = concurrent.unwrap_err();
        assert!(err.is_usage());
        assert!(err.to_string().contains("settlement in flight"));

        assert_eq!(batch.unwrap_err(), QueueError::broker("rejected"));
        assert!(!response.is_transaction_completed());
        assert_eq!(response.messages[0].state(), MessageState::Delivered);
        assert_eq!(control.submitted.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_expires_after_failed_settlement() {
        let control = SlowRejectingControl::new(Duration::from_secs(3));
        let response = response_with(Arc::clone(&control) as Arc<dyn TransactionControl>, 1, 1);
        let message = &response.messages[0];

        // The window closes while the ack is still in flight
        assert_eq!(message.ack().await.unwrap_err(), QueueError::broker("rejected"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(message.state(), MessageState::Expired);
        let kinds: Vec<ControlKind> = control
            .submitted
            .lock()
            .iter()
            .map(|op| op.kind.clone())
            .collect();
        assert_eq!(
            kinds,
            vec![ControlKind::AckRange(vec![1]), ControlKind::NAckRange(vec![1])]
        );
    }

    #[tokio::test]
    async fn range_validation() {
        let control = Arc::new(RecordingControl::default());
        let response = response(&control, 2, 0);

        assert!(response.ack_range(&[]).await.unwrap_err().is_validation());
        assert!(response.ack_range(&[9]).await.unwrap_err().is_validation());
        assert!(response.re_queue_all("").await.unwrap_err().is_validation());
        assert!(response.messages[0].re_queue("").await.unwrap_err().is_validation());
        assert_eq!(control.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_response_has_no_transaction() {
        let response =
            PollResponse::delivered("r1", "receiver", None, Vec::new(), Vec::new(), 0, false);
        assert!(!response.is_error());
        assert!(response.messages.is_empty());
        assert!(response.ack_all().await.unwrap_err().is_usage());
    }

    #[tokio::test]
    async fn auto_acked_transaction_starts_completed() {
        let control = Arc::new(RecordingControl::default());
        let transaction = Arc::new(Transaction::new(
            "T2",
            "q1",
            Arc::clone(&control) as Arc<dyn TransactionControl>,
            [1],
            true,
        ));
        let response = PollResponse::delivered(
            "r1",
            "receiver",
            Some(transaction),
            vec![wire(1)],
            Vec::new(),
            0,
            true,
        );

        assert!(response.messages[0].transaction_completed());
        assert!(response.messages[0].ack().await.unwrap_err().is_usage());
        assert_eq!(control.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_expiry_rejects_message() {
        let control = Arc::new(RecordingControl::default());
        let response = response(&control, 1, 2);
        let message = &response.messages[0];

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(message.state(), MessageState::Expired);
        assert!(message.ack().await.unwrap_err().is_usage());
        assert!(message.extend_visibility_timer(5).unwrap_err().is_usage());
        assert_eq!(
            control.submitted.lock()[0].kind,
            ControlKind::NAckRange(vec![1])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn extend_and_reset_move_the_deadline() {
        let control = Arc::new(RecordingControl::default());
        let response = response(&control, 2, 2);

        response.messages[0].extend_visibility_timer(3).expect("extend");
        tokio::time::sleep(Duration::from_secs(1)).await;
        response.messages[1].reset_visibility_timer(10).expect("reset");

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(response.messages[0].state(), MessageState::Delivered);
        assert_eq!(response.messages[1].state(), MessageState::Delivered);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(response.messages[0].state(), MessageState::Expired);
        assert_eq!(response.messages[1].state(), MessageState::Delivered);

        assert!(response.messages[1].extend_visibility_timer(0).unwrap_err().is_validation());
    }

    #[tokio::test(start_paused = true)]
    async fn settling_stops_visibility_timer() {
        let control = Arc::new(RecordingControl::default());
        let response = response(&control, 1, 1);

        response.messages[0].ack().await.expect("ack");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(response.messages[0].state(), MessageState::Acked);
        assert_eq!(control.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn visibility_requires_window() {
        let control = Arc::new(RecordingControl::default());
        let response = response(&control, 1, 0);
        assert!(response.messages[0].extend_visibility_timer(1).unwrap_err().is_usage());
    }
}
