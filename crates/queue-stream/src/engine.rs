//! Correlation engine shared by the upstream and downstream directions.
//!
//! Callers register a pending correlation and push the request onto a
//! bounded outbound queue. A supervisor task runs one writer and one reader
//! per stream generation: the writer is the only owner of the sink, the
//! reader the only owner of the stream. When either fails the generation
//! token is cancelled, every pending correlation is failed with its own
//! identity, and the stream is reopened on a recreated connection.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures_util::{SinkExt, StreamExt, future::BoxFuture};
use tokio::{
    sync::mpsc,
    time::{MissedTickBehavior, sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelManager, ConnectionState, LinkStatus},
    config::ClientConfig,
    error::{QueueError, QueueResult},
    pending::PendingStore,
    transport::{Connection, Duplex, FrameSink, FrameStream},
    types::ConnectionEpoch,
    wire::Correlated,
};

/// One direction of the broker protocol.
pub(crate) trait Exchange: Send + Sync + 'static {
    type Request: Correlated + Send + 'static;
    type Response: Correlated + Send + 'static;

    /// Stream name used in log fields.
    const NAME: &'static str;

    fn open(
        connection: Arc<dyn Connection>,
    ) -> BoxFuture<'static, QueueResult<Duplex<Self::Request, Self::Response>>>;
}

type ExchangeDuplex<E> = Duplex<<E as Exchange>::Request, <E as Exchange>::Response>;

/// State shared between callers and the supervisor task.
struct Link<E: Exchange> {
    manager: Arc<ChannelManager>,
    config: Arc<ClientConfig>,
    pending: Arc<PendingStore<E::Response>>,
    state: Arc<ConnectionState>,
    shutdown: CancellationToken,
}

/// Caller-facing half of one stream.
pub(crate) struct StreamEngine<E: Exchange> {
    manager: Arc<ChannelManager>,
    config: Arc<ClientConfig>,
    pending: Arc<PendingStore<E::Response>>,
    state: Arc<ConnectionState>,
    outbound: mpsc::Sender<E::Request>,
    shutdown: CancellationToken,
}

impl<E: Exchange> StreamEngine<E> {
    /// Open the stream on the manager's current connection and spawn its
    /// supervisor. The supervisor stops when `shutdown` is cancelled.
    pub(crate) async fn start(
        manager: Arc<ChannelManager>,
        shutdown: CancellationToken,
    ) -> QueueResult<Arc<Self>> {
        let config = Arc::clone(manager.config());
        let (epoch, connection) = manager.current().await?;
        let duplex = E::open(connection).await?;

        let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue_capacity);
        let pending = Arc::new(PendingStore::new(config.max_pending_requests));
        let state = Arc::new(ConnectionState::new(LinkStatus::Connected));

        let link = Link::<E> {
            manager: Arc::clone(&manager),
            config: Arc::clone(&config),
            pending: Arc::clone(&pending),
            state: Arc::clone(&state),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(supervise(link, outbound_rx, duplex, epoch));
        info!(stream = E::NAME, %epoch, "Stream opened");

        Ok(Arc::new(Self {
            manager,
            config,
            pending,
            state,
            outbound,
            shutdown,
        }))
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn status(&self) -> LinkStatus {
        self.state.status()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Fail fast unless both this stream and the manager accept work.
    pub(crate) fn check_accepting(&self) -> QueueResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::connection_closed(Some(
                "client closed".to_string(),
            )));
        }
        self.state.check()?;
        self.manager.state().check()
    }

    /// Send one request and wait up to `wait` for its response.
    ///
    /// `identity` is reported in `ConnectionLost` and `RequestTimeout`
    /// errors; it defaults to the request id.
    pub(crate) async fn execute(
        &self,
        request: E::Request,
        identity: Option<String>,
        wait: Duration,
    ) -> QueueResult<E::Response> {
        self.check_accepting()?;

        let request_id = request.correlation_id().clone();
        let identity = identity.unwrap_or_else(|| request_id.to_string());
        let rx = self
            .pending
            .add(request_id.clone(), Some(identity.clone()), wait)?;

        let started = Instant::now();
        match timeout(wait, self.outbound.send(request)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.pending.remove(&request_id);
                return Err(self.check_accepting().err().unwrap_or_else(|| {
                    QueueError::connection_closed(Some("stream task shut down".to_string()))
                }));
            }
            Err(_) => {
                self.pending.remove(&request_id);
                return Err(QueueError::request_timeout(wait, identity));
            }
        }

        let remaining = wait.saturating_sub(started.elapsed());
        match timeout(remaining, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(QueueError::internal("response channel dropped")),
            Err(_) => {
                self.pending.remove(&request_id);
                debug!(stream = E::NAME, %request_id, "Request timed out");
                Err(QueueError::request_timeout(wait, identity))
            }
        }
    }
}

async fn supervise<E: Exchange>(
    link: Link<E>,
    mut outbound: mpsc::Receiver<E::Request>,
    mut duplex: ExchangeDuplex<E>,
    mut epoch: ConnectionEpoch,
) {
    loop {
        let generation = link.shutdown.child_token();
        let failure = run_generation(&link, duplex, &mut outbound, &generation).await;

        let error = match failure {
            Some(error) if !link.shutdown.is_cancelled() => error,
            _ => {
                link.shut_down(&mut outbound);
                return;
            }
        };

        link.state.set_disconnected();
        let reason = error.to_string();
        let failed = link.pending.fail_all(&reason);
        let drained = link.drain(&mut outbound, &reason);
        warn!(
            stream = E::NAME,
            %epoch,
            error = %error,
            failed,
            drained,
            "Stream failed; recreating connection"
        );

        match reconnect(&link, epoch).await {
            Ok((next_epoch, next)) => {
                epoch = next_epoch;
                duplex = next;
                if !link.state.set_connected() {
                    link.shut_down(&mut outbound);
                    return;
                }
                info!(stream = E::NAME, %epoch, "Stream reopened");
            }
            Err(_) if link.shutdown.is_cancelled() => {
                link.shut_down(&mut outbound);
                return;
            }
            Err(error) => {
                warn!(stream = E::NAME, error = %error, "Giving up on stream");
                link.state.set_failed();
                outbound.close();
                link.pending.fail_all_with(&error);
                link.drain(&mut outbound, &error.to_string());
                return;
            }
        }
    }
}

/// Run writer and reader until either stops. Returns the failure, or `None`
/// when the generation was cancelled or the outbound queue closed.
async fn run_generation<E: Exchange>(
    link: &Link<E>,
    duplex: ExchangeDuplex<E>,
    outbound: &mut mpsc::Receiver<E::Request>,
    generation: &CancellationToken,
) -> Option<QueueError> {
    let Duplex { sink, stream } = duplex;
    let (written, read) = tokio::join!(
        write_loop::<E>(
            sink,
            outbound,
            &link.pending,
            generation,
            link.config.request_timeout
        ),
        read_loop::<E>(
            stream,
            &link.pending,
            generation,
            link.config.pending_cleanup_interval
        ),
    );
    read.err().or(written.err())
}

async fn write_loop<E: Exchange>(
    mut sink: FrameSink<E::Request>,
    outbound: &mut mpsc::Receiver<E::Request>,
    pending: &PendingStore<E::Response>,
    generation: &CancellationToken,
    write_timeout: Duration,
) -> QueueResult<()> {
    let result = loop {
        let request = tokio::select! {
            biased;
            _ = generation.cancelled() => break Ok(()),
            request = outbound.recv() => match request {
                Some(request) => request,
                None => break Ok(()),
            },
        };

        let request_id = request.correlation_id().clone();
        if !pending.contains(&request_id) {
            debug!(stream = E::NAME, %request_id, "Skipping abandoned request");
            continue;
        }

        // A started write runs to completion; cancellation is seen on the next pass.
        let Ok(sent) = timeout(write_timeout, sink.send(request)).await else {
            warn!(stream = E::NAME, %request_id, "Stream write timed out");
            pending.fail(&request_id, "stream write timed out");
            break Err(QueueError::timeout(write_timeout));
        };
        if let Err(e) = sent {
            warn!(stream = E::NAME, %request_id, error = %e, "Stream write failed");
            break Err(e);
        }
    };

    generation.cancel();
    result
}

async fn read_loop<E: Exchange>(
    mut stream: FrameStream<E::Response>,
    pending: &PendingStore<E::Response>,
    generation: &CancellationToken,
    cleanup_every: Duration,
) -> QueueResult<()> {
    let mut cleanup = tokio::time::interval(cleanup_every);
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            biased;
            _ = generation.cancelled() => break Ok(()),
            frame = stream.next() => match frame {
                Some(Ok(response)) => {
                    let request_id = response.correlation_id().clone();
                    if !pending.resolve(&request_id, Ok(response)) {
                        debug!(
                            stream = E::NAME,
                            %request_id,
                            "Discarding response with no pending request"
                        );
                    }
                }
                Some(Err(QueueError::Serialization { message })) => {
                    warn!(stream = E::NAME, error = %message, "Dropping undecodable frame");
                }
                Some(Err(e)) => {
                    warn!(stream = E::NAME, error = %e, "Stream read failed");
                    break Err(e);
                }
                None => break Err(QueueError::connection_closed(Some(
                    "stream ended by peer".to_string(),
                ))),
            },
            _ = cleanup.tick() => {
                let expired = pending.cleanup_stale_with_notify();
                if expired > 0 {
                    debug!(stream = E::NAME, expired, "Failed stale requests");
                }
            }
        }
    };

    generation.cancel();
    result
}

/// Recreate the connection and reopen the stream, retrying with backoff.
async fn reconnect<E: Exchange>(
    link: &Link<E>,
    mut seen: ConnectionEpoch,
) -> QueueResult<(ConnectionEpoch, ExchangeDuplex<E>)> {
    let backoff = link.config.backoff();
    let mut attempt: u32 = 0;

    loop {
        let outcome = tokio::select! {
            _ = link.shutdown.cancelled() => return Err(closed_error()),
            outcome = reopen::<E>(&link.manager, &mut seen) => outcome,
        };

        let error = match outcome {
            Ok(reopened) => return Ok(reopened),
            Err(e @ QueueError::Permanent { .. }) => return Err(e),
            Err(e) => e,
        };
        if link.manager.state().is_terminal() {
            return Err(link.manager.state().check().err().unwrap_or(error));
        }

        attempt = attempt.saturating_add(1);
        if let Some(max) = link.config.reconnect_max_attempts
            && attempt >= max
        {
            link.manager.state().set_failed();
            return Err(QueueError::permanent(format!(
                "gave up after {attempt} reconnect attempts: {error}"
            )));
        }

        let delay = backoff.delay_after(attempt);
        warn!(
            stream = E::NAME,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Reconnect attempt failed"
        );
        tokio::select! {
            _ = link.shutdown.cancelled() => return Err(closed_error()),
            _ = sleep(delay) => {}
        }
    }
}

async fn reopen<E: Exchange>(
    manager: &ChannelManager,
    seen: &mut ConnectionEpoch,
) -> QueueResult<(ConnectionEpoch, ExchangeDuplex<E>)> {
    let (epoch, connection) = manager.recreate_channel(*seen).await?;
    match E::open(connection).await {
        Ok(duplex) => Ok((epoch, duplex)),
        Err(e) => {
            // The connection at `epoch` is unusable too; rebuild past it.
            *seen = epoch;
            Err(e)
        }
    }
}

fn closed_error() -> QueueError {
    QueueError::connection_closed(Some("client closed".to_string()))
}

impl<E: Exchange> Link<E> {
    /// Fail queued requests that will never be written.
    fn drain(&self, outbound: &mut mpsc::Receiver<E::Request>, reason: &str) -> usize {
        let mut drained = 0;
        while let Ok(request) = outbound.try_recv() {
            self.pending.fail(request.correlation_id(), reason);
            drained += 1;
        }
        drained
    }

    fn shut_down(&self, outbound: &mut mpsc::Receiver<E::Request>) {
        self.state.set_closed();
        outbound.close();
        let error = closed_error();
        while outbound.try_recv().is_ok() {}
        let failed = self.pending.fail_all_with(&error);
        info!(stream = E::NAME, failed, "Stream closed");
    }
}
