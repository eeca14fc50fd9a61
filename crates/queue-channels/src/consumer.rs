//! Consumer pipeline: long-poll a queue, wrap every delivery, hand the
//! messages to the application over a bounded channel and delete the ones
//! it acknowledges.
//!
//! Two loops run per started consumer:
//!
//! - the receive loop calls [`QueueBackend::receive_batch`] repeatedly and
//!   forwards successfully wrapped messages in backend order,
//! - the delete loop drains the acknowledgement channel and calls
//!   [`QueueBackend::delete_one`] for each acknowledged delivery.
//!
//! Both channels are bounded by the receive batch size, so a slow
//! application stalls receiving and a slow delete path stalls acknowledging.

use crate::backend::{QueueBackend, RawMessage};
use crate::config::ConsumerConfig;
use crate::error::QueueError;
use crate::lifecycle::Lifecycle;
use crate::message::{AckSender, BaseMessage, InboundMessage, MessageWrapper};
use crate::retry::{RetryPolicy, RetryState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;

/// Receiving end of a consumer's message channel.
///
/// Clones share the same underlying channel: every message goes to exactly
/// one caller of [`Inbox::recv`]. The channel closes once the consumer is
/// stopped and its buffered messages have been drained.
pub struct Inbox<M> {
    rx: Arc<Mutex<mpsc::Receiver<M>>>,
}

impl<M> Clone for Inbox<M> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<M> std::fmt::Debug for Inbox<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox").finish_non_exhaustive()
    }
}

impl<M> Inbox<M> {
    fn new(rx: mpsc::Receiver<M>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Next message, or `None` once the consumer has stopped
    pub async fn recv(&self) -> Option<M> {
        self.rx.lock().await.recv().await
    }

    /// Whether both handles read from the same channel
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.rx, &other.rx)
    }
}

/// Queue consumer producing messages of type `M`.
///
/// ```rust,no_run
/// use queue_channels::{BaseMessage, Consumer, ConsumerConfig, InMemoryQueue};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> Result<(), queue_channels::QueueError> {
/// let queue = Arc::new(InMemoryQueue::new());
/// let consumer = Consumer::new(queue, ConsumerConfig::default())?;
/// let cancel = CancellationToken::new();
///
/// let inbox = consumer.start(&cancel);
/// while let Some(message) = inbox.recv().await {
///     println!("{}", message.body());
///     message.ack().await;
/// }
/// # Ok(())
/// # }
/// ```
pub struct Consumer<M: BaseMessage = InboundMessage> {
    backend: Arc<dyn QueueBackend>,
    config: ConsumerConfig,
    wrapper: MessageWrapper<M>,
    lifecycle: Lifecycle<Inbox<M>>,
}

impl Consumer<InboundMessage> {
    /// Consumer yielding [`InboundMessage`]s
    pub fn new(backend: Arc<dyn QueueBackend>, config: ConsumerConfig) -> Result<Self, QueueError> {
        Self::with_wrapper(backend, config, Arc::new(InboundMessage::wrap))
    }
}

impl<M: BaseMessage> Consumer<M> {
    /// Consumer yielding whatever `wrapper` builds from each delivery.
    ///
    /// Deliveries the wrapper rejects are dropped without acknowledgement
    /// and come back after the backend's visibility timeout.
    pub fn with_wrapper(
        backend: Arc<dyn QueueBackend>,
        config: ConsumerConfig,
        wrapper: MessageWrapper<M>,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            backend,
            config,
            wrapper,
            lifecycle: Lifecycle::new(),
        })
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Start the receive and delete loops.
    ///
    /// Cancelling `cancel` (or calling [`Consumer::stop`]) ends both loops.
    /// Calling `start` again while running returns the same inbox.
    pub fn start(&self, cancel: &CancellationToken) -> Inbox<M> {
        self.lifecycle.start(cancel, |cancel| {
            let capacity = self.config.capacity();
            let (tx, rx) = mpsc::channel(capacity);
            let (ack, ack_rx) = AckSender::channel(capacity);

            info!(
                batch_size = self.config.batch_size,
                wait_time_seconds = self.config.wait_time_seconds,
                "Starting consumer"
            );

            let receive = tokio::spawn(receive_loop(
                Arc::clone(&self.backend),
                self.config.clone(),
                Arc::clone(&self.wrapper),
                tx,
                ack,
                cancel.clone(),
            ));
            let delete = tokio::spawn(delete_loop(
                Arc::clone(&self.backend),
                self.config.retry.clone(),
                ack_rx,
                cancel,
            ));

            (Inbox::new(rx), vec![receive, delete])
        })
    }

    /// Signal both loops to stop. Returns [`QueueError::NotStarted`] if the
    /// consumer was never started; stopping twice is fine.
    pub fn stop(&self) -> Result<(), QueueError> {
        self.lifecycle.stop()
    }

    /// Stop and wait for both loops to exit
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        self.lifecycle.shutdown().await
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }
}

async fn receive_loop<M: BaseMessage>(
    backend: Arc<dyn QueueBackend>,
    config: ConsumerConfig,
    wrapper: MessageWrapper<M>,
    outbound: mpsc::Sender<M>,
    ack: AckSender,
    cancel: CancellationToken,
) {
    let wait = config.wait_time();
    let mut retry = RetryState::new();

    'receive: loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = backend.receive_batch(config.batch_size, wait) => result,
        };

        let messages = match received {
            Ok(messages) => {
                retry.reset();
                messages
            }
            Err(e) => {
                let delay = retry.get_delay(&config.retry);
                error!(
                    error = %e,
                    attempt = retry.attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "Failed to receive messages"
                );
                retry.next_attempt();
                if !pause(delay, &cancel).await {
                    break;
                }
                continue;
            }
        };

        if !messages.is_empty() {
            debug!(count = messages.len(), "Received messages");
        }

        for raw in messages {
            let message_id = raw.message_id.clone();
            let message = match wrapper(raw, ack.clone()) {
                Ok(message) => message,
                Err(e) => {
                    warn!(
                        message_id = %message_id,
                        error = %e,
                        "Failed to wrap message; leaving it for redelivery"
                    );
                    continue;
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'receive,
                sent = outbound.send(message) => {
                    if sent.is_err() {
                        warn!("Message channel closed; stopping receive loop");
                        break 'receive;
                    }
                }
            }
        }
    }

    info!("Receive loop stopped");
}

async fn delete_loop(
    backend: Arc<dyn QueueBackend>,
    policy: RetryPolicy,
    mut acks: mpsc::Receiver<RawMessage>,
    cancel: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Later acks fail fast instead of waiting on a dead loop
                acks.close();
                break;
            }
            next = acks.recv() => match next {
                Some(raw) => raw,
                None => break,
            },
        };

        delete_with_retry(backend.as_ref(), &policy, &raw, &cancel).await;
    }

    info!("Delete loop stopped");
}

async fn delete_with_retry(
    backend: &dyn QueueBackend,
    policy: &RetryPolicy,
    raw: &RawMessage,
    cancel: &CancellationToken,
) {
    let mut retry = RetryState::new();
    loop {
        match backend.delete_one(&raw.receipt_handle).await {
            Ok(()) => {
                debug!(message_id = %raw.message_id, "Deleted acknowledged message");
                return;
            }
            Err(e) if e.is_transient() && retry.can_retry(policy) => {
                let delay = retry.get_delay(policy);
                warn!(
                    message_id = %raw.message_id,
                    error = %e,
                    attempt = retry.attempt + 1,
                    retry_in_ms = delay.as_millis() as u64,
                    "Failed to delete message, retrying"
                );
                retry.next_attempt();
                if !pause(delay, cancel).await {
                    return;
                }
            }
            Err(e) => {
                error!(
                    message_id = %raw.message_id,
                    error = %e,
                    "Failed to delete message; it will be redelivered"
                );
                return;
            }
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancel.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        // Still yield so a failing backend cannot starve the runtime
        tokio::task::yield_now().await;
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
