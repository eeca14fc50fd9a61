//! Publisher pipeline: accept messages over a channel and send them to a
//! queue, one at a time or in batches.
//!
//! With batching enabled, messages collect in a buffer that is flushed
//! either when it reaches the batch size or when the flush timer fires,
//! whichever comes first. A size-triggered flush restarts the timer so a
//! freshly emptied buffer is not flushed again moments later.
//!
//! Outcomes are recorded on the messages themselves through
//! [`PublishMessage::set_id`] and [`PublishMessage::set_error`]; nothing is
//! reported back over the channel.

use crate::backend::{BatchRequestEntry, QueueBackend, SendRequest};
use crate::batch::{apply_batch_response, correlation_id};
use crate::config::PublisherConfig;
use crate::error::QueueError;
use crate::lifecycle::Lifecycle;
use crate::message::{pass_through, MessageMarshaller, OutboundMessage, PublishMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "publisher_tests.rs"]
mod tests;

/// Queue publisher accepting messages of type `M`.
pub struct Publisher<M: PublishMessage = OutboundMessage> {
    backend: Arc<dyn QueueBackend>,
    config: PublisherConfig,
    marshaller: MessageMarshaller<M>,
    lifecycle: Lifecycle<mpsc::Sender<M>>,
}

impl Publisher<OutboundMessage> {
    /// Publisher sending [`OutboundMessage`] bodies unchanged
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        config: PublisherConfig,
    ) -> Result<Self, QueueError> {
        Self::with_marshaller(backend, config, pass_through())
    }
}

impl<M: PublishMessage> Publisher<M> {
    pub fn with_marshaller(
        backend: Arc<dyn QueueBackend>,
        config: PublisherConfig,
        marshaller: MessageMarshaller<M>,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            backend,
            config,
            marshaller,
            lifecycle: Lifecycle::new(),
        })
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Start the publish loop and return the channel to send messages on.
    ///
    /// The channel holds a single message, so senders are paced by the loop.
    /// Messages still buffered when the publisher stops are dropped without
    /// an outcome.
    pub fn start(&self, cancel: &CancellationToken) -> mpsc::Sender<M> {
        self.lifecycle.start(cancel, |cancel| {
            let (tx, rx) = mpsc::channel(1);

            info!(
                batch_size = self.config.batch_size,
                flush_interval_ms = self.config.flush_interval_ms,
                delay_seconds = self.config.delay_seconds,
                "Starting publisher"
            );

            let task = tokio::spawn(publish_loop(
                Arc::clone(&self.backend),
                self.config.clone(),
                Arc::clone(&self.marshaller),
                rx,
                cancel,
            ));

            (tx, vec![task])
        })
    }

    /// Signal the loop to stop. Returns [`QueueError::NotStarted`] if the
    /// publisher was never started.
    pub fn stop(&self) -> Result<(), QueueError> {
        self.lifecycle.stop()
    }

    /// Stop and wait for the loop to exit
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        self.lifecycle.shutdown().await
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }
}

/// Periodic timer whose first tick is one full period away
fn flush_timer(period: Duration) -> Interval {
    let now = Instant::now();
    let start = now.checked_add(period).unwrap_or(now);
    let mut timer = tokio::time::interval_at(start, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn publish_loop<M: PublishMessage>(
    backend: Arc<dyn QueueBackend>,
    config: PublisherConfig,
    marshaller: MessageMarshaller<M>,
    mut inbound: mpsc::Receiver<M>,
    cancel: CancellationToken,
) {
    let period = config.flush_interval();
    let capacity = config.batch_capacity();
    let mut timer = flush_timer(period);
    let mut buffer: Vec<M> = Vec::with_capacity(capacity);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                inbound.close();
                if !buffer.is_empty() {
                    warn!(count = buffer.len(), "Publisher stopped; dropping unsent messages");
                }
                break;
            }
            _ = timer.tick() => {
                if !buffer.is_empty() {
                    send_batch(backend.as_ref(), &marshaller, config.delay_seconds, &buffer).await;
                    buffer.clear();
                }
            }
            next = inbound.recv() => {
                let Some(message) = next else {
                    // Every sender is gone, nothing more can arrive
                    if !buffer.is_empty() {
                        send_batch(backend.as_ref(), &marshaller, config.delay_seconds, &buffer).await;
                    }
                    break;
                };

                if !config.batching_enabled() {
                    send_single(backend.as_ref(), &marshaller, config.delay_seconds, &message).await;
                    continue;
                }

                buffer.push(message);
                if buffer.len() >= capacity {
                    send_batch(backend.as_ref(), &marshaller, config.delay_seconds, &buffer).await;
                    buffer.clear();
                    timer = flush_timer(period);
                }
            }
        }
    }

    info!("Publish loop stopped");
}

/// Run the marshaller and turn its bytes into a message body
pub(crate) fn marshal_body<M>(marshaller: &MessageMarshaller<M>, message: &M) -> Result<String, QueueError> {
    let bytes = marshaller(message)?;
    String::from_utf8(bytes).map_err(|e| QueueError::MarshalFailed {
        reason: format!("body is not valid UTF-8: {}", e),
    })
}

async fn send_single<M: PublishMessage>(
    backend: &dyn QueueBackend,
    marshaller: &MessageMarshaller<M>,
    delay_seconds: u32,
    message: &M,
) {
    let body = match marshal_body(marshaller, message) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Failed to marshal message");
            message.set_error(Arc::new(e));
            return;
        }
    };

    let request = SendRequest {
        body,
        attributes: message.attributes().clone(),
        delay_seconds,
    };

    match backend.send_one(request).await {
        Ok(message_id) => {
            debug!(message_id = %message_id, "Published message");
            message.set_id(message_id);
        }
        Err(e) => {
            error!(error = %e, "Failed to publish message");
            message.set_error(Arc::new(e));
        }
    }
}

async fn send_batch<M: PublishMessage>(
    backend: &dyn QueueBackend,
    marshaller: &MessageMarshaller<M>,
    delay_seconds: u32,
    buffer: &[M],
) {
    let mut slots = HashMap::with_capacity(buffer.len());
    let mut entries = Vec::with_capacity(buffer.len());

    for (slot, message) in buffer.iter().enumerate() {
        let body = match marshal_body(marshaller, message) {
            Ok(body) => body,
            Err(e) => {
                warn!(slot, error = %e, "Failed to marshal message; leaving it out of the batch");
                message.set_error(Arc::new(e));
                continue;
            }
        };

        let id = correlation_id(slot);
        slots.insert(id.clone(), slot);
        entries.push(BatchRequestEntry {
            id,
            body,
            attributes: message.attributes().clone(),
            delay_seconds,
        });
    }

    if entries.is_empty() {
        return;
    }

    let count = entries.len();
    match backend.send_batch(entries).await {
        Ok(response) => {
            let summary = apply_batch_response(buffer, &slots, response);
            debug!(
                count,
                published = summary.published,
                "Published batch"
            );
        }
        Err(e) => {
            error!(count, error = %e, "Failed to publish batch");
            let shared = Arc::new(e);
            for &slot in slots.values() {
                buffer[slot].set_error(Arc::clone(&shared));
            }
        }
    }
}
