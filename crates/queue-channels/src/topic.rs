//! Topic publisher: fan messages out through a notification topic.
//!
//! Unlike [`crate::Publisher`] there is no batching. Each message is
//! published on its own, with its subject and attributes, as soon as the
//! loop takes it off the channel.

use crate::backend::{PublishRequest, TopicBackend};
use crate::config::PublisherConfig;
use crate::error::QueueError;
use crate::lifecycle::Lifecycle;
use crate::message::{pass_through, MessageMarshaller, OutboundMessage, PublishMessage};
use crate::publisher::marshal_body;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "topic_tests.rs"]
mod tests;

pub struct TopicPublisher<M: PublishMessage = OutboundMessage> {
    backend: Arc<dyn TopicBackend>,
    config: PublisherConfig,
    marshaller: MessageMarshaller<M>,
    lifecycle: Lifecycle<mpsc::Sender<M>>,
}

impl TopicPublisher<OutboundMessage> {
    pub fn new(
        backend: Arc<dyn TopicBackend>,
        config: PublisherConfig,
    ) -> Result<Self, QueueError> {
        Self::with_marshaller(backend, config, pass_through())
    }
}

impl<M: PublishMessage> TopicPublisher<M> {
    /// Fails with [`QueueError::MissingTopic`] when the backend has no topic
    pub fn with_marshaller(
        backend: Arc<dyn TopicBackend>,
        config: PublisherConfig,
        marshaller: MessageMarshaller<M>,
    ) -> Result<Self, QueueError> {
        if backend.topic().is_empty() {
            return Err(QueueError::MissingTopic);
        }
        config.validate()?;

        Ok(Self {
            backend,
            config,
            marshaller,
            lifecycle: Lifecycle::new(),
        })
    }

    pub fn topic(&self) -> &str {
        self.backend.topic()
    }

    /// Start the publish loop. The returned channel buffers up to the
    /// configured batch size.
    pub fn start(&self, cancel: &CancellationToken) -> mpsc::Sender<M> {
        self.lifecycle.start(cancel, |cancel| {
            let (tx, rx) = mpsc::channel(self.config.batch_capacity());

            info!(topic = %self.backend.topic(), "Starting topic publisher");
            let task = tokio::spawn(topic_loop(
                Arc::clone(&self.backend),
                Arc::clone(&self.marshaller),
                rx,
                cancel,
            ));

            (tx, vec![task])
        })
    }

    pub fn stop(&self) -> Result<(), QueueError> {
        self.lifecycle.stop()
    }

    pub async fn shutdown(&self) -> Result<(), QueueError> {
        self.lifecycle.shutdown().await
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }
}

async fn topic_loop<M: PublishMessage>(
    backend: Arc<dyn TopicBackend>,
    marshaller: MessageMarshaller<M>,
    mut inbound: mpsc::Receiver<M>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                inbound.close();
                break;
            }
            next = inbound.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };

        publish_one(backend.as_ref(), &marshaller, &message).await;
    }

    info!(topic = %backend.topic(), "Topic publish loop stopped");
}

async fn publish_one<M: PublishMessage>(
    backend: &dyn TopicBackend,
    marshaller: &MessageMarshaller<M>,
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

    let request = PublishRequest {
        body,
        subject: message.subject().map(str::to_string),
        attributes: message.attributes().clone(),
    };

    match backend.publish(request).await {
        Ok(message_id) => {
            debug!(topic = %backend.topic(), message_id = %message_id, "Published to topic");
            message.set_id(message_id);
        }
        Err(e) => {
            error!(topic = %backend.topic(), error = %e, "Failed to publish to topic");
            message.set_error(Arc::new(e));
        }
    }
}
