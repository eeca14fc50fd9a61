//! Message types for the consumer and publisher pipelines.
//!
//! Received messages implement [`BaseMessage`] (acknowledge, inspect), messages
//! handed to a publisher implement [`PublishMessage`] (inspect, record the
//! outcome). [`InboundMessage`] and [`OutboundMessage`] are the default
//! implementations.

use crate::backend::RawMessage;
use crate::error::QueueError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;

// ============================================================================
// Attributes
// ============================================================================

/// A typed message attribute. The value is always carried as a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttribute {
    /// Backend type tag, e.g. `String` or `Number`
    pub data_type: String,
    pub value: String,
}

impl MessageAttribute {
    pub fn new(data_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            data_type: data_type.into(),
            value: value.into(),
        }
    }

    /// Attribute with the `String` type tag
    pub fn string(value: impl Into<String>) -> Self {
        Self::new("String", value)
    }

    /// Attribute with the `Number` type tag
    pub fn number(value: impl std::fmt::Display) -> Self {
        Self::new("Number", value.to_string())
    }
}

// ============================================================================
// Acknowledgement
// ============================================================================

/// Sending half of a consumer's acknowledgement channel.
///
/// Handed to the wrap callback for every received message so the wrapped
/// message can hand its raw delivery back for deletion.
#[derive(Debug, Clone)]
pub struct AckSender {
    tx: mpsc::Sender<RawMessage>,
}

impl AckSender {
    /// Create a standalone acknowledgement channel.
    ///
    /// Consumers build their own; this is for driving custom wrappers in
    /// isolation.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RawMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a delivery for deletion.
    ///
    /// Returns `false` when the consumer has already shut its delete loop
    /// down; the delivery will then be redelivered by the backend.
    pub async fn send(&self, raw: RawMessage) -> bool {
        match self.tx.send(raw).await {
            Ok(()) => true,
            Err(mpsc::error::SendError(raw)) => {
                warn!(
                    message_id = %raw.message_id,
                    "Acknowledgement channel closed; message will be redelivered"
                );
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Behaviour shared by every message a consumer yields.
#[async_trait]
pub trait BaseMessage: Send + Sync + 'static {
    /// Acknowledge the message so the backend deletes it
    async fn ack(&self);

    /// Negative acknowledgement. The backend's visibility timeout is the only
    /// redelivery trigger, so this does nothing by default.
    fn nack(&self) {}

    fn body(&self) -> &str;

    fn attributes(&self) -> &HashMap<String, MessageAttribute>;

    /// Backend-assigned id of the delivery
    fn message_id(&self) -> &str;

    /// Application-level identity; starts out as the backend message id
    fn id(&self) -> &str;

    fn set_id(&mut self, id: String);

    /// Processing error recorded against this message, if any
    fn error(&self) -> Option<&Arc<QueueError>>;

    fn set_error(&mut self, error: Arc<QueueError>);
}

/// Callback turning a raw delivery into the consumer's message type.
///
/// A failing wrapper drops that delivery without acknowledging it.
pub type MessageWrapper<M> =
    Arc<dyn Fn(RawMessage, AckSender) -> Result<M, QueueError> + Send + Sync>;

// ============================================================================
// Inbound messages
// ============================================================================

/// Default received message: the raw delivery plus its acknowledgement path.
#[derive(Debug)]
pub struct InboundMessage {
    raw: RawMessage,
    ack: AckSender,
    acked: AtomicBool,
    id: String,
    error: Option<Arc<QueueError>>,
}

impl InboundMessage {
    /// Default [`MessageWrapper`] implementation. Never fails.
    pub fn wrap(raw: RawMessage, ack: AckSender) -> Result<Self, QueueError> {
        Ok(Self {
            id: raw.message_id.clone(),
            raw,
            ack,
            acked: AtomicBool::new(false),
            error: None,
        })
    }

    pub fn receipt_handle(&self) -> &str {
        &self.raw.receipt_handle
    }

    pub fn raw(&self) -> &RawMessage {
        &self.raw
    }

    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }
}

#[async_trait]
impl BaseMessage for InboundMessage {
    async fn ack(&self) {
        // Only the first ack reaches the delete loop
        if self.acked.swap(true, Ordering::AcqRel) {
            debug!(message_id = %self.raw.message_id, "Message already acknowledged");
            return;
        }
        self.ack.send(self.raw.clone()).await;
    }

    fn body(&self) -> &str {
        &self.raw.body
    }

    fn attributes(&self) -> &HashMap<String, MessageAttribute> {
        &self.raw.attributes
    }

    fn message_id(&self) -> &str {
        &self.raw.message_id
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn error(&self) -> Option<&Arc<QueueError>> {
        self.error.as_ref()
    }

    fn set_error(&mut self, error: Arc<QueueError>) {
        self.error = Some(error);
    }
}

/// Received message whose body was decoded as JSON.
#[derive(Debug)]
pub struct DecodedMessage<T> {
    inner: InboundMessage,
    payload: T,
}

impl<T> DecodedMessage<T> {
    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_parts(self) -> (InboundMessage, T) {
        (self.inner, self.payload)
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> BaseMessage for DecodedMessage<T> {
    async fn ack(&self) {
        self.inner.ack().await
    }

    fn body(&self) -> &str {
        self.inner.body()
    }

    fn attributes(&self) -> &HashMap<String, MessageAttribute> {
        self.inner.attributes()
    }

    fn message_id(&self) -> &str {
        self.inner.message_id()
    }

    fn id(&self) -> &str {
        self.inner.id()
    }

    fn set_id(&mut self, id: String) {
        self.inner.set_id(id)
    }

    fn error(&self) -> Option<&Arc<QueueError>> {
        self.inner.error()
    }

    fn set_error(&mut self, error: Arc<QueueError>) {
        self.inner.set_error(error)
    }
}

/// Wrapper that decodes each body as JSON into `T`.
///
/// Bodies that do not decode are dropped and left for redelivery.
pub fn json_wrapper<T>() -> MessageWrapper<DecodedMessage<T>>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    Arc::new(|raw: RawMessage, ack: AckSender| {
        let payload = serde_json::from_str::<T>(&raw.body).map_err(|e| QueueError::WrapFailed {
            message_id: raw.message_id.clone(),
            reason: e.to_string(),
        })?;
        Ok(DecodedMessage {
            inner: InboundMessage::wrap(raw, ack)?,
            payload,
        })
    })
}

// ============================================================================
// Outbound messages
// ============================================================================

/// Result of handing a message to a publisher.
#[derive(Debug, Clone)]
pub enum PublishOutcome {
    /// The backend accepted the message and assigned it this id
    Published { message_id: String },
    /// The send failed. Messages of one failed batch share the same error.
    Failed(Arc<QueueError>),
}

/// Behaviour a publisher needs from the messages it sends.
pub trait PublishMessage: Send + Sync + 'static {
    fn body(&self) -> &str;

    /// Routing hint for topic publishes
    fn subject(&self) -> Option<&str>;

    fn attributes(&self) -> &HashMap<String, MessageAttribute>;

    fn set_error(&self, error: Arc<QueueError>);

    fn set_id(&self, message_id: String);
}

/// Callback serializing a message body at publish time.
pub type MessageMarshaller<M> = Arc<dyn Fn(&M) -> Result<Vec<u8>, QueueError> + Send + Sync>;

/// Default marshaller: the body is already serialized and is sent as is.
pub fn pass_through<M: PublishMessage>() -> MessageMarshaller<M> {
    Arc::new(|msg: &M| Ok(msg.body().as_bytes().to_vec()))
}

/// Default outbound message.
///
/// Clones share one outcome cell: keep a clone, hand the original to a
/// publisher, then read [`OutboundMessage::outcome`] or await
/// [`OutboundMessage::wait_outcome`].
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    body: String,
    subject: Option<String>,
    attributes: HashMap<String, MessageAttribute>,
    outcome: Arc<watch::Sender<Option<PublishOutcome>>>,
}

impl OutboundMessage {
    pub fn new(body: impl Into<String>) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            body: body.into(),
            subject: None,
            attributes: HashMap::new(),
            outcome: Arc::new(outcome),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, attribute: MessageAttribute) -> Self {
        self.add_attribute(name, attribute);
        self
    }

    pub fn add_attribute(&mut self, name: impl Into<String>, attribute: MessageAttribute) {
        self.attributes.insert(name.into(), attribute);
    }

    /// Current outcome, `None` until the publisher has handled the message
    pub fn outcome(&self) -> Option<PublishOutcome> {
        self.outcome.borrow().clone()
    }

    /// Backend-assigned id once published
    pub fn id(&self) -> Option<String> {
        match &*self.outcome.borrow() {
            Some(PublishOutcome::Published { message_id }) => Some(message_id.clone()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<Arc<QueueError>> {
        match &*self.outcome.borrow() {
            Some(PublishOutcome::Failed(err)) => Some(Arc::clone(err)),
            _ => None,
        }
    }

    /// Wait until the publisher records an outcome.
    ///
    /// Messages dropped by a cancelled publisher never get one, so callers
    /// should bound this with a timeout when shutting down.
    pub async fn wait_outcome(&self) -> PublishOutcome {
        let mut rx = self.outcome.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            // The sender lives inside `self`, so the channel cannot close here
            let _ = rx.changed().await;
        }
    }
}

impl PublishMessage for OutboundMessage {
    fn body(&self) -> &str {
        &self.body
    }

    fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    fn attributes(&self) -> &HashMap<String, MessageAttribute> {
        &self.attributes
    }

    fn set_error(&self, error: Arc<QueueError>) {
        self.outcome.send_replace(Some(PublishOutcome::Failed(error)));
    }

    fn set_id(&self, message_id: String) {
        self.outcome
            .send_replace(Some(PublishOutcome::Published { message_id }));
    }
}
