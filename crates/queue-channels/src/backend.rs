//! Backend port: the narrow set of operations the pipelines need from a
//! queue or topic service.
//!
//! The consumer and publisher loops only ever talk to these traits. Concrete
//! adapters live in [`crate::providers`]; provisioning and subscription
//! wiring happen when an adapter is constructed and are not part of the port.

use crate::error::QueueError;
use crate::message::MessageAttribute;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// A message exactly as the backend returned it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawMessage {
    /// Backend-assigned message id
    pub message_id: String,
    /// Opaque token required to delete (acknowledge) this delivery
    pub receipt_handle: String,
    pub body: String,
    pub attributes: HashMap<String, MessageAttribute>,
    /// Attributes maintained by the backend, e.g. `ApproximateReceiveCount`
    pub system_attributes: HashMap<String, String>,
    pub md5_of_body: Option<String>,
}

/// Request for a single send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub body: String,
    pub attributes: HashMap<String, MessageAttribute>,
    pub delay_seconds: u32,
}

/// One entry of a batch send, keyed by a client-assigned correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequestEntry {
    pub id: String,
    pub body: String,
    pub attributes: HashMap<String, MessageAttribute>,
    pub delay_seconds: u32,
}

/// Successful entry of a batch send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResultEntry {
    /// Correlation id of the request entry
    pub id: String,
    /// Id assigned by the backend
    pub message_id: String,
}

/// Failed entry of a batch send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResultErrorEntry {
    /// Correlation id of the request entry
    pub id: String,
    pub code: String,
    pub message: String,
    pub sender_fault: bool,
}

/// Result of a batch send that the backend accepted as a whole.
///
/// Individual entries may still have failed. The response lists are in no
/// particular order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResponse {
    pub failed: Vec<BatchResultErrorEntry>,
    pub successful: Vec<BatchResultEntry>,
}

/// Request for a topic publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub body: String,
    pub subject: Option<String>,
    pub attributes: HashMap<String, MessageAttribute>,
}

/// Queue operations used by [`crate::Consumer`] and [`crate::Publisher`].
///
/// Implementations are shared between concurrently running loops and must
/// be safe to call from several tasks at once.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Receive up to `max_messages`, long-polling for at most `wait`
    async fn receive_batch(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, QueueError>;

    /// Delete (acknowledge) one delivery
    async fn delete_one(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Send one message, returning the backend-assigned id
    async fn send_one(&self, request: SendRequest) -> Result<String, QueueError>;

    /// Send several messages in one call
    async fn send_batch(
        &self,
        entries: Vec<BatchRequestEntry>,
    ) -> Result<BatchResponse, QueueError>;
}

/// Topic operations used by [`crate::TopicPublisher`].
#[async_trait]
pub trait TopicBackend: Send + Sync {
    /// Identifier of the topic published to; empty when none is configured
    fn topic(&self) -> &str;

    /// Publish one message, returning the backend-assigned id
    async fn publish(&self, request: PublishRequest) -> Result<String, QueueError>;
}
