//! In-memory queue and topic backends for testing and local development.
//!
//! [`InMemoryQueue`] models the parts of a hosted queue the pipelines rely
//! on:
//! - received messages move to an in-flight set until deleted,
//! - [`InMemoryQueue::requeue_in_flight`] stands in for visibility timeout
//!   expiry and makes undeleted messages visible again,
//! - receives long-poll for up to the requested wait time,
//! - per-message delivery delays are honoured.
//!
//! [`InMemoryTopic`] fans every publish out to its subscribed queues, like a
//! topic with raw message delivery: subscribers get the body and attributes.

use crate::backend::{
    BatchRequestEntry, BatchResponse, BatchResultEntry, BatchResultErrorEntry, PublishRequest,
    QueueBackend, RawMessage, SendRequest, TopicBackend,
};
use crate::error::QueueError;
use crate::message::MessageAttribute;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A message stored in the queue with metadata
#[derive(Clone)]
struct StoredMessage {
    message_id: String,
    /// Send order, used to restore ordering on requeue
    sequence: u64,
    body: String,
    attributes: HashMap<String, MessageAttribute>,
    sent_timestamp: i64,
    receive_count: u32,
    available_at: Instant,
}

impl StoredMessage {
    fn deliver(&mut self) -> RawMessage {
        self.receive_count += 1;

        let mut system_attributes = HashMap::new();
        system_attributes.insert(
            "ApproximateReceiveCount".to_string(),
            self.receive_count.to_string(),
        );
        system_attributes.insert("SentTimestamp".to_string(), self.sent_timestamp.to_string());

        RawMessage {
            message_id: self.message_id.clone(),
            receipt_handle: Uuid::new_v4().to_string(),
            body: self.body.clone(),
            attributes: self.attributes.clone(),
            system_attributes,
            md5_of_body: None,
        }
    }
}

#[derive(Default)]
struct QueueState {
    /// Messages waiting to be received, in send order
    visible: VecDeque<StoredMessage>,
    /// Received but not yet deleted, keyed by receipt handle
    in_flight: HashMap<String, StoredMessage>,
    next_sequence: u64,
}

// ============================================================================
// Queue
// ============================================================================

/// Thread-safe in-memory queue implementing [`QueueBackend`].
pub struct InMemoryQueue {
    name: String,
    state: Mutex<QueueState>,
    arrivals: Notify,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("InMemoryQueue")
            .field("name", &self.name)
            .field("visible", &state.visible.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::named("in-memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            arrivals: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Messages waiting to be received, delayed ones included
    pub fn visible_len(&self) -> usize {
        self.lock().visible.len()
    }

    /// Messages received but not yet deleted
    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Make every undeleted delivery visible again, as if its visibility
    /// timeout had expired. Returns the number of requeued messages.
    pub fn requeue_in_flight(&self) -> usize {
        let count = {
            let mut state = self.lock();
            let mut requeued: Vec<StoredMessage> =
                state.in_flight.drain().map(|(_, message)| message).collect();
            requeued.sort_by_key(|m| m.sequence);
            let count = requeued.len();
            // Redeliveries go ahead of newer messages
            for message in requeued.into_iter().rev() {
                state.visible.push_front(message);
            }
            count
        };

        if count > 0 {
            debug!(queue = %self.name, count, "Requeued in-flight messages");
            self.arrivals.notify_waiters();
        }
        count
    }

    fn enqueue(
        &self,
        body: String,
        attributes: HashMap<String, MessageAttribute>,
        delay_seconds: u32,
    ) -> String {
        let message_id = Uuid::new_v4().to_string();
        let mut state = self.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        state.visible.push_back(StoredMessage {
            message_id: message_id.clone(),
            sequence,
            body,
            attributes,
            sent_timestamp: chrono::Utc::now().timestamp_millis(),
            receive_count: 0,
            available_at: Instant::now() + Duration::from_secs(u64::from(delay_seconds)),
        });
        drop(state);

        self.arrivals.notify_waiters();
        message_id
    }

    /// Take up to `max` available messages; also reports when the next
    /// delayed message becomes available
    fn take_available(&self, max: usize) -> (Vec<RawMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut state = self.lock();
        let mut taken = Vec::new();
        let mut next_available: Option<Instant> = None;
        let mut index = 0;

        while index < state.visible.len() && taken.len() < max {
            let available_at = state.visible[index].available_at;
            if available_at > now {
                next_available = Some(next_available.map_or(available_at, |t| t.min(available_at)));
                index += 1;
                continue;
            }
            if let Some(mut message) = state.visible.remove(index) {
                let raw = message.deliver();
                state.in_flight.insert(raw.receipt_handle.clone(), message);
                taken.push(raw);
            }
        }

        (taken, next_available)
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    async fn receive_batch(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, QueueError> {
        let max = max_messages.max(1) as usize;
        let deadline = Instant::now() + wait;

        loop {
            let arrival = self.arrivals.notified();
            tokio::pin!(arrival);
            // Register before looking so a concurrent send cannot be missed
            arrival.as_mut().enable();

            let (messages, next_available) = self.take_available(max);
            if !messages.is_empty() || Instant::now() >= deadline {
                return Ok(messages);
            }

            let wake_at = next_available.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = &mut arrival => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete_one(&self, receipt_handle: &str) -> Result<(), QueueError> {
        match self.lock().in_flight.remove(receipt_handle) {
            Some(_) => Ok(()),
            None => Err(QueueError::InvalidReceipt {
                receipt: receipt_handle.to_string(),
            }),
        }
    }

    async fn send_one(&self, request: SendRequest) -> Result<String, QueueError> {
        if request.body.is_empty() {
            return Err(QueueError::ProviderError {
                provider: "in-memory".to_string(),
                code: "MissingParameter".to_string(),
                message: "message body must not be empty".to_string(),
            });
        }
        Ok(self.enqueue(request.body, request.attributes, request.delay_seconds))
    }

    async fn send_batch(
        &self,
        entries: Vec<BatchRequestEntry>,
    ) -> Result<BatchResponse, QueueError> {
        let mut response = BatchResponse::default();

        for entry in entries {
            if entry.body.is_empty() {
                response.failed.push(BatchResultErrorEntry {
                    id: entry.id,
                    code: "MissingParameter".to_string(),
                    message: "message body must not be empty".to_string(),
                    sender_fault: true,
                });
                continue;
            }

            let message_id = self.enqueue(entry.body, entry.attributes, entry.delay_seconds);
            response.successful.push(BatchResultEntry {
                id: entry.id,
                message_id,
            });
        }

        Ok(response)
    }
}

// ============================================================================
// Topic
// ============================================================================

/// In-memory topic implementing [`TopicBackend`].
pub struct InMemoryTopic {
    name: String,
    subscribers: RwLock<Vec<Arc<InMemoryQueue>>>,
}

impl std::fmt::Debug for InMemoryTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTopic")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl InMemoryTopic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Deliver every future publish to `queue`
    pub fn subscribe(&self, queue: Arc<InMemoryQueue>) {
        debug!(topic = %self.name, queue = %queue.name(), "Subscribed queue to topic");
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(queue);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl TopicBackend for InMemoryTopic {
    fn topic(&self) -> &str {
        &self.name
    }

    async fn publish(&self, request: PublishRequest) -> Result<String, QueueError> {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for queue in subscribers {
            queue.enqueue(request.body.clone(), request.attributes.clone(), 0);
        }

        Ok(Uuid::new_v4().to_string())
    }
}
