//! Scripted backends shared by the unit tests.

use crate::backend::{
    BatchRequestEntry, BatchResponse, BatchResultEntry, PublishRequest, QueueBackend, RawMessage,
    SendRequest, TopicBackend,
};
use crate::error::QueueError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub(crate) fn raw(n: usize) -> RawMessage {
    RawMessage {
        message_id: format!("msg-{}", n),
        receipt_handle: format!("receipt-{}", n),
        body: format!("body-{}", n),
        ..RawMessage::default()
    }
}

pub(crate) fn connection_error() -> QueueError {
    QueueError::ConnectionFailed {
        message: "connection reset".to_string(),
    }
}

/// Let spawned loops run without moving the (paused) clock.
pub(crate) async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Poll `condition` until it holds, advancing time in small steps.
pub(crate) async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Queue backend answering from per-operation scripts and recording every
/// call. An exhausted receive script parks the caller until it is dropped;
/// exhausted send scripts succeed.
#[derive(Default)]
pub(crate) struct ScriptedQueue {
    receives: Mutex<VecDeque<Result<Vec<RawMessage>, QueueError>>>,
    delete_results: Mutex<VecDeque<Result<(), QueueError>>>,
    send_results: Mutex<VecDeque<Result<String, QueueError>>>,
    batch_results: Mutex<VecDeque<Result<BatchResponse, QueueError>>>,
    send_gate: Option<Arc<Semaphore>>,
    delete_gate: Option<Arc<Semaphore>>,

    pub receive_calls: AtomicUsize,
    pub receive_requests: Mutex<Vec<(u32, Duration)>>,
    pub deletes: Mutex<Vec<String>>,
    pub sends: Mutex<Vec<SendRequest>>,
    pub batches: Mutex<Vec<Vec<BatchRequestEntry>>>,
}

impl ScriptedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send waits for a permit from the returned semaphore
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let queue = Self {
            send_gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (queue, gate)
    }

    /// Every delete waits for a permit from the returned semaphore
    pub fn gated_deletes() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let queue = Self {
            delete_gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (queue, gate)
    }

    pub fn push_receive(&self, result: Result<Vec<RawMessage>, QueueError>) {
        self.receives.lock().unwrap().push_back(result);
    }

    pub fn push_delete(&self, result: Result<(), QueueError>) {
        self.delete_results.lock().unwrap().push_back(result);
    }

    pub fn push_send(&self, result: Result<String, QueueError>) {
        self.send_results.lock().unwrap().push_back(result);
    }

    pub fn push_batch(&self, result: Result<BatchResponse, QueueError>) {
        self.batch_results.lock().unwrap().push_back(result);
    }

    pub fn receive_count(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn sent_bodies(&self) -> Vec<String> {
        self.sends
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.body.clone())
            .collect()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }

    async fn pass_gate(gate: &Option<Arc<Semaphore>>) {
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
    }
}

#[async_trait]
impl QueueBackend for ScriptedQueue {
    async fn receive_batch(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, QueueError> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        self.receive_requests
            .lock()
            .unwrap()
            .push((max_messages, wait));
        let next = self.receives.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn delete_one(&self, receipt_handle: &str) -> Result<(), QueueError> {
        Self::pass_gate(&self.delete_gate).await;
        self.deletes.lock().unwrap().push(receipt_handle.to_string());
        self.delete_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn send_one(&self, request: SendRequest) -> Result<String, QueueError> {
        Self::pass_gate(&self.send_gate).await;
        let n = {
            let mut sends = self.sends.lock().unwrap();
            sends.push(request);
            sends.len()
        };
        self.send_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("sent-{}", n)))
    }

    async fn send_batch(
        &self,
        entries: Vec<BatchRequestEntry>,
    ) -> Result<BatchResponse, QueueError> {
        Self::pass_gate(&self.send_gate).await;
        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        let batch_no = {
            let mut batches = self.batches.lock().unwrap();
            batches.push(entries);
            batches.len()
        };
        let scripted = self.batch_results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(BatchResponse {
                failed: vec![],
                successful: ids
                    .into_iter()
                    .map(|id| BatchResultEntry {
                        message_id: format!("batch-{}-{}", batch_no, id),
                        id,
                    })
                    .collect(),
            })
        })
    }
}

/// Topic backend recording publishes.
#[derive(Default)]
pub(crate) struct ScriptedTopic {
    topic: String,
    results: Mutex<VecDeque<Result<String, QueueError>>>,
    pub publishes: Mutex<Vec<PublishRequest>>,
}

impl ScriptedTopic {
    pub fn new() -> Self {
        Self::named("arn:aws:sns:us-east-1:123456789012:orders")
    }

    pub fn named(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            ..Self::default()
        }
    }

    pub fn push_result(&self, result: Result<String, QueueError>) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn published(&self) -> Vec<PublishRequest> {
        self.publishes.lock().unwrap().clone()
    }
}

#[async_trait]
impl TopicBackend for ScriptedTopic {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, request: PublishRequest) -> Result<String, QueueError> {
        let n = {
            let mut publishes = self.publishes.lock().unwrap();
            publishes.push(request);
            publishes.len()
        };
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("topic-{}", n)))
    }
}
