//! Tests for the publisher pipeline.
//!
//! Timer-driven tests run on a paused clock and move it explicitly with
//! `tokio::time::advance`.

use super::*;
use crate::backend::{BatchResponse, BatchResultEntry, BatchResultErrorEntry};
use crate::message::{MessageAttribute, PublishOutcome};
use crate::test_support::{connection_error, settle, ScriptedQueue};
use tokio::sync::mpsc::error::TrySendError;

const FLUSH_MS: u64 = 1_000;

fn batching(batch_size: i32) -> PublisherConfig {
    PublisherConfig {
        batch_size,
        flush_interval_ms: FLUSH_MS,
        delay_seconds: 0,
    }
}

fn publisher_for(queue: &Arc<ScriptedQueue>, config: PublisherConfig) -> Publisher {
    let backend: Arc<dyn QueueBackend> = Arc::clone(queue) as Arc<dyn QueueBackend>;
    Publisher::new(backend, config).unwrap()
}

/// Send `count` messages and keep a clone of each to inspect outcomes
async fn send_all(tx: &mpsc::Sender<OutboundMessage>, count: usize) -> Vec<OutboundMessage> {
    let mut sent = Vec::new();
    for i in 0..count {
        let message = OutboundMessage::new(format!("m{}", i));
        tx.send(message.clone()).await.unwrap();
        sent.push(message);
    }
    sent
}

mod single_send {
    use super::*;

    /// Each message is fully sent before the loop accepts the next
    #[tokio::test(start_paused = true)]
    async fn test_disabled_batching_is_serialized() {
        let (queue, gate) = ScriptedQueue::gated();
        let queue = Arc::new(queue);
        let publisher = publisher_for(&queue, batching(0));
        let cancel = CancellationToken::new();
        let tx = publisher.start(&cancel);

        let first = OutboundMessage::new("one");
        tx.send(first.clone()).await.unwrap();
        settle().await;
        tx.send(OutboundMessage::new("two")).await.unwrap();
        settle().await;

        // Loop is stuck sending "one" and "two" occupies the channel
        assert!(matches!(
            tx.try_send(OutboundMessage::new("three")),
            Err(TrySendError::Full(_))
        ));
        assert!(queue.sent_bodies().is_empty());

        gate.add_permits(1);
        settle().await;
        assert_eq!(queue.sent_bodies(), vec!["one"]);
        assert_eq!(first.id().as_deref(), Some("sent-1"));

        gate.add_permits(1);
        settle().await;
        assert_eq!(queue.sent_bodies(), vec!["one", "two"]);
        assert!(queue.batch_sizes().is_empty());

        publisher.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_carries_delay_and_attributes() {
        let queue = Arc::new(ScriptedQueue::new());
        let publisher = publisher_for(
            &queue,
            PublisherConfig {
                batch_size: 0,
                flush_interval_ms: FLUSH_MS,
                delay_seconds: 30,
            },
        );
        let cancel = CancellationToken::new();
        let tx = publisher.start(&cancel);

        let message = OutboundMessage::new("payload")
            .with_attribute("tenant", MessageAttribute::string("acme"));
        tx.send(message.clone()).await.unwrap();

        match message.wait_outcome().await {
            PublishOutcome::Published { message_id } => assert_eq!(message_id, "sent-1"),
            other => panic!("expected published outcome, got {:?}", other),
        }

        let sends = queue.sends.lock().unwrap().clone();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].delay_seconds, 30);
        assert_eq!(
            sends[0].attributes.get("tenant"),
            Some(&MessageAttribute::string("acme"))
        );

        publisher.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_sets_error() {
        let queue = Arc::new(ScriptedQueue::new());
        queue.push_send(Err(connection_error()));
        let publisher = publisher_for(&queue, batching(0));
        let cancel = CancellationToken::new();
        let tx = publisher.start(&cancel);

        let message = OutboundMessage::new("payload");
        tx.send(message.clone()).await.unwrap();

        match message.wait_outcome().await {
            PublishOutcome::Failed(err) => {
                assert!(matches!(*err, QueueError::ConnectionFailed { .. }))
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(message.id().is_none());

        publisher.shutdown().await.unwrap();
    }
}

mod batching {
    use super::*;

    /// A full buffer is sent at once and the timer starts over
    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_and_restarts_timer() {
        let queue = Arc::new(ScriptedQueue::new());
        let publisher = publisher_for(&queue, batching(3));
        let cancel = CancellationToken::new();
        let tx = publisher.start(&cancel);
        settle().await;

        tokio::time::advance(Duration::from_millis(900)).await;
        let sent = send_all(&tx, 3).await;
        settle().await;
        assert_eq!(queue.batch_sizes(), vec![3]);
        for (i, message) in sent.iter().enumerate() {
            assert_eq!(message.id(), Some(format!("batch-1-{}", i)));
        }

        tx.send(OutboundMessage::new("late")).await.unwrap();
        settle().await;

        // The first schedule would have fired at 1000ms
        tokio::time::advance(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(queue.batch_sizes(), vec![3]);

        tokio::time::advance(Duration::from_millis(800)).await;
        settle().await;
        assert_eq!(queue.batch_sizes(), vec![3, 1]);

        publisher.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushes_on_tick() {
        let queue = Arc::new(ScriptedQueue::new());
        let publisher = publisher_for(&queue, batching(5));
        let cancel = CancellationToken::new();
        let tx = publisher.start(&cancel);
        settle().await;

        let sent = send_all(&tx, 2).await;
        settle().await;
        assert!(queue.batch_sizes().is_empty());

        tokio::time::advance(Duration::from_millis(FLUSH_MS)).await;
        settle().await;
        assert_eq!(queue.batch_sizes(), vec![2]);
        assert!(sent.iter().all(|m| m.id().is_some()));

        // Nothing buffered, nothing sent
        tokio::time::advance(Duration::from_millis(FLUSH_MS)).await;
        settle().await;
        assert_eq!(queue.batch_sizes(), vec![2]);

        publisher.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_use_slot_correlation_ids() {
        let queue = Arc::new(ScriptedQueue::new());
        let publisher = publisher_for(
            &queue,
            PublisherConfig {
                batch_size: 2,
                flush_interval_ms: FLUSH_MS,
                delay_seconds: 5,
            },
        );
        let cancel = CancellationToken::new();
        let tx = publisher.start(&cancel);

        send_all(&tx, 2).await;
        settle().await;

        let batches = queue.batches.lock().unwrap().clone();
        let ids: Vec<&str> = batches[0].iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1"]);
        assert!(batches[0].iter().all(|e| e.delay_seconds == 5));

        publisher.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_maps_by_correlation_id() {
        let queue = Arc::new(ScriptedQueue::new());
        queue.push_batch(Ok(BatchResponse {
            failed: vec![
                BatchResultErrorEntry {
                    id: "3".to_string(),
                    code: "InvalidMessageContents".to_string(),
                    message: "bad body".to_string(),
                    sender_fault: true,
                },
                BatchResultErrorEntry {
                    id: "1".to_string(),
                    code: "InternalError".to_string(),
                    message: "try again".to_string(),
                    sender_fault: false,
                },
            ],
            successful: vec![
                BatchResultEntry {
                    id: "2".to_string(),
                    message_id: "id-2".to_string(),
                },
                BatchResultEntry {
                    id: "0".to_string(),
                    message_id: "id-0".to_string(),
                },
            ],
        }));
        let publisher = publisher_for(&queue, batching(4));
        let cancel = CancellationToken::new();
        let tx = publisher.start(&cancel);

        let sent = send_all(&tx, 4).await;
        settle().await;

        assert_eq!(sent[0].id().as_deref(), Some("id-0"));
        assert_eq!(sent[2].id().as_deref(), Some("id-2"));

        let err_1 = sent[1].error().unwrap();
        assert_eq!(err_1.to_string(), "InternalError - try again");
        assert!(err_1.is_transient());

        let err_3 = sent[3].error().unwrap();
        assert_eq!(err_3.to_string(), "InvalidMessageContents - bad body");
        assert!(!err_3.is_transient());

        publisher.shutdown().await.unwrap();
    }

    /// Every message of a failed batch carries the very same error
    #[tokio::test(start_paused = true)]
    async fn test_batch_failure_is_shared() {
        let queue = Arc::new(ScriptedQueue::new());
        queue.push_batch(Err(connection_error()));
        let publisher = publisher_for(&queue, batching(5));
        let cancel = CancellationToken::new();
        let tx = publisher.start(&cancel);

        let sent = send_all(&tx, 5).await;
        settle().await;

        let errors: Vec<Arc<QueueError>> = sent.iter().map(|m| m.error().unwrap()).collect();
        assert_eq!(errors.len(), 5);
        for err in &errors[1..] {
            assert!(Arc::ptr_eq(&errors[0], err));
        }
        assert!(sent.iter().all(|m| m.id().is_none()));

        publisher.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_marshal_failure_skips_slot() {
        let queue = Arc::new(ScriptedQueue::new());
        let backend: Arc<dyn QueueBackend> = Arc::clone(&queue) as Arc<dyn QueueBackend>;
        let marshaller: MessageMarshaller<OutboundMessage> = Arc::new(|m: &OutboundMessage| {
            if m.body() == "m1" {
                Err(QueueError::MarshalFailed {
                    reason: "poisoned".to_string(),
                })
            } else {
                Ok(m.body().to_uppercase().into_bytes())
            }
        });
        let publisher = Publisher::with_marshaller(backend, batching(3), marshaller).unwrap();
        let cancel = CancellationToken::new();
        let tx = publisher.start(&cancel);

        let sent = send_all(&tx, 3).await;
        settle().await;

        let batches = queue.batches.lock().unwrap().clone();
        let entries: Vec<(&str, &str)> = batches[0]
            .iter()
            .map(|e| (e.id.as_str(), e.body.as_str()))
            .collect();
        assert_eq!(entries, vec![("0", "M0"), ("2", "M2")]);

        assert!(matches!(
            sent[1].error().as_deref(),
            Some(QueueError::MarshalFailed { .. })
        ));
        assert!(sent[0].id().is_some());
        assert!(sent[2].id().is_some());

        publisher.shutdown().await.unwrap();
    }

    /// Buffered messages are lost on cancellation and get no outcome
    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_buffer_without_outcome() {
        let queue = Arc::new(ScriptedQueue::new());
        let publisher = publisher_for(&queue, batching(5));
        let cancel = CancellationToken::new();
        let tx = publisher.start(&cancel);

        let sent = send_all(&tx, 2).await;
        settle().await;
        publisher.shutdown().await.unwrap();

        assert!(queue.batch_sizes().is_empty());
        assert!(sent.iter().all(|m| m.outcome().is_none()));
        assert!(tx.send(OutboundMessage::new("too late")).await.is_err());
    }
}

mod lifecycle {
    use super::*;

    #[test]
    fn test_invalid_config_is_rejected() {
        let queue: Arc<dyn QueueBackend> = Arc::new(ScriptedQueue::new());
        let config = PublisherConfig {
            flush_interval_ms: 0,
            ..PublisherConfig::default()
        };
        assert!(Publisher::new(queue, config).is_err());
    }

    #[test]
    fn test_unbounded_flush_interval_is_rejected() {
        let queue: Arc<dyn QueueBackend> = Arc::new(ScriptedQueue::new());
        let config = PublisherConfig {
            flush_interval_ms: u64::MAX,
            ..batching(5)
        };
        assert!(matches!(
            Publisher::new(queue, config),
            Err(QueueError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_before_start_fails() {
        let queue = Arc::new(ScriptedQueue::new());
        let publisher = publisher_for(&queue, batching(3));
        assert!(matches!(publisher.stop(), Err(QueueError::NotStarted)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_returns_same_channel() {
        let queue = Arc::new(ScriptedQueue::new());
        let publisher = publisher_for(&queue, batching(3));
        let cancel = CancellationToken::new();

        let first = publisher.start(&cancel);
        let second = publisher.start(&cancel);
        assert!(first.same_channel(&second));

        assert!(publisher.stop().is_ok());
        assert!(publisher.stop().is_ok());
        assert!(!publisher.is_running());
    }
}
