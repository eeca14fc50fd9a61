//! # Queue Channels
//!
//! Channel-based consumer and publisher pipelines over SQS/SNS style queues.
//!
//! This library provides:
//! - A [`Consumer`] that long-polls a queue and hands wrapped messages to the
//!   application over a channel, deleting them when they are acknowledged
//! - A [`Publisher`] that sends to a queue one message at a time or in
//!   batches flushed by size and by timer
//! - A [`TopicPublisher`] that publishes to a topic
//! - Adapters for Amazon SQS and SNS plus in-memory backends for tests
//!
//! ## Module Organization
//!
//! - [`backend`] - The port the pipelines use to reach a queue or topic
//! - [`message`] - Inbound and outbound message types and hooks
//! - [`config`] - Settings for the pipelines and the AWS adapters
//! - [`providers`] - Backend adapters
//! - [`error`] - Error types for all operations

// Module declarations
pub mod backend;
pub mod batch;
pub mod config;
pub mod consumer;
pub mod error;
pub mod message;
pub mod providers;
pub mod publisher;
pub mod retry;
pub mod topic;

mod lifecycle;

#[cfg(test)]
mod test_support;

// Re-export commonly used types at crate root for convenience
pub use backend::{
    BatchRequestEntry, BatchResponse, BatchResultEntry, BatchResultErrorEntry, PublishRequest,
    QueueBackend, RawMessage, SendRequest, TopicBackend,
};
pub use config::{AwsConfig, ConsumerConfig, Credentials, PublisherConfig, Settings};
pub use consumer::{Consumer, Inbox};
pub use error::{BatchEntryError, ConfigurationError, QueueError};
pub use message::{
    json_wrapper, pass_through, AckSender, BaseMessage, DecodedMessage, InboundMessage,
    MessageAttribute, MessageMarshaller, MessageWrapper, OutboundMessage, PublishMessage,
    PublishOutcome,
};
pub use providers::{
    AwsQueryClient, AwsV4Signer, InMemoryQueue, InMemoryTopic, SnsBackend, SqsBackend,
};
pub use publisher::Publisher;
pub use retry::RetryPolicy;
pub use topic::TopicPublisher;
