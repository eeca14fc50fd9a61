//! Backend adapters.
//!
//! - [`sqs`] and [`sns`] speak the AWS query protocol over [`client`],
//!   signing every request with [`signer`].
//! - [`memory`] keeps everything in process, for tests and local runs.

pub mod client;
pub mod memory;
pub mod signer;
pub mod sns;
pub mod sqs;
mod xml;

pub use client::AwsQueryClient;
pub use memory::{InMemoryQueue, InMemoryTopic};
pub use signer::AwsV4Signer;
pub use sns::SnsBackend;
pub use sqs::SqsBackend;
