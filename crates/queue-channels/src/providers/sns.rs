//! Amazon SNS adapter for the topic port.

use super::client::AwsQueryClient;
use super::xml::require_text;
use crate::backend::{PublishRequest, TopicBackend};
use crate::config::AwsConfig;
use crate::error::QueueError;
use crate::message::MessageAttribute;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

#[cfg(test)]
#[path = "sns_tests.rs"]
mod tests;

pub const SNS_API_VERSION: &str = "2010-03-31";

const PROVIDER: &str = "aws-sns";

/// Topic backend publishing to one SNS topic.
#[derive(Debug, Clone)]
pub struct SnsBackend {
    client: AwsQueryClient,
    topic_arn: String,
}

impl SnsBackend {
    pub fn new(client: AwsQueryClient, topic_arn: impl Into<String>) -> Self {
        Self {
            client,
            topic_arn: topic_arn.into(),
        }
    }

    /// Backend for the configured topic. No request is made.
    pub fn connect(config: &AwsConfig) -> Result<Self, QueueError> {
        let topic_arn = config
            .topic_arn
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(QueueError::MissingTopic)?;

        let credentials = config.resolve_credentials()?;
        let client = AwsQueryClient::new(
            "sns",
            config.sns_endpoint.as_deref(),
            SNS_API_VERSION,
            PROVIDER,
            &credentials,
            config.request_timeout(),
        )?;

        Ok(Self::new(client, topic_arn))
    }

    pub fn topic_arn(&self) -> &str {
        &self.topic_arn
    }

    /// Subscribe `endpoint` over `protocol`, returning the subscription ARN
    pub async fn subscribe(&self, protocol: &str, endpoint: &str) -> Result<String, QueueError> {
        let params = vec![
            ("TopicArn".to_string(), self.topic_arn.clone()),
            ("Protocol".to_string(), protocol.to_string()),
            ("Endpoint".to_string(), endpoint.to_string()),
        ];

        let response = self.client.call("Subscribe", params).await?;
        require_text(&response, &["SubscribeResult", "SubscriptionArn"])
    }

    /// Subscribe the queue with ARN `queue_arn`
    pub async fn subscribe_queue(&self, queue_arn: &str) -> Result<String, QueueError> {
        self.subscribe("sqs", queue_arn).await
    }
}

#[async_trait]
impl TopicBackend for SnsBackend {
    fn topic(&self) -> &str {
        &self.topic_arn
    }

    async fn publish(&self, request: PublishRequest) -> Result<String, QueueError> {
        let mut params = vec![
            ("TopicArn".to_string(), self.topic_arn.clone()),
            ("Message".to_string(), request.body),
        ];
        if let Some(subject) = request.subject.filter(|s| !s.is_empty()) {
            params.push(("Subject".to_string(), subject));
        }
        push_message_attributes(&mut params, &request.attributes);

        let response = self.client.call("Publish", params).await?;
        let message_id = require_text(&response, &["PublishResult", "MessageId"])?;
        debug!(topic_arn = %self.topic_arn, message_id = %message_id, "Published message");
        Ok(message_id)
    }
}

/// Append `MessageAttributes.entry.N.*` parameters, ordered by name
fn push_message_attributes(
    params: &mut Vec<(String, String)>,
    attributes: &HashMap<String, MessageAttribute>,
) {
    let mut names: Vec<&String> = attributes.keys().collect();
    names.sort();

    for (index, name) in names.into_iter().enumerate() {
        let attribute = &attributes[name];
        let key = format!("MessageAttributes.entry.{}", index + 1);
        params.push((format!("{}.Name", key), name.clone()));
        params.push((format!("{}.Value.DataType", key), attribute.data_type.clone()));
        params.push((format!("{}.Value.StringValue", key), attribute.value.clone()));
    }
}
