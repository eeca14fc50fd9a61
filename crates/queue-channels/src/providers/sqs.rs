//! Amazon SQS adapter for the queue port.
//!
//! ## Queue resolution
//!
//! [`SqsBackend::connect`] resolves the queue once, up front:
//! - an explicit `queue_url` is used as is,
//! - with `create_queue` the queue is created (an existing queue with the
//!   same name is returned by SQS unchanged),
//! - otherwise the URL is looked up by name, optionally in another account.
//!
//! When a topic ARN is configured the queue is then subscribed to it.

use super::client::{request_id, AwsQueryClient};
use super::sns::SnsBackend;
use super::xml::{path_ends_with, walk, XmlEvent};
use crate::backend::{
    BatchRequestEntry, BatchResponse, BatchResultEntry, BatchResultErrorEntry, QueueBackend,
    RawMessage, SendRequest,
};
use crate::config::AwsConfig;
use crate::error::QueueError;
use crate::message::MessageAttribute;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

#[cfg(test)]
#[path = "sqs_tests.rs"]
mod tests;

pub const SQS_API_VERSION: &str = "2012-11-05";

const PROVIDER: &str = "aws-sqs";

/// Queue backend talking to one SQS queue.
#[derive(Debug, Clone)]
pub struct SqsBackend {
    client: AwsQueryClient,
    queue_url: String,
}

impl SqsBackend {
    /// Backend for an already resolved queue URL
    pub fn new(client: AwsQueryClient, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }

    /// Signed SQS client for `config`
    pub fn client(config: &AwsConfig) -> Result<AwsQueryClient, QueueError> {
        let credentials = config.resolve_credentials()?;
        AwsQueryClient::new(
            "sqs",
            config.sqs_endpoint.as_deref(),
            SQS_API_VERSION,
            PROVIDER,
            &credentials,
            config.request_timeout(),
        )
    }

    /// Resolve (or create) the configured queue and subscribe it to the
    /// configured topic, if any.
    pub async fn connect(config: &AwsConfig) -> Result<Self, QueueError> {
        let queue_name = config.queue_name.as_deref().filter(|n| !n.is_empty());
        let queue_url = config.queue_url.as_deref().filter(|u| !u.is_empty());
        if queue_name.is_none() && queue_url.is_none() {
            return Err(QueueError::MissingQueue);
        }

        let client = Self::client(config)?;

        let queue_url = match (queue_url, queue_name) {
            (Some(url), _) => url.to_string(),
            (None, Some(name)) if config.create_queue => create_queue(&client, name).await?,
            (None, Some(name)) => {
                get_queue_url(&client, name, config.account_id.as_deref()).await?
            }
            (None, None) => return Err(QueueError::MissingQueue),
        };

        let backend = Self::new(client, queue_url);

        if let Some(topic_arn) = config.topic_arn.as_deref().filter(|t| !t.is_empty()) {
            let topic = SnsBackend::connect(config)?;
            let queue_arn = backend.queue_arn().await?;
            let subscription_arn = topic.subscribe_queue(&queue_arn).await?;
            info!(
                queue_url = %backend.queue_url,
                topic_arn,
                subscription_arn = %subscription_arn,
                "Subscribed queue to topic"
            );
        }

        Ok(backend)
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// ARN of the queue, needed to subscribe it to a topic
    pub async fn queue_arn(&self) -> Result<String, QueueError> {
        let params = vec![
            ("QueueUrl".to_string(), self.queue_url.clone()),
            ("AttributeName.1".to_string(), "QueueArn".to_string()),
        ];
        let response = self.client.call("GetQueueAttributes", params).await?;

        parse_attributes(&response)?
            .remove("QueueArn")
            .ok_or_else(|| QueueError::MalformedResponse {
                message: "QueueArn not found in response".to_string(),
            })
    }
}

async fn get_queue_url(
    client: &AwsQueryClient,
    queue_name: &str,
    owner_account_id: Option<&str>,
) -> Result<String, QueueError> {
    let mut params = vec![("QueueName".to_string(), queue_name.to_string())];
    if let Some(account_id) = owner_account_id.filter(|a| !a.is_empty()) {
        params.push(("QueueOwnerAWSAccountId".to_string(), account_id.to_string()));
    }

    let response = client.call("GetQueueUrl", params).await?;
    super::xml::require_text(&response, &["GetQueueUrlResult", "QueueUrl"])
}

async fn create_queue(client: &AwsQueryClient, queue_name: &str) -> Result<String, QueueError> {
    let params = vec![("QueueName".to_string(), queue_name.to_string())];

    let response = client.call("CreateQueue", params).await?;
    let queue_url = super::xml::require_text(&response, &["CreateQueueResult", "QueueUrl"])?;
    info!(
        queue_name,
        queue_url = %queue_url,
        request_id = request_id(&response).as_deref().unwrap_or("-"),
        "Created queue"
    );
    Ok(queue_url)
}

#[async_trait]
impl QueueBackend for SqsBackend {
    async fn receive_batch(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, QueueError> {
        let params = vec![
            ("QueueUrl".to_string(), self.queue_url.clone()),
            ("MaxNumberOfMessages".to_string(), max_messages.to_string()),
            ("WaitTimeSeconds".to_string(), wait.as_secs().to_string()),
            ("AttributeName.1".to_string(), "All".to_string()),
            ("MessageAttributeName.1".to_string(), "All".to_string()),
        ];

        let response = self.client.call("ReceiveMessage", params).await?;
        parse_receive_response(&response)
    }

    async fn delete_one(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let params = vec![
            ("QueueUrl".to_string(), self.queue_url.clone()),
            ("ReceiptHandle".to_string(), receipt_handle.to_string()),
        ];

        // DeleteMessage has no result payload
        self.client.call("DeleteMessage", params).await?;
        Ok(())
    }

    async fn send_one(&self, request: SendRequest) -> Result<String, QueueError> {
        let mut params = vec![
            ("QueueUrl".to_string(), self.queue_url.clone()),
            ("MessageBody".to_string(), request.body),
        ];
        if request.delay_seconds > 0 {
            params.push(("DelaySeconds".to_string(), request.delay_seconds.to_string()));
        }
        push_message_attributes(&mut params, "", &request.attributes);

        let response = self.client.call("SendMessage", params).await?;
        super::xml::require_text(&response, &["SendMessageResult", "MessageId"])
    }

    async fn send_batch(
        &self,
        entries: Vec<BatchRequestEntry>,
    ) -> Result<BatchResponse, QueueError> {
        let mut params = vec![("QueueUrl".to_string(), self.queue_url.clone())];

        for (index, entry) in entries.into_iter().enumerate() {
            let prefix = format!("SendMessageBatchRequestEntry.{}.", index + 1);
            params.push((format!("{}Id", prefix), entry.id));
            params.push((format!("{}MessageBody", prefix), entry.body));
            if entry.delay_seconds > 0 {
                params.push((
                    format!("{}DelaySeconds", prefix),
                    entry.delay_seconds.to_string(),
                ));
            }
            push_message_attributes(&mut params, &prefix, &entry.attributes);
        }

        let response = self.client.call("SendMessageBatch", params).await?;
        let parsed = parse_batch_response(&response)?;
        debug!(
            successful = parsed.successful.len(),
            failed = parsed.failed.len(),
            "SendMessageBatch completed"
        );
        Ok(parsed)
    }
}

/// Append `MessageAttribute.N.*` parameters, ordered by attribute name
fn push_message_attributes(
    params: &mut Vec<(String, String)>,
    prefix: &str,
    attributes: &HashMap<String, MessageAttribute>,
) {
    let mut names: Vec<&String> = attributes.keys().collect();
    names.sort();

    for (index, name) in names.into_iter().enumerate() {
        let attribute = &attributes[name];
        let key = format!("{}MessageAttribute.{}", prefix, index + 1);
        params.push((format!("{}.Name", key), name.clone()));
        params.push((format!("{}.Value.DataType", key), attribute.data_type.clone()));
        params.push((format!("{}.Value.StringValue", key), attribute.value.clone()));
    }
}

/// Parse a `ReceiveMessage` response
pub(crate) fn parse_receive_response(xml: &str) -> Result<Vec<RawMessage>, QueueError> {
    let mut messages = Vec::new();
    let mut current: Option<RawMessage> = None;
    let mut md5 = String::new();
    let mut attribute_name = String::new();
    let mut attribute = MessageAttribute::new("", "");
    let mut system_name = String::new();
    let mut system_value = String::new();

    walk(xml, |event| match event {
        XmlEvent::Open(path) if path_ends_with(path, &["ReceiveMessageResult", "Message"]) => {
            current = Some(RawMessage::default());
            md5.clear();
        }
        XmlEvent::Open(path) if path_ends_with(path, &["Message", "MessageAttribute"]) => {
            attribute_name.clear();
            attribute = MessageAttribute::new("", "");
        }
        XmlEvent::Open(path) if path_ends_with(path, &["Message", "Attribute"]) => {
            system_name.clear();
            system_value.clear();
        }
        XmlEvent::Text(path, text) => {
            let Some(message) = current.as_mut() else {
                return;
            };
            if path_ends_with(path, &["Message", "MessageId"]) {
                message.message_id.push_str(text);
            } else if path_ends_with(path, &["Message", "ReceiptHandle"]) {
                message.receipt_handle.push_str(text);
            } else if path_ends_with(path, &["Message", "Body"]) {
                message.body.push_str(text);
            } else if path_ends_with(path, &["Message", "MD5OfBody"]) {
                md5.push_str(text);
            } else if path_ends_with(path, &["MessageAttribute", "Name"]) {
                attribute_name.push_str(text);
            } else if path_ends_with(path, &["MessageAttribute", "Value", "StringValue"]) {
                attribute.value.push_str(text);
            } else if path_ends_with(path, &["MessageAttribute", "Value", "DataType"]) {
                attribute.data_type.push_str(text);
            } else if path_ends_with(path, &["Attribute", "Name"]) {
                system_name.push_str(text);
            } else if path_ends_with(path, &["Attribute", "Value"]) {
                system_value.push_str(text);
            }
        }
        XmlEvent::Close(path) if path_ends_with(path, &["Message", "MessageAttribute"]) => {
            if let Some(message) = current.as_mut() {
                let data_type = attribute.data_type.trim().to_string();
                message.attributes.insert(
                    attribute_name.trim().to_string(),
                    MessageAttribute::new(data_type, attribute.value.clone()),
                );
            }
        }
        XmlEvent::Close(path) if path_ends_with(path, &["Message", "Attribute"]) => {
            if let Some(message) = current.as_mut() {
                message.system_attributes.insert(
                    system_name.trim().to_string(),
                    system_value.trim().to_string(),
                );
            }
        }
        XmlEvent::Close(path) if path_ends_with(path, &["ReceiveMessageResult", "Message"]) => {
            if let Some(mut message) = current.take() {
                message.message_id = message.message_id.trim().to_string();
                message.receipt_handle = message.receipt_handle.trim().to_string();
                let digest = md5.trim();
                message.md5_of_body = (!digest.is_empty()).then(|| digest.to_string());
                messages.push(message);
            }
        }
        _ => {}
    })?;

    Ok(messages)
}

/// Parse a `SendMessageBatch` response
pub(crate) fn parse_batch_response(xml: &str) -> Result<BatchResponse, QueueError> {
    const SUCCESS: &str = "SendMessageBatchResultEntry";
    const FAILURE: &str = "BatchResultErrorEntry";

    let mut response = BatchResponse::default();
    let mut fields: HashMap<String, String> = HashMap::new();

    walk(xml, |event| match event {
        XmlEvent::Open(path) if path_ends_with(path, &[SUCCESS]) || path_ends_with(path, &[FAILURE]) => {
            fields.clear();
        }
        XmlEvent::Text(path, text) if path.len() >= 2 => {
            let parent = path[path.len() - 2].as_str();
            if parent == SUCCESS || parent == FAILURE {
                fields
                    .entry(path[path.len() - 1].clone())
                    .or_default()
                    .push_str(text);
            }
        }
        XmlEvent::Close(path) if path_ends_with(path, &[SUCCESS]) => {
            response.successful.push(BatchResultEntry {
                id: field(&fields, "Id"),
                message_id: field(&fields, "MessageId"),
            });
        }
        XmlEvent::Close(path) if path_ends_with(path, &[FAILURE]) => {
            response.failed.push(BatchResultErrorEntry {
                id: field(&fields, "Id"),
                code: field(&fields, "Code"),
                message: field(&fields, "Message"),
                sender_fault: field(&fields, "SenderFault").eq_ignore_ascii_case("true"),
            });
        }
        _ => {}
    })?;

    Ok(response)
}

/// Parse `Attribute` name/value pairs of a `GetQueueAttributes` response
fn parse_attributes(xml: &str) -> Result<HashMap<String, String>, QueueError> {
    let mut attributes = HashMap::new();
    let mut name = String::new();
    let mut value = String::new();

    walk(xml, |event| match event {
        XmlEvent::Open(path) if path_ends_with(path, &["Attribute"]) => {
            name.clear();
            value.clear();
        }
        XmlEvent::Text(path, text) if path_ends_with(path, &["Attribute", "Name"]) => {
            name.push_str(text)
        }
        XmlEvent::Text(path, text) if path_ends_with(path, &["Attribute", "Value"]) => {
            value.push_str(text)
        }
        XmlEvent::Close(path) if path_ends_with(path, &["Attribute"]) => {
            attributes.insert(name.trim().to_string(), value.trim().to_string());
        }
        _ => {}
    })?;

    Ok(attributes)
}

fn field(fields: &HashMap<String, String>, name: &str) -> String {
    fields
        .get(name)
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}
