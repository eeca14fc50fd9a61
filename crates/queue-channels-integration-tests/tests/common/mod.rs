//! Common test utilities for queue-channels integration tests
//!
//! This module provides:
//! - Tracing setup that writes through the test harness
//! - AWS configuration pointing at a mock server
//! - Canned SQS/SNS XML responses
//! - Helpers to inspect the form-encoded requests a mock server received

use queue_channels::{AwsConfig, Credentials};
use std::collections::HashMap;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use wiremock::{MockServer, Request};

pub const QUEUE_PATH: &str = "/000000000000/orders";
pub const QUEUE_ARN: &str = "arn:aws:sqs:us-east-1:000000000000:orders";
pub const TOPIC_ARN: &str = "arn:aws:sns:us-east-1:000000000000:orders";

// ============================================================================
// Setup
// ============================================================================

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn credentials() -> Credentials {
    Credentials {
        access_key: "AKIDEXAMPLE".to_string(),
        secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
        token: None,
        region: "us-east-1".to_string(),
    }
}

/// Config with both endpoints on `server` and no queue or topic selected
#[allow(dead_code)]
pub fn base_config(server: &MockServer) -> AwsConfig {
    AwsConfig {
        sqs_endpoint: Some(server.uri()),
        sns_endpoint: Some(server.uri()),
        credentials: Some(credentials()),
        ..AwsConfig::default()
    }
}

/// Config for the queue at [`QUEUE_PATH`] on `server`
#[allow(dead_code)]
pub fn queue_config(server: &MockServer) -> AwsConfig {
    AwsConfig {
        queue_url: Some(queue_url(server)),
        ..base_config(server)
    }
}

#[allow(dead_code)]
pub fn topic_config(server: &MockServer) -> AwsConfig {
    AwsConfig {
        topic_arn: Some(TOPIC_ARN.to_string()),
        ..base_config(server)
    }
}

#[allow(dead_code)]
pub fn queue_url(server: &MockServer) -> String {
    format!("{}{}", server.uri(), QUEUE_PATH)
}

// ============================================================================
// Request inspection
// ============================================================================

/// Decoded form parameters of a request
#[allow(dead_code)]
pub fn form_params(request: &Request) -> HashMap<String, String> {
    url::form_urlencoded::parse(&request.body)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Form parameters of every received request for `action`, in arrival order
#[allow(dead_code)]
pub async fn requests_for(server: &MockServer, action: &str) -> Vec<HashMap<String, String>> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(form_params)
        .filter(|params| params.get("Action").map(String::as_str) == Some(action))
        .collect()
}

/// Poll until `server` has seen `count` requests for `action`
#[allow(dead_code)]
pub async fn wait_for_requests(server: &MockServer, action: &str, count: usize) {
    for _ in 0..200 {
        if requests_for(server, action).await.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} {} requests", count, action);
}

// ============================================================================
// Canned responses
// ============================================================================

fn metadata() -> &'static str {
    "<ResponseMetadata><RequestId>00000000-0000-0000-0000-000000000000</RequestId></ResponseMetadata>"
}

#[allow(dead_code)]
pub fn get_queue_url_response(url: &str) -> String {
    format!(
        "<GetQueueUrlResponse><GetQueueUrlResult><QueueUrl>{}</QueueUrl></GetQueueUrlResult>{}</GetQueueUrlResponse>",
        url,
        metadata()
    )
}

#[allow(dead_code)]
pub fn create_queue_response(url: &str) -> String {
    format!(
        "<CreateQueueResponse><CreateQueueResult><QueueUrl>{}</QueueUrl></CreateQueueResult>{}</CreateQueueResponse>",
        url,
        metadata()
    )
}

#[allow(dead_code)]
pub fn queue_arn_response() -> String {
    format!(
        "<GetQueueAttributesResponse><GetQueueAttributesResult><Attribute><Name>QueueArn</Name><Value>{}</Value></Attribute></GetQueueAttributesResult>{}</GetQueueAttributesResponse>",
        QUEUE_ARN,
        metadata()
    )
}

#[allow(dead_code)]
pub fn subscribe_response(subscription_arn: &str) -> String {
    format!(
        "<SubscribeResponse><SubscribeResult><SubscriptionArn>{}</SubscriptionArn></SubscribeResult>{}</SubscribeResponse>",
        subscription_arn,
        metadata()
    )
}

/// `ReceiveMessage` response for `(message_id, receipt_handle, body)` triples
#[allow(dead_code)]
pub fn receive_response(messages: &[(&str, &str, &str)]) -> String {
    let messages: String = messages
        .iter()
        .map(|(id, receipt, body)| {
            format!(
                "<Message><MessageId>{}</MessageId><ReceiptHandle>{}</ReceiptHandle><Body>{}</Body></Message>",
                id,
                receipt,
                escape(body)
            )
        })
        .collect();

    format!(
        "<ReceiveMessageResponse><ReceiveMessageResult>{}</ReceiveMessageResult>{}</ReceiveMessageResponse>",
        messages,
        metadata()
    )
}

#[allow(dead_code)]
pub fn empty_response(action: &str) -> String {
    format!("<{0}Response>{1}</{0}Response>", action, metadata())
}

#[allow(dead_code)]
pub fn send_message_response(message_id: &str) -> String {
    format!(
        "<SendMessageResponse><SendMessageResult><MessageId>{}</MessageId></SendMessageResult>{}</SendMessageResponse>",
        message_id,
        metadata()
    )
}

/// `SendMessageBatch` response; `failed` entries are `(id, code, sender_fault)`
#[allow(dead_code)]
pub fn batch_response(successful: &[(&str, &str)], failed: &[(&str, &str, bool)]) -> String {
    let successful: String = successful
        .iter()
        .map(|(id, message_id)| {
            format!(
                "<SendMessageBatchResultEntry><Id>{}</Id><MessageId>{}</MessageId></SendMessageBatchResultEntry>",
                id, message_id
            )
        })
        .collect();
    let failed: String = failed
        .iter()
        .map(|(id, code, sender_fault)| {
            format!(
                "<BatchResultErrorEntry><Id>{}</Id><Code>{}</Code><Message>rejected</Message><SenderFault>{}</SenderFault></BatchResultErrorEntry>",
                id, code, sender_fault
            )
        })
        .collect();

    format!(
        "<SendMessageBatchResponse><SendMessageBatchResult>{}{}</SendMessageBatchResult>{}</SendMessageBatchResponse>",
        successful,
        failed,
        metadata()
    )
}

#[allow(dead_code)]
pub fn publish_response(message_id: &str) -> String {
    format!(
        "<PublishResponse><PublishResult><MessageId>{}</MessageId></PublishResult>{}</PublishResponse>",
        message_id,
        metadata()
    )
}

#[allow(dead_code)]
pub fn error_response(code: &str, message: &str) -> String {
    format!(
        "<ErrorResponse><Error><Type>Sender</Type><Code>{}</Code><Message>{}</Message></Error><RequestId>00000000-0000-0000-0000-000000000000</RequestId></ErrorResponse>",
        code, message
    )
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
