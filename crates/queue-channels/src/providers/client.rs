//! Signed HTTP client for the AWS query APIs (SQS and SNS).
//!
//! Every call is a form-encoded `POST /` carrying `Action`, `Version` and
//! the action's parameters, signed with SigV4. Successful responses are
//! returned as raw XML; error responses are mapped to [`QueueError`].

use super::signer::{canonical_query, AwsV4Signer};
use super::xml::{find_text, path_ends_with, walk, XmlEvent};
use crate::config::Credentials;
use crate::error::{ConfigurationError, QueueError};
use chrono::Utc;
use reqwest::Client as HttpClient;
use std::fmt;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// One AWS service endpoint plus the signer for it.
#[derive(Clone)]
pub struct AwsQueryClient {
    http: HttpClient,
    signer: AwsV4Signer,
    endpoint: String,
    host: String,
    version: &'static str,
    provider: &'static str,
    timeout: Duration,
}

impl fmt::Debug for AwsQueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsQueryClient")
            .field("endpoint", &self.endpoint)
            .field("provider", &self.provider)
            .field("version", &self.version)
            .finish()
    }
}

impl AwsQueryClient {
    /// # Arguments
    ///
    /// * `service` - SigV4 signing name, e.g. `sqs`
    /// * `endpoint` - base URL; `None` selects the regional AWS endpoint
    /// * `version` - API version sent with every action
    /// * `provider` - label used in [`QueueError::ProviderError`]
    pub fn new(
        service: &str,
        endpoint: Option<&str>,
        version: &'static str,
        provider: &'static str,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Self, QueueError> {
        if credentials.region.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "aws.credentials.region".to_string(),
            }
            .into());
        }

        let endpoint = endpoint
            .map(|e| e.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("https://{}.{}.amazonaws.com", service, credentials.region));

        let parsed = Url::parse(&endpoint).map_err(|e| ConfigurationError::Invalid {
            message: format!("Invalid {} endpoint '{}': {}", service, endpoint, e),
        })?;
        let host = match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ConfigurationError::Invalid {
                    message: format!("Endpoint '{}' has no host", endpoint),
                }
                .into())
            }
        };

        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            http,
            signer: AwsV4Signer::new(credentials, service),
            endpoint,
            host,
            version,
            provider,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn region(&self) -> &str {
        self.signer.region()
    }

    /// Invoke `action` and return the XML response body
    pub async fn call(
        &self,
        action: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<String, QueueError> {
        params.push(("Action".to_string(), action.to_string()));
        params.push(("Version".to_string(), self.version.to_string()));
        let body = canonical_query(&params);

        let auth_headers = self
            .signer
            .sign_request("POST", &self.host, "/", &[], &body, &Utc::now());

        let mut request = self
            .http
            .post(format!("{}/", self.endpoint))
            .header(
                "content-type",
                "application/x-www-form-urlencoded; charset=utf-8",
            )
            .body(body);
        for (key, value) in auth_headers {
            request = request.header(key.as_str(), value);
        }

        debug!(provider = self.provider, action, "Sending request");

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                QueueError::Timeout {
                    duration: self.timeout,
                }
            } else {
                QueueError::ConnectionFailed {
                    message: format!("{} request failed: {}", action, e),
                }
            }
        })?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("Failed to read response body: {}", e),
            })?;

        if !status.is_success() {
            return Err(parse_error_response(
                self.provider,
                &response_body,
                status.as_u16(),
            ));
        }

        Ok(response_body)
    }
}

/// Map an AWS error document to a [`QueueError`]
pub(crate) fn parse_error_response(provider: &str, xml: &str, status_code: u16) -> QueueError {
    let mut code: Option<String> = None;
    let mut message: Option<String> = None;

    let parsed = walk(xml, |event| {
        if let XmlEvent::Text(path, text) = event {
            if path_ends_with(path, &["Error", "Code"]) {
                code.get_or_insert_with(String::new).push_str(text);
            } else if path_ends_with(path, &["Error", "Message"]) {
                message.get_or_insert_with(String::new).push_str(text);
            }
        }
    });
    if parsed.is_err() || (code.is_none() && message.is_none()) {
        // Not an AWS error document, e.g. a proxy error page
        code = None;
        message = Some(xml.trim().to_string()).filter(|m| !m.is_empty());
    }

    let code = code
        .map(|c| c.trim().to_string())
        .unwrap_or_else(|| format!("HTTP{}", status_code));
    let message = message
        .map(|m| m.trim().to_string())
        .unwrap_or_else(|| "Unknown error".to_string());

    match code.as_str() {
        "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
            QueueError::QueueNotFound {
                queue_name: message,
            }
        }
        "InvalidClientTokenId"
        | "UnrecognizedClientException"
        | "SignatureDoesNotMatch"
        | "ExpiredToken"
        | "AccessDenied"
        | "AuthorizationError" => QueueError::AuthenticationFailed {
            message: format!("{}: {}", code, message),
        },
        "InvalidReceiptHandle" | "ReceiptHandleIsInvalid" => {
            QueueError::InvalidReceipt { receipt: message }
        }
        _ if status_code == 401 || status_code == 403 => QueueError::AuthenticationFailed {
            message: format!("{}: {}", code, message),
        },
        _ => QueueError::ProviderError {
            provider: provider.to_string(),
            code,
            message,
        },
    }
}

/// Request id of a response, for logging
pub(crate) fn request_id(xml: &str) -> Option<String> {
    find_text(xml, &["RequestId"]).ok().flatten()
}
