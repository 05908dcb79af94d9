//! Client for the fifostack SQS JSON API

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::REQUEST_TIMEOUT_SECS;

/// Minimal SQS client speaking AWS JSON 1.0
#[derive(Debug, Clone)]
pub struct SqsClient {
    base_url: String,
    client: Client,
}

/// A received message
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SqsMessage {
    pub message_id: String,
    pub receipt_handle: String,
    #[serde(rename = "MD5OfBody")]
    pub md5_of_body: String,
    pub body: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl SqsMessage {
    pub fn group_id(&self) -> Option<&str> {
        self.attributes.get("MessageGroupId").map(String::as_str)
    }

    pub fn receive_count(&self) -> Option<u32> {
        self.attributes.get("ApproximateReceiveCount")?.parse().ok()
    }
}

/// Options for `receive_messages`
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiveOptions {
    pub max_messages: Option<usize>,
    pub wait_time_seconds: Option<u64>,
}

impl ReceiveOptions {
    pub fn max(max_messages: usize) -> Self {
        Self {
            max_messages: Some(max_messages),
            wait_time_seconds: None,
        }
    }

    #[must_use]
    pub fn wait(mut self, seconds: u64) -> Self {
        self.wait_time_seconds = Some(seconds);
        self
    }
}

impl SqsClient {
    pub fn new(base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Self { base_url, client }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Invoke `action`, returning the decoded body or the service error
    pub async fn call(&self, action: &str, body: Value) -> Result<Value, ClientError> {
        let response = self
            .client
            .post(format!("{}/", self.base_url))
            .header("X-Amz-Target", format!("AmazonSQS.{action}"))
            .header("Content-Type", "application/x-amz-json-1.0")
            .body(body.to_string())
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        let value: Value = if text.is_empty() {
            json!({})
        } else {
            serde_json::from_str(&text).map_err(|e| ClientError::ParseError(e.to_string()))?
        };

        if status.is_success() {
            return Ok(value);
        }

        let code = value["__type"]
            .as_str()
            .and_then(|t| t.rsplit('#').next())
            .unwrap_or("Unknown")
            .to_string();
        let message = value["message"].as_str().unwrap_or_default().to_string();
        Err(ClientError::Service { code, message })
    }

    pub async fn create_queue(&self, name: &str) -> Result<String, ClientError> {
        self.create_queue_with(name, HashMap::new()).await
    }

    pub async fn create_queue_with(
        &self,
        name: &str,
        attributes: HashMap<&str, String>,
    ) -> Result<String, ClientError> {
        let response = self
            .call(
                "CreateQueue",
                json!({ "QueueName": name, "Attributes": attributes }),
            )
            .await?;
        string_field(&response, "QueueUrl")
    }

    pub async fn get_queue_url(&self, name: &str) -> Result<String, ClientError> {
        let response = self.call("GetQueueUrl", json!({ "QueueName": name })).await?;
        string_field(&response, "QueueUrl")
    }

    pub async fn delete_queue(&self, queue_url: &str) -> Result<(), ClientError> {
        self.call("DeleteQueue", json!({ "QueueUrl": queue_url }))
            .await
            .map(|_| ())
    }

    pub async fn purge_queue(&self, queue_url: &str) -> Result<(), ClientError> {
        self.call("PurgeQueue", json!({ "QueueUrl": queue_url }))
            .await
            .map(|_| ())
    }

    pub async fn get_queue_attributes(
        &self,
        queue_url: &str,
    ) -> Result<HashMap<String, String>, ClientError> {
        let response = self
            .call(
                "GetQueueAttributes",
                json!({ "QueueUrl": queue_url, "AttributeNames": ["All"] }),
            )
            .await?;
        serde_json::from_value(response["Attributes"].clone())
            .map_err(|e| ClientError::ParseError(e.to_string()))
    }

    /// Send a message, returning its message id
    pub async fn send_message(
        &self,
        queue_url: &str,
        body: &str,
        group_id: &str,
    ) -> Result<String, ClientError> {
        self.send(json!({
            "QueueUrl": queue_url,
            "MessageBody": body,
            "MessageGroupId": group_id,
        }))
        .await
    }

    pub async fn send_message_dedup(
        &self,
        queue_url: &str,
        body: &str,
        group_id: &str,
        dedup_id: &str,
    ) -> Result<String, ClientError> {
        self.send(json!({
            "QueueUrl": queue_url,
            "MessageBody": body,
            "MessageGroupId": group_id,
            "MessageDeduplicationId": dedup_id,
        }))
        .await
    }

    async fn send(&self, request: Value) -> Result<String, ClientError> {
        let response = self.call("SendMessage", request).await?;
        string_field(&response, "MessageId")
    }

    /// Receive messages with every system attribute attached
    pub async fn receive_messages(
        &self,
        queue_url: &str,
        options: ReceiveOptions,
    ) -> Result<Vec<SqsMessage>, ClientError> {
        let mut request = json!({
            "QueueUrl": queue_url,
            "MessageSystemAttributeNames": ["All"],
        });
        if let Some(max) = options.max_messages {
            request["MaxNumberOfMessages"] = json!(max);
        }
        if let Some(wait) = options.wait_time_seconds {
            request["WaitTimeSeconds"] = json!(wait);
        }

        let response = self.call("ReceiveMessage", request).await?;
        match response.get("Messages") {
            Some(messages) => serde_json::from_value(messages.clone())
                .map_err(|e| ClientError::ParseError(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    pub async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), ClientError> {
        self.call(
            "DeleteMessage",
            json!({ "QueueUrl": queue_url, "ReceiptHandle": receipt_handle }),
        )
        .await
        .map(|_| ())
    }
}

fn string_field(value: &Value, name: &str) -> Result<String, ClientError> {
    value[name]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ClientError::ParseError(format!("Missing {name} in response")))
}

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request error: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("{code}: {message}")]
    Service { code: String, message: String },
}

impl ClientError {
    /// Service error code, e.g. `QueueDoesNotExist`
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Service { code, .. } => Some(code),
            _ => None,
        }
    }
}
