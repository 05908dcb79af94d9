//! SQS-compatible error types and formatting

use serde::Serialize;
use thiserror::Error;

/// Error codes understood by SQS clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Queue lifecycle
    QueueDoesNotExist,
    QueueNameExists,

    // Request validation
    InvalidParameterValue,
    MissingParameter,
    InvalidAttributeName,
    ReceiptHandleIsInvalid,
    InvalidAction,
    SerializationException,
}

impl ErrorCode {
    /// Error shape name used in the `__type` field of JSON protocol errors
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueDoesNotExist => "QueueDoesNotExist",
            Self::QueueNameExists => "QueueNameExists",
            Self::InvalidParameterValue => "InvalidParameterValue",
            Self::MissingParameter => "MissingParameter",
            Self::InvalidAttributeName => "InvalidAttributeName",
            Self::ReceiptHandleIsInvalid => "ReceiptHandleIsInvalid",
            Self::InvalidAction => "InvalidAction",
            Self::SerializationException => "SerializationException",
        }
    }

    /// Legacy query-protocol code, reported through `x-amzn-query-error`
    pub fn query_code(&self) -> &'static str {
        match self {
            Self::QueueDoesNotExist => "AWS.SimpleQueueService.NonExistentQueue",
            Self::QueueNameExists => "QueueAlreadyExists",
            Self::InvalidAction => "AWS.SimpleQueueService.UnsupportedOperation",
            other => other.as_str(),
        }
    }
}

/// AWS-style error
#[derive(Debug, Error)]
#[error("{code:?}: {message}")]
pub struct AwsError {
    pub code: ErrorCode,
    pub message: String,
    pub resource: Option<String>,
}

impl AwsError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            resource: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Value of the `x-amzn-query-error` header, e.g.
    /// `AWS.SimpleQueueService.NonExistentQueue;Sender`. Every error is a
    /// non-retryable client fault.
    pub fn query_error_header(&self) -> String {
        format!("{};Sender", self.code.query_code())
    }

    /// Format as an AWS JSON 1.0 protocol error
    pub fn to_json(&self) -> String {
        #[derive(Serialize)]
        struct JsonError<'a> {
            #[serde(rename = "__type")]
            error_type: String,
            message: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            resource: Option<&'a str>,
        }

        let error = JsonError {
            error_type: format!("com.amazonaws.sqs#{}", self.code.as_str()),
            message: &self.message,
            resource: self.resource.as_deref(),
        };

        serde_json::to_string(&error).unwrap_or_else(|_| {
            format!(
                r#"{{"__type":"com.amazonaws.sqs#{}","message":"{}"}}"#,
                self.code.as_str(),
                self.message
            )
        })
    }
}
