//! Queue engine errors

use fifostack_core::{AwsError, ErrorCode};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SqsError {
    #[error("The specified queue does not exist.")]
    QueueNotFound(String),
    #[error("Queue already exists with different attributes: {0}")]
    QueueAlreadyExists(String),
    #[error("{0}")]
    MalformedRequest(String),
    #[error("The input receipt handle \"{0}\" is not a valid receipt handle.")]
    InvalidReceiptToken(String),
    #[error("Invalid attribute: {0}")]
    InvalidAttribute(String),
}

impl SqsError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::QueueNotFound(_) => ErrorCode::QueueDoesNotExist,
            Self::QueueAlreadyExists(_) => ErrorCode::QueueNameExists,
            Self::MalformedRequest(_) => ErrorCode::InvalidParameterValue,
            Self::InvalidReceiptToken(_) => ErrorCode::ReceiptHandleIsInvalid,
            Self::InvalidAttribute(_) => ErrorCode::InvalidAttributeName,
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRequest(message.into())
    }
}

impl From<&SqsError> for AwsError {
    fn from(error: &SqsError) -> Self {
        let aws = AwsError::new(error.code(), error.to_string());
        match error {
            SqsError::QueueNotFound(name) | SqsError::QueueAlreadyExists(name) => {
                aws.with_resource(name.clone())
            }
            _ => aws,
        }
    }
}
