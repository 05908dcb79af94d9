//! Request ID generation

use base64::Engine;
use uuid::Uuid;

/// AWS-style request ID
#[derive(Debug, Clone)]
pub struct RequestId {
    /// Primary request ID (x-amzn-RequestId)
    pub id: String,
    /// Extended request ID (x-amz-id-2), base64 encoded
    pub extended_id: String,
}

impl RequestId {
    /// Generate a new request ID pair
    pub fn new() -> Self {
        let id = Uuid::new_v4().hyphenated().to_string();
        let extended_id = base64_encode(Uuid::new_v4().as_bytes());

        Self { id, extended_id }
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

fn base64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}
