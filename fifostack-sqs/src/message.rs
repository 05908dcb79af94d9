//! Message model

use base64::Engine;
use bytes::Bytes;
use md5::{Digest, Md5};
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::SqsError;

/// Sender id reported in the `SenderId` system attribute
pub const SENDER_ID: &str = "AIDAFIFOSTACKLOCAL";

/// Lifecycle of a stored message. A deleted message is simply gone from the
/// store, so there is no variant for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Visible,
    InFlight { lease_expiry: Instant },
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub group_id: String,
    pub dedup_id: Option<String>,
    pub body: Bytes,
    pub body_md5: String,
    pub attributes: HashMap<String, String>,
    pub sequence_number: u64,
    pub enqueued_at: Instant,
    /// Wall-clock send time, epoch millis
    pub sent_timestamp: i64,
    pub state: MessageState,
    /// Version of the most recent lease, 0 before the first receive
    pub lease: u64,
    pub receive_count: u32,
    pub first_receive_timestamp: Option<i64>,
}

impl Message {
    pub fn is_in_flight(&self) -> bool {
        matches!(self.state, MessageState::InFlight { .. })
    }

    pub fn is_visible(&self) -> bool {
        self.state == MessageState::Visible
    }
}

/// A send as the caller expressed it
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub group_id: String,
    pub dedup_id: Option<String>,
    pub body: Bytes,
    pub attributes: HashMap<String, String>,
}

impl SendRequest {
    pub fn new(group_id: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            group_id: group_id.into(),
            body: body.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_dedup_id(mut self, dedup_id: impl Into<String>) -> Self {
        self.dedup_id = Some(dedup_id.into());
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Result of an enqueue. A duplicate send gets the original message's receipt
/// back with `duplicate` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueReceipt {
    pub message_id: Uuid,
    pub body_md5: String,
    pub sequence_number: String,
    pub duplicate: bool,
}

/// Capability to delete one specific lease of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptToken {
    pub message_id: Uuid,
    pub lease: u64,
}

impl ReceiptToken {
    pub fn encode(&self) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(format!("{}:{}", self.message_id, self.lease))
    }

    pub fn decode(token: &str) -> Result<Self, SqsError> {
        let invalid = || SqsError::InvalidReceiptToken(token.to_string());

        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| invalid())?;
        let raw = String::from_utf8(raw).map_err(|_| invalid())?;
        let (id, lease) = raw.split_once(':').ok_or_else(invalid)?;

        let message_id = Uuid::parse_str(id).map_err(|_| invalid())?;
        let lease: u64 = lease.parse().map_err(|_| invalid())?;
        if lease == 0 {
            return Err(invalid());
        }

        Ok(Self { message_id, lease })
    }
}

/// A leased message handed to a receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: Uuid,
    pub body: Bytes,
    pub body_md5: String,
    pub attributes: HashMap<String, String>,
    pub receipt_token: String,
    pub group_id: String,
    pub dedup_id: Option<String>,
    pub sequence_number: u64,
    pub sent_timestamp: i64,
    pub receive_count: u32,
    pub first_receive_timestamp: i64,
}

impl ReceivedMessage {
    pub(crate) fn from_leased(message: &Message, token: ReceiptToken) -> Self {
        Self {
            message_id: message.id,
            body: message.body.clone(),
            body_md5: message.body_md5.clone(),
            attributes: message.attributes.clone(),
            receipt_token: token.encode(),
            group_id: message.group_id.clone(),
            dedup_id: message.dedup_id.clone(),
            sequence_number: message.sequence_number,
            sent_timestamp: message.sent_timestamp,
            receive_count: message.receive_count,
            first_receive_timestamp: message.first_receive_timestamp.unwrap_or_default(),
        }
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// SQS message system attributes
    pub fn system_attributes(&self) -> BTreeMap<&'static str, String> {
        let mut attrs = BTreeMap::new();
        attrs.insert("SenderId", SENDER_ID.to_string());
        attrs.insert("SentTimestamp", self.sent_timestamp.to_string());
        attrs.insert("ApproximateReceiveCount", self.receive_count.to_string());
        attrs.insert(
            "ApproximateFirstReceiveTimestamp",
            self.first_receive_timestamp.to_string(),
        );
        attrs.insert("MessageGroupId", self.group_id.clone());
        attrs.insert("SequenceNumber", format_sequence(self.sequence_number));
        if let Some(dedup_id) = &self.dedup_id {
            attrs.insert("MessageDeduplicationId", dedup_id.clone());
        }
        attrs
    }
}

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Dedup id derived from the body when content-based deduplication is on
pub fn content_dedup_id(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// SQS sequence numbers are 20-digit decimal strings
pub fn format_sequence(sequence: u64) -> String {
    format!("{sequence:020}")
}
