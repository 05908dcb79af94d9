//! Queue store: per-group message sequences, the deduplication ledger and
//! the retention sweep.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::SqsError;
use crate::message::{
    content_dedup_id, format_sequence, md5_hex, EnqueueReceipt, Message, MessageState,
    ReceiptToken, SendRequest,
};

/// Longest group id or dedup id SQS accepts
pub const MAX_ID_LENGTH: usize = 128;

/// Queue configuration, fixed at creation time. All durations are seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub visibility_timeout: u64,
    pub retention_period: u64,
    pub dedup_window: u64,
    pub default_wait_time: u64,
    pub content_based_deduplication: bool,
    pub maximum_message_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: 30,
            retention_period: 345_600, // 4 days
            dedup_window: 300,
            default_wait_time: 0,
            content_based_deduplication: false,
            maximum_message_size: 262_144, // 256KB
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout)
    }

    pub fn retention_period(&self) -> Duration {
        Duration::from_secs(self.retention_period)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window)
    }

    pub fn default_wait_time(&self) -> Duration {
        Duration::from_secs(self.default_wait_time)
    }

    pub fn validate(&self) -> Result<(), SqsError> {
        check_range("VisibilityTimeout", self.visibility_timeout, 0, 43_200)?;
        check_range("MessageRetentionPeriod", self.retention_period, 60, 1_209_600)?;
        check_range("DeduplicationWindow", self.dedup_window, 1, 86_400)?;
        check_range("ReceiveMessageWaitTimeSeconds", self.default_wait_time, 0, 20)?;
        check_range(
            "MaximumMessageSize",
            self.maximum_message_size as u64,
            1024,
            262_144,
        )?;
        Ok(())
    }

    /// Build a config from SQS `CreateQueue` attributes. Unknown names are
    /// rejected; `FifoQueue` must be absent or `true`.
    pub fn from_attributes(attributes: &HashMap<String, String>) -> Result<Self, SqsError> {
        let mut config = Self::default();

        for (name, value) in attributes {
            match name.as_str() {
                "VisibilityTimeout" => config.visibility_timeout = parse_number(name, value)?,
                "MessageRetentionPeriod" => config.retention_period = parse_number(name, value)?,
                "DeduplicationWindow" => config.dedup_window = parse_number(name, value)?,
                "ReceiveMessageWaitTimeSeconds" => {
                    config.default_wait_time = parse_number(name, value)?;
                }
                "MaximumMessageSize" => {
                    config.maximum_message_size = parse_number::<usize>(name, value)?;
                }
                "ContentBasedDeduplication" => {
                    config.content_based_deduplication = parse_bool(name, value)?;
                }
                "FifoQueue" => {
                    if !parse_bool(name, value)? {
                        return Err(SqsError::malformed(
                            "Only FIFO queues are supported; FifoQueue must be true",
                        ));
                    }
                }
                // Accepted for compatibility, no effect on a single-region engine
                "DeduplicationScope" | "FifoThroughputLimit" | "DelaySeconds" => {}
                _ => return Err(SqsError::InvalidAttribute(name.clone())),
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn to_attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        attrs.insert("FifoQueue".to_string(), "true".to_string());
        attrs.insert(
            "VisibilityTimeout".to_string(),
            self.visibility_timeout.to_string(),
        );
        attrs.insert(
            "MessageRetentionPeriod".to_string(),
            self.retention_period.to_string(),
        );
        attrs.insert(
            "DeduplicationWindow".to_string(),
            self.dedup_window.to_string(),
        );
        attrs.insert(
            "ReceiveMessageWaitTimeSeconds".to_string(),
            self.default_wait_time.to_string(),
        );
        attrs.insert(
            "MaximumMessageSize".to_string(),
            self.maximum_message_size.to_string(),
        );
        attrs.insert(
            "ContentBasedDeduplication".to_string(),
            self.content_based_deduplication.to_string(),
        );
        attrs
    }
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> Result<(), SqsError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(SqsError::malformed(format!(
            "Invalid value for the parameter {name}: {value} (must be between {min} and {max})"
        )))
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, SqsError> {
    value
        .trim()
        .parse()
        .map_err(|_| SqsError::malformed(format!("Invalid value for the parameter {name}: {value}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, SqsError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(SqsError::malformed(format!(
            "Invalid value for the parameter {name}: {value}"
        ))),
    }
}

/// Group ids and dedup ids: 1..=128 printable, non-space ASCII characters
pub(crate) fn validate_id(kind: &str, id: &str) -> Result<(), SqsError> {
    if id.is_empty() {
        return Err(SqsError::malformed(format!(
            "The request must contain the parameter {kind}."
        )));
    }
    if id.len() > MAX_ID_LENGTH || !id.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(SqsError::malformed(format!(
            "Value {id} for parameter {kind} is invalid."
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct DedupEntry {
    receipt: EnqueueReceipt,
    expires_at: Instant,
}

/// Everything one queue owns. Callers serialize access; the store itself
/// is plain data.
#[derive(Debug)]
pub struct QueueState {
    pub(crate) config: QueueConfig,
    pub(crate) messages: HashMap<Uuid, Message>,
    /// Message ids per group, oldest first
    pub(crate) groups: HashMap<String, VecDeque<Uuid>>,
    dedup: HashMap<String, DedupEntry>,
    next_sequence: u64,
    pub(crate) next_lease: u64,
}

impl QueueState {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            messages: HashMap::new(),
            groups: HashMap::new(),
            dedup: HashMap::new(),
            next_sequence: 0,
            next_lease: 0,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append a message to the tail of its group, unless its dedup id is
    /// still active, in which case the original receipt is returned and
    /// nothing changes.
    pub fn enqueue(
        &mut self,
        request: SendRequest,
        now: Instant,
        sent_timestamp: i64,
    ) -> Result<EnqueueReceipt, SqsError> {
        validate_id("MessageGroupId", &request.group_id)?;
        if let Some(dedup_id) = &request.dedup_id {
            validate_id("MessageDeduplicationId", dedup_id)?;
        }
        if request.body.is_empty() {
            return Err(SqsError::malformed(
                "The request must contain the parameter MessageBody.",
            ));
        }
        if request.body.len() > self.config.maximum_message_size {
            return Err(SqsError::malformed(format!(
                "One or more parameters are invalid. Reason: Message must be shorter than {} bytes.",
                self.config.maximum_message_size
            )));
        }

        let dedup_id = request.dedup_id.or_else(|| {
            self.config
                .content_based_deduplication
                .then(|| content_dedup_id(&request.body))
        });

        if let Some(dedup_id) = &dedup_id {
            if let Some(entry) = self.dedup.get(dedup_id) {
                if entry.expires_at > now {
                    debug!(dedup_id = %dedup_id, message_id = %entry.receipt.message_id, "Duplicate send suppressed");
                    return Ok(EnqueueReceipt {
                        duplicate: true,
                        ..entry.receipt.clone()
                    });
                }
            }
        }

        self.next_sequence += 1;
        let message = Message {
            id: Uuid::new_v4(),
            group_id: request.group_id,
            dedup_id,
            body_md5: md5_hex(&request.body),
            body: request.body,
            attributes: request.attributes,
            sequence_number: self.next_sequence,
            enqueued_at: now,
            sent_timestamp,
            state: MessageState::Visible,
            lease: 0,
            receive_count: 0,
            first_receive_timestamp: None,
        };

        let receipt = EnqueueReceipt {
            message_id: message.id,
            body_md5: message.body_md5.clone(),
            sequence_number: format_sequence(message.sequence_number),
            duplicate: false,
        };

        if let Some(dedup_id) = &message.dedup_id {
            self.dedup.insert(
                dedup_id.clone(),
                DedupEntry {
                    receipt: receipt.clone(),
                    expires_at: now + self.config.dedup_window(),
                },
            );
        }

        self.groups
            .entry(message.group_id.clone())
            .or_default()
            .push_back(message.id);
        self.messages.insert(message.id, message);

        Ok(receipt)
    }

    /// Delete the message named by `token` if the token carries its most
    /// recent lease. Returns whether anything was deleted; a stale token is
    /// not an error.
    pub fn delete(&mut self, token: &ReceiptToken) -> bool {
        let current = token.lease != 0
            && self
                .messages
                .get(&token.message_id)
                .is_some_and(|m| m.lease == token.lease);

        if current {
            self.remove(token.message_id);
        }
        current
    }

    /// Drop every message whose retention period has elapsed, whatever its
    /// state. Groups are in enqueue order, so expired messages always form a
    /// prefix of each group.
    pub fn sweep_retention(&mut self, now: Instant) -> usize {
        let retention = self.config.retention_period();
        let mut expired = Vec::new();

        for group in self.groups.values() {
            for id in group {
                match self.messages.get(id) {
                    Some(m) if m.enqueued_at + retention <= now => expired.push(*id),
                    _ => break,
                }
            }
        }

        for id in &expired {
            self.remove(*id);
        }
        expired.len()
    }

    /// Forget dedup ids whose window has closed
    pub fn prune_dedup(&mut self, now: Instant) -> usize {
        let before = self.dedup.len();
        self.dedup.retain(|_, entry| entry.expires_at > now);
        before - self.dedup.len()
    }

    /// Drop all messages. The dedup ledger survives a purge.
    pub fn purge(&mut self) -> usize {
        let count = self.messages.len();
        self.messages.clear();
        self.groups.clear();
        count
    }

    pub fn get(&self, id: &Uuid) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn visible_count(&self) -> usize {
        self.messages.values().filter(|m| m.is_visible()).count()
    }

    pub fn in_flight_count(&self) -> usize {
        self.messages.values().filter(|m| m.is_in_flight()).count()
    }

    pub fn in_flight_in_group(&self, group_id: &str) -> usize {
        self.groups.get(group_id).map_or(0, |group| {
            group
                .iter()
                .filter(|id| self.messages.get(*id).is_some_and(Message::is_in_flight))
                .count()
        })
    }

    fn remove(&mut self, id: Uuid) -> Option<Message> {
        let message = self.messages.remove(&id)?;
        if let Some(group) = self.groups.get_mut(&message.group_id) {
            if group.front() == Some(&id) {
                group.pop_front();
            } else {
                group.retain(|other| *other != id);
            }
            if group.is_empty() {
                self.groups.remove(&message.group_id);
            }
        }
        Some(message)
    }
}
