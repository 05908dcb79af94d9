//! Queue registry and the shared per-queue handle

use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::SqsError;
use crate::message::{EnqueueReceipt, ReceiptToken, ReceivedMessage, SendRequest};
use crate::queue::{QueueConfig, QueueState};
use crate::visibility::{lease_batch, next_lease_expiry, settle, SweepReport};

pub const DEFAULT_ENDPOINT: &str = "http://localhost:4566";
pub const DEFAULT_ACCOUNT_ID: &str = "000000000000";
pub const DEFAULT_REGION: &str = "us-east-1";

/// Upper bound on messages per receive
pub const MAX_RECEIVE_MESSAGES: usize = 10;
/// Upper bound on a long poll
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(20);
/// How often a long poll re-checks eligibility without a wake signal
const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One FIFO queue. All state mutations go through a single lock, so the
/// eligible-head decision and lease issuance for a group are atomic. Once
/// the queue is deleted every handle to it fails with `QueueNotFound`.
#[derive(Debug)]
pub struct Queue {
    pub name: String,
    pub url: String,
    pub arn: String,
    pub created_timestamp: i64,
    state: Mutex<QueueState>,
    wake: Notify,
    deleted: AtomicBool,
}

impl Queue {
    pub fn new(name: String, url: String, arn: String, config: QueueConfig) -> Self {
        Self {
            name,
            url,
            arn,
            created_timestamp: chrono::Utc::now().timestamp(),
            state: Mutex::new(QueueState::new(config)),
            wake: Notify::new(),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> QueueConfig {
        self.state.lock().config().clone()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<(), SqsError> {
        if self.is_deleted() {
            Err(SqsError::QueueNotFound(self.name.clone()))
        } else {
            Ok(())
        }
    }

    /// Retire this handle and wake every waiting receiver
    fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }

    pub fn send(&self, request: SendRequest) -> Result<EnqueueReceipt, SqsError> {
        self.ensure_live()?;
        let receipt = {
            let mut state = self.state.lock();
            let now = Instant::now();
            settle(&mut state, now);
            state.enqueue(request, now, now_millis())?
        };

        if receipt.duplicate {
            info!(queue = %self.name, message_id = %receipt.message_id, "Duplicate message ignored");
        } else {
            info!(queue = %self.name, message_id = %receipt.message_id, sequence = %receipt.sequence_number, "Sent message");
            self.wake.notify_waiters();
        }
        Ok(receipt)
    }

    /// Lease up to `max_messages` eligible messages, waiting up to
    /// `wait_time` (or the queue default) for at least one to appear. The
    /// lock is never held while waiting.
    pub async fn receive(
        &self,
        max_messages: usize,
        wait_time: Option<Duration>,
    ) -> Result<Vec<ReceivedMessage>, SqsError> {
        self.ensure_live()?;
        if !(1..=MAX_RECEIVE_MESSAGES).contains(&max_messages) {
            return Err(SqsError::malformed(format!(
                "Value {max_messages} for parameter MaxNumberOfMessages is invalid. Reason: Must be between 1 and {MAX_RECEIVE_MESSAGES}, if provided."
            )));
        }
        let wait_time = match wait_time {
            Some(wait_time) => wait_time,
            None => self.config().default_wait_time(),
        };
        if wait_time > MAX_WAIT_TIME {
            return Err(SqsError::malformed(format!(
                "Value {} for parameter WaitTimeSeconds is invalid. Reason: Must be >= 0 and <= {}, if provided.",
                wait_time.as_secs(),
                MAX_WAIT_TIME.as_secs()
            )));
        }

        let deadline = Instant::now() + wait_time;
        loop {
            let wake = self.wake.notified();
            tokio::pin!(wake);
            wake.as_mut().enable();
            self.ensure_live()?;

            let (batch, lease_expiry) = {
                let mut state = self.state.lock();
                let now = Instant::now();
                settle(&mut state, now);
                let batch = lease_batch(&mut state, max_messages, now, now_millis());
                let lease_expiry = next_lease_expiry(&state);
                (batch, lease_expiry)
            };

            if !batch.is_empty() {
                info!(queue = %self.name, count = batch.len(), "Received messages");
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(queue = %self.name, wait_ms = wait_time.as_millis(), "Receive timed out empty");
                return Ok(Vec::new());
            }

            let mut wake_at = deadline.min(now + POLL_INTERVAL);
            if let Some(lease_expiry) = lease_expiry {
                wake_at = wake_at.min(lease_expiry);
            }

            tokio::select! {
                () = &mut wake => {}
                () = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Delete by receipt token. `Ok(false)` means the token was well-formed
    /// but stale, so nothing was deleted.
    pub fn delete(&self, receipt_token: &str) -> Result<bool, SqsError> {
        self.ensure_live()?;
        let token = ReceiptToken::decode(receipt_token)?;
        let deleted = {
            let mut state = self.state.lock();
            settle(&mut state, Instant::now());
            state.delete(&token)
        };

        if deleted {
            info!(queue = %self.name, message_id = %token.message_id, "Deleted message");
            self.wake.notify_waiters();
        } else {
            debug!(queue = %self.name, message_id = %token.message_id, lease = token.lease, "Stale receipt token, nothing deleted");
        }
        Ok(deleted)
    }

    pub fn sweep(&self) -> SweepReport {
        let report = settle(&mut self.state.lock(), Instant::now());
        if report.unblocked_receivers() {
            self.wake.notify_waiters();
        }
        report
    }

    pub fn purge(&self) -> Result<usize, SqsError> {
        self.ensure_live()?;
        let purged = self.state.lock().purge();
        info!(queue = %self.name, purged, "Purged queue");
        Ok(purged)
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }

    pub fn in_flight_in_group(&self, group_id: &str) -> usize {
        self.state.lock().in_flight_in_group(group_id)
    }

    /// Configuration plus live counters, keyed by SQS attribute name
    pub fn attributes(&self) -> BTreeMap<String, String> {
        let mut state = self.state.lock();
        settle(&mut state, Instant::now());

        let mut attrs = state.config().to_attributes();
        attrs.insert("QueueArn".to_string(), self.arn.clone());
        attrs.insert(
            "CreatedTimestamp".to_string(),
            self.created_timestamp.to_string(),
        );
        attrs.insert(
            "ApproximateNumberOfMessages".to_string(),
            state.visible_count().to_string(),
        );
        attrs.insert(
            "ApproximateNumberOfMessagesNotVisible".to_string(),
            state.in_flight_count().to_string(),
        );
        attrs
    }
}

/// All queues of one endpoint
#[derive(Debug)]
pub struct SqsStorage {
    queues: DashMap<String, Arc<Queue>>,
    endpoint: String,
    account_id: String,
    region: String,
}

impl Default for SqsStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SqsStorage {
    pub fn new() -> Self {
        Self::with_endpoint(DEFAULT_ENDPOINT)
    }

    /// Storage whose queue URLs are rooted at `endpoint`
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            queues: DashMap::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            account_id: DEFAULT_ACCOUNT_ID.to_string(),
            region: DEFAULT_REGION.to_string(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Create a queue. Re-creating with identical configuration returns the
    /// existing queue.
    pub fn create_queue(&self, name: &str, config: QueueConfig) -> Result<Arc<Queue>, SqsError> {
        validate_queue_name(name)?;
        config.validate()?;

        match self.queues.entry(name.to_string()) {
            Entry::Occupied(existing) => {
                if existing.get().config() == config {
                    Ok(existing.get().clone())
                } else {
                    Err(SqsError::QueueAlreadyExists(name.to_string()))
                }
            }
            Entry::Vacant(slot) => {
                let queue = Arc::new(Queue::new(
                    name.to_string(),
                    format!("{}/{}/{}", self.endpoint, self.account_id, name),
                    format!("arn:aws:sqs:{}:{}:{}", self.region, self.account_id, name),
                    config,
                ));
                info!(name = %name, url = %queue.url, "Creating queue");
                slot.insert(queue.clone());
                Ok(queue)
            }
        }
    }

    pub fn delete_queue(&self, name: &str) -> Result<(), SqsError> {
        let (_, queue) = self
            .queues
            .remove(name)
            .ok_or_else(|| SqsError::QueueNotFound(name.to_string()))?;

        info!(name = %name, "Deleting queue");
        queue.mark_deleted();
        Ok(())
    }

    pub fn get_queue(&self, name: &str) -> Result<Arc<Queue>, SqsError> {
        self.queues
            .get(name)
            .map(|q| q.value().clone())
            .ok_or_else(|| SqsError::QueueNotFound(name.to_string()))
    }

    /// Resolve a queue URL (or a bare queue name) to its queue
    pub fn queue_for_url(&self, queue_url: &str) -> Result<Arc<Queue>, SqsError> {
        let name = queue_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(queue_url);
        self.get_queue(name)
    }

    pub fn list_queues(&self, prefix: Option<&str>) -> Vec<String> {
        let mut urls: Vec<String> = self
            .queues
            .iter()
            .filter(|q| prefix.map_or(true, |p| q.key().starts_with(p)))
            .map(|q| q.value().url.clone())
            .collect();
        urls.sort();
        urls
    }

    /// Settle every queue: revert expired leases, drop aged messages
    pub fn sweep_all(&self) -> SweepReport {
        let queues: Vec<Arc<Queue>> = self.queues.iter().map(|q| q.value().clone()).collect();

        let mut total = SweepReport::default();
        for queue in queues {
            total.merge(queue.sweep());
        }
        total
    }
}

/// FIFO queue names: up to 80 characters of `[A-Za-z0-9_-]`, ending in `.fifo`
fn validate_queue_name(name: &str) -> Result<(), SqsError> {
    let stem = name.strip_suffix(".fifo").ok_or_else(|| {
        SqsError::malformed(format!(
            "The name of a FIFO queue can only include alphanumeric characters, hyphens, or underscores, must end with .fifo suffix: {name}"
        ))
    })?;

    let valid = !stem.is_empty()
        && name.len() <= 80
        && stem
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(SqsError::malformed(format!(
            "Can only include alphanumeric characters, hyphens, or underscores. 1 to 80 in length: {name}"
        )))
    }
}
