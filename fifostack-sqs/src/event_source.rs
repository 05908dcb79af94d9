//! Event source mapping: polls a queue and hands batches to a Lambda-style
//! handler, deleting what the handler reports as processed.
//!
//! A batch is settled the way Lambda settles SQS batches:
//! - records not listed in `batchItemFailures` are deleted
//! - listed records are left alone and come back once their lease expires
//! - a handler error, an empty `itemIdentifier` or an `itemIdentifier` that
//!   names no record of the batch fails the whole batch

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SqsError;
use crate::message::ReceivedMessage;
use crate::storage::{Queue, MAX_RECEIVE_MESSAGES, MAX_WAIT_TIME};

/// Pause after a failed poll before trying again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordAttributeValue {
    pub string_value: Option<String>,
    pub data_type: String,
}

/// One SQS record as Lambda presents it. Only `messageId` is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqsRecord {
    pub message_id: String,
    #[serde(default)]
    pub receipt_handle: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub message_attributes: BTreeMap<String, RecordAttributeValue>,
    #[serde(default)]
    pub md5_of_body: String,
    #[serde(default)]
    pub event_source: String,
    #[serde(rename = "eventSourceARN", default)]
    pub event_source_arn: String,
    #[serde(default)]
    pub aws_region: String,
}

impl SqsRecord {
    pub fn from_message(message: &ReceivedMessage, queue_arn: &str, region: &str) -> Self {
        Self {
            message_id: message.message_id.to_string(),
            receipt_handle: message.receipt_token.clone(),
            body: message.body_text(),
            attributes: message
                .system_attributes()
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
            message_attributes: message
                .attributes
                .iter()
                .map(|(name, value)| {
                    (
                        name.clone(),
                        RecordAttributeValue {
                            string_value: Some(value.clone()),
                            data_type: "String".to_string(),
                        },
                    )
                })
                .collect(),
            md5_of_body: message.body_md5.clone(),
            event_source: "aws:sqs".to_string(),
            event_source_arn: queue_arn.to_string(),
            aws_region: region.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqsEvent {
    #[serde(rename = "Records")]
    pub records: Vec<SqsRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqsBatchResponse {
    #[serde(default)]
    pub batch_item_failures: Vec<BatchItemFailure>,
}

impl SqsBatchResponse {
    pub fn failed(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            batch_item_failures: ids
                .into_iter()
                .map(|item_identifier| BatchItemFailure { item_identifier })
                .collect(),
        }
    }
}

/// Consumes a whole batch
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, event: SqsEvent) -> Result<SqsBatchResponse, HandlerError>;
}

/// Consumes a single record
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    async fn process(&self, record: &SqsRecord) -> Result<(), HandlerError>;
}

/// Runs a [`RecordProcessor`] over every record, reporting the failed ones
pub struct RecordHandler<P> {
    processor: P,
}

impl<P: RecordProcessor> RecordHandler<P> {
    pub fn new(processor: P) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl<P: RecordProcessor> BatchHandler for RecordHandler<P> {
    async fn handle(&self, event: SqsEvent) -> Result<SqsBatchResponse, HandlerError> {
        Ok(process_records(&event.records, &self.processor).await)
    }
}

async fn process_records(records: &[SqsRecord], processor: &dyn RecordProcessor) -> SqsBatchResponse {
    let mut failed = Vec::new();
    for record in records {
        if let Err(e) = processor.process(record).await {
            warn!(message_id = %record.message_id, error = %e, "Record processing failed");
            failed.push(record.message_id.clone());
        }
    }
    SqsBatchResponse::failed(failed)
}

/// Accepts every record, logging it
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingProcessor;

#[async_trait]
impl RecordProcessor for LoggingProcessor {
    async fn process(&self, record: &SqsRecord) -> Result<(), HandlerError> {
        info!(
            message_id = %record.message_id,
            group = record.attributes.get("MessageGroupId").map_or("", String::as_str),
            bytes = record.body.len(),
            "Received record"
        );
        Ok(())
    }
}

/// Raw JSON entry point. Anything without a `Records` list is answered with
/// a 400 response instead of a batch response. A record that cannot be read
/// is reported as failed under its `messageId`.
pub async fn lambda_handler(event: Value, processor: &dyn RecordProcessor) -> Value {
    let Some(raw_records) = event.get("Records").and_then(Value::as_array) else {
        warn!("Event is not an SQS event");
        return not_an_sqs_event();
    };

    let mut records = Vec::with_capacity(raw_records.len());
    let mut unreadable = Vec::new();
    for raw in raw_records {
        match SqsRecord::deserialize(raw) {
            Ok(record) => records.push(record),
            Err(e) => {
                let message_id = raw.get("messageId").and_then(Value::as_str);
                warn!(message_id = message_id.unwrap_or_default(), error = %e, "Unreadable SQS record");
                unreadable.extend(message_id.map(str::to_string));
            }
        }
    }

    let mut response = process_records(&records, processor).await;
    response
        .batch_item_failures
        .extend(SqsBatchResponse::failed(unreadable).batch_item_failures);
    serde_json::to_value(response).unwrap_or_else(|_| json!({ "batchItemFailures": [] }))
}

fn not_an_sqs_event() -> Value {
    json!({
        "statusCode": 400,
        "body": json!({ "message": "Record is not a SQS event" }).to_string(),
    })
}

/// What one poll did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub received: usize,
    pub deleted: usize,
    pub failed: usize,
}

pub struct EventSourceMapping {
    queue: Arc<Queue>,
    handler: Arc<dyn BatchHandler>,
    batch_size: usize,
    wait_time: Duration,
    region: String,
}

impl EventSourceMapping {
    pub fn new(queue: Arc<Queue>, handler: Arc<dyn BatchHandler>) -> Self {
        Self {
            queue,
            handler,
            batch_size: 1,
            wait_time: MAX_WAIT_TIME,
            region: crate::storage::DEFAULT_REGION.to_string(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Result<Self, SqsError> {
        if !(1..=MAX_RECEIVE_MESSAGES).contains(&batch_size) {
            return Err(SqsError::malformed(format!(
                "BatchSize must be between 1 and {MAX_RECEIVE_MESSAGES}: {batch_size}"
            )));
        }
        self.batch_size = batch_size;
        Ok(self)
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Result<Self, SqsError> {
        if wait_time > MAX_WAIT_TIME {
            return Err(SqsError::malformed(format!(
                "Wait time must be at most {} seconds",
                MAX_WAIT_TIME.as_secs()
            )));
        }
        self.wait_time = wait_time;
        Ok(self)
    }

    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Receive one batch, invoke the handler and settle the batch
    pub async fn poll_once(&self) -> Result<PollOutcome, SqsError> {
        let messages = self
            .queue
            .receive(self.batch_size, Some(self.wait_time))
            .await?;
        if messages.is_empty() {
            return Ok(PollOutcome::default());
        }

        let records: Vec<SqsRecord> = messages
            .iter()
            .map(|m| SqsRecord::from_message(m, &self.queue.arn, &self.region))
            .collect();
        let received = records.len();

        let failed_ids = match self.handler.handle(SqsEvent { records: records.clone() }).await {
            Ok(response) => match failed_ids(&records, &response) {
                Some(ids) => ids,
                None => {
                    warn!(queue = %self.queue.name, "Invalid batch response, failing whole batch");
                    all_ids(&records)
                }
            },
            Err(e) => {
                warn!(queue = %self.queue.name, error = %e, "Handler failed, batch will be redelivered");
                all_ids(&records)
            }
        };

        let mut deleted = 0;
        for record in records.iter().filter(|r| !failed_ids.contains(&r.message_id)) {
            if self.queue.delete(&record.receipt_handle)? {
                deleted += 1;
            }
        }

        let outcome = PollOutcome {
            received,
            deleted,
            failed: failed_ids.len(),
        };
        debug!(queue = %self.queue.name, ?outcome, "Settled batch");
        Ok(outcome)
    }

    /// Poll until the returned handle is shut down or the queue is deleted
    pub fn spawn(self) -> EventSourceHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        info!(queue = %self.queue.name, batch_size = self.batch_size, "Starting event source mapping");

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    result = self.poll_once() => match result {
                        Ok(_) => {}
                        Err(SqsError::QueueNotFound(_)) => {
                            warn!(queue = %self.queue.name, "Queue deleted");
                            break;
                        }
                        Err(e) => {
                            warn!(queue = %self.queue.name, error = %e, "Poll failed");
                            tokio::time::sleep(ERROR_BACKOFF).await;
                        }
                    },
                }
            }
            info!(queue = %self.queue.name, "Stopped event source mapping");
        });

        EventSourceHandle { shutdown, task }
    }
}

fn all_ids(records: &[SqsRecord]) -> HashSet<String> {
    records.iter().map(|r| r.message_id.clone()).collect()
}

/// Failed message ids named by `response`, or `None` if the response is
/// invalid for this batch
fn failed_ids(records: &[SqsRecord], response: &SqsBatchResponse) -> Option<HashSet<String>> {
    let batch = all_ids(records);
    response
        .batch_item_failures
        .iter()
        .map(|failure| {
            let id = failure.item_identifier.trim();
            (!id.is_empty() && batch.contains(id)).then(|| id.to_string())
        })
        .collect()
}

pub struct EventSourceHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl EventSourceHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SendRequest;
    use crate::queue::QueueConfig;
    use crate::storage::SqsStorage;
    use parking_lot::Mutex;

    fn queue(visibility_timeout: u64) -> Arc<Queue> {
        SqsStorage::new()
            .create_queue(
                "events.fifo",
                QueueConfig {
                    visibility_timeout,
                    ..QueueConfig::default()
                },
            )
            .unwrap()
    }

    /// Fails records whose body contains "fail"
    struct SelectiveProcessor {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RecordProcessor for SelectiveProcessor {
        async fn process(&self, record: &SqsRecord) -> Result<(), HandlerError> {
            self.seen.lock().push(record.body.clone());
            if record.body.contains("fail") {
                Err(HandlerError::new("poison"))
            } else {
                Ok(())
            }
        }
    }

    struct FixedResponse(Result<SqsBatchResponse, HandlerError>);

    #[async_trait]
    impl BatchHandler for FixedResponse {
        async fn handle(&self, _event: SqsEvent) -> Result<SqsBatchResponse, HandlerError> {
            self.0.clone()
        }
    }

    fn sample_event() -> Value {
        json!({
            "Records": [{
                "messageId": "059f36b4-87a3-44ab-83d2-661975830a7d",
                "receiptHandle": "AQEBwJnKyrHigUMZj6rYigCgxlaS3SLy0a...",
                "body": "{\"RecordNumber\": 1234}",
                "attributes": {
                    "ApproximateReceiveCount": "1",
                    "SentTimestamp": "1545082649183",
                    "SenderId": "AIDAIENQZJOLO23YVJ4VO",
                    "ApproximateFirstReceiveTimestamp": "1545082649185"
                },
                "messageAttributes": {},
                "md5OfBody": "e4e68fb7bd0e697a0ae8f1bb342846b3",
                "eventSource": "aws:sqs",
                "eventSourceARN": "arn:aws:sqs:us-west-2:123456789012:my-queue",
                "awsRegion": "us-west-2"
            }]
        })
    }

    #[tokio::test]
    async fn test_lambda_handler_accepts_sqs_event() {
        let response = lambda_handler(sample_event(), &LoggingProcessor).await;
        assert_eq!(response, json!({ "batchItemFailures": [] }));
    }

    #[tokio::test]
    async fn test_lambda_handler_rejects_non_sqs_event() {
        let response = lambda_handler(json!({ "hello": "world" }), &LoggingProcessor).await;
        assert_eq!(response["statusCode"], 400);

        let body: Value = serde_json::from_str(response["body"].as_str().unwrap()).unwrap();
        assert_eq!(body["message"], "Record is not a SQS event");
    }

    #[tokio::test]
    async fn test_lambda_handler_accepts_partial_records() {
        let processor = SelectiveProcessor {
            seen: Mutex::new(Vec::new()),
        };
        let event = json!({ "Records": [{ "messageId": "m-1", "body": "x" }] });

        let response = lambda_handler(event, &processor).await;
        assert_eq!(response, json!({ "batchItemFailures": [] }));
        assert_eq!(*processor.seen.lock(), vec!["x"]);
    }

    #[tokio::test]
    async fn test_lambda_handler_fails_unreadable_records_only() {
        let processor = SelectiveProcessor {
            seen: Mutex::new(Vec::new()),
        };
        let event = json!({
            "Records": [
                { "messageId": "m-1", "body": 42 },
                { "messageId": "m-2", "body": "fine" },
                { "body": "no id" }
            ]
        });

        let response = lambda_handler(event, &processor).await;
        assert_eq!(
            response,
            json!({ "batchItemFailures": [{ "itemIdentifier": "m-1" }] })
        );
        assert_eq!(*processor.seen.lock(), vec!["fine"]);
    }

    #[tokio::test]
    async fn test_lambda_handler_reports_failed_records() {
        let mut event = sample_event();
        event["Records"][0]["body"] = json!("please fail");
        let processor = SelectiveProcessor {
            seen: Mutex::new(Vec::new()),
        };

        let response = lambda_handler(event, &processor).await;
        assert_eq!(
            response["batchItemFailures"][0]["itemIdentifier"],
            "059f36b4-87a3-44ab-83d2-661975830a7d"
        );
    }

    #[tokio::test]
    async fn test_record_shape_matches_lambda() {
        let queue = queue(30);
        queue
            .send(SendRequest::new("g", "payload").with_attribute("k", "v"))
            .unwrap();
        let message = queue.receive(1, Some(Duration::ZERO)).await.unwrap().remove(0);

        let record = SqsRecord::from_message(&message, &queue.arn, "us-east-1");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["eventSource"], "aws:sqs");
        assert_eq!(json["eventSourceARN"], queue.arn.as_str());
        assert_eq!(json["body"], "payload");
        assert_eq!(json["attributes"]["MessageGroupId"], "g");
        assert_eq!(json["messageAttributes"]["k"]["stringValue"], "v");
        assert_eq!(json["md5OfBody"], message.body_md5.as_str());
    }

    #[tokio::test]
    async fn test_poll_deletes_successes_and_keeps_failures() {
        let queue = queue(30);
        queue.send(SendRequest::new("g1", "ok-1")).unwrap();
        queue.send(SendRequest::new("g2", "fail-2")).unwrap();
        queue.send(SendRequest::new("g3", "ok-3")).unwrap();

        let mapping = EventSourceMapping::new(
            queue.clone(),
            Arc::new(RecordHandler::new(SelectiveProcessor {
                seen: Mutex::new(Vec::new()),
            })),
        )
        .with_batch_size(10)
        .unwrap()
        .with_wait_time(Duration::ZERO)
        .unwrap();

        let outcome = mapping.poll_once().await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome {
                received: 3,
                deleted: 2,
                failed: 1
            }
        );
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.in_flight_in_group("g2"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_record_is_redelivered_after_visibility_timeout() {
        let queue = queue(5);
        queue.send(SendRequest::new("g", "fail-once")).unwrap();

        let mapping = EventSourceMapping::new(
            queue.clone(),
            Arc::new(FixedResponse(Err(HandlerError::new("down")))),
        )
        .with_wait_time(Duration::ZERO)
        .unwrap();
        assert_eq!(mapping.poll_once().await.unwrap().deleted, 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let again = queue.receive(1, Some(Duration::ZERO)).await.unwrap();
        assert_eq!(again[0].body_text(), "fail-once");
        assert_eq!(again[0].receive_count, 2);
    }

    #[tokio::test]
    async fn test_invalid_item_identifier_fails_whole_batch() {
        for bad in ["", "not-in-this-batch"] {
            let queue = queue(30);
            queue.send(SendRequest::new("g", "m")).unwrap();

            let mapping = EventSourceMapping::new(
                queue.clone(),
                Arc::new(FixedResponse(Ok(SqsBatchResponse::failed([bad.to_string()])))),
            )
            .with_wait_time(Duration::ZERO)
            .unwrap();

            let outcome = mapping.poll_once().await.unwrap();
            assert_eq!(outcome.deleted, 0);
            assert_eq!(outcome.failed, 1);
            assert_eq!(queue.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_empty_batch_response_deletes_everything() {
        let queue = queue(30);
        queue.send(SendRequest::new("g", "m")).unwrap();

        let mapping = EventSourceMapping::new(
            queue.clone(),
            Arc::new(FixedResponse(Ok(SqsBatchResponse::default()))),
        )
        .with_wait_time(Duration::ZERO)
        .unwrap();

        assert_eq!(mapping.poll_once().await.unwrap().deleted, 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_spawned_mapping_drains_queue_in_group_order() {
        let queue = queue(30);
        for body in ["m1", "m2", "m3"] {
            queue.send(SendRequest::new("g", body)).unwrap();
        }

        struct Recorder(Arc<Mutex<Vec<String>>>);

        #[async_trait]
        impl RecordProcessor for Recorder {
            async fn process(&self, record: &SqsRecord) -> Result<(), HandlerError> {
                self.0.lock().push(record.body.clone());
                Ok(())
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = EventSourceMapping::new(
            queue.clone(),
            Arc::new(RecordHandler::new(Recorder(seen.clone()))),
        )
        .with_wait_time(Duration::from_millis(50))
        .unwrap()
        .spawn();

        for _ in 0..100 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert!(queue.is_empty());
        assert_eq!(*seen.lock(), vec!["m1", "m2", "m3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mapping_stops_when_queue_is_deleted() {
        let storage = SqsStorage::new();
        let queue = storage
            .create_queue("events.fifo", QueueConfig::default())
            .unwrap();
        let mapping = EventSourceMapping::new(
            queue.clone(),
            Arc::new(RecordHandler::new(LoggingProcessor)),
        );

        storage.delete_queue("events.fifo").unwrap();
        assert!(matches!(
            mapping.poll_once().await,
            Err(SqsError::QueueNotFound(_))
        ));

        let queue = storage
            .create_queue("events.fifo", QueueConfig::default())
            .unwrap();
        let handle = EventSourceMapping::new(
            queue,
            Arc::new(RecordHandler::new(LoggingProcessor)),
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        storage.delete_queue("events.fifo").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(handle.task.is_finished());
        handle.shutdown().await;
    }

    #[test]
    fn test_batch_size_limits() {
        let q = queue(30);
        let handler: Arc<dyn BatchHandler> = Arc::new(RecordHandler::new(LoggingProcessor));
        assert!(EventSourceMapping::new(q.clone(), handler.clone())
            .with_batch_size(0)
            .is_err());
        assert!(EventSourceMapping::new(q.clone(), handler.clone())
            .with_batch_size(11)
            .is_err());
        assert!(EventSourceMapping::new(q, handler)
            .with_wait_time(Duration::from_secs(21))
            .is_err());
    }
}
