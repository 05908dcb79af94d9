//! FIFO queue engine for fifostack
//!
//! Provides an in-memory, SQS-compatible FIFO queue with:
//! - Message groups with strict per-group ordering and a single in-flight
//!   message per group
//! - Deduplication ledger (explicit or content-based dedup ids)
//! - Visibility-timeout leases with versioned receipt tokens
//! - Retention sweeps and long-poll receives
//! - A Lambda-style event source mapping for consumers
//! - CreateQueue, GetQueueUrl, DeleteQueue, ListQueues, GetQueueAttributes,
//!   PurgeQueue, SendMessage, ReceiveMessage, DeleteMessage over AWS JSON 1.0

mod error;
pub mod event_source;
pub mod handlers;
pub mod message;
pub mod queue;
pub mod scheduler;
pub mod storage;
pub mod visibility;

pub use error::SqsError;
pub use event_source::{
    lambda_handler, BatchHandler, EventSourceHandle, EventSourceMapping, LoggingProcessor,
    RecordHandler, RecordProcessor, SqsBatchResponse, SqsEvent, SqsRecord,
};
pub use handlers::{handle_request, router, SqsState};
pub use message::{EnqueueReceipt, ReceiptToken, ReceivedMessage, SendRequest};
pub use queue::{QueueConfig, QueueState};
pub use storage::{Queue, SqsStorage};
pub use visibility::{spawn_sweeper, SweepReport};
