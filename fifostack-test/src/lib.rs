//! Test utilities for fifostack
//!
//! Runs the SQS API in-process on an ephemeral port and talks to it over
//! real HTTP, the way an SDK would:
//!
//! ```rust,no_run
//! use fifostack_test::TestServer;
//!
//! #[tokio::test]
//! async fn test_queue() {
//!     let server = TestServer::start().await.unwrap();
//!     let client = server.client();
//!     let url = client.create_queue("orders.fifo").await.unwrap();
//!     client.send_message(&url, "hello", "group-1").await.unwrap();
//! }
//! ```

pub mod client;
pub mod server;

pub use client::{ClientError, ReceiveOptions, SqsClient, SqsMessage};
pub use server::{TestError, TestServer};

/// Timeout for a single client request; longer than the longest long poll
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
