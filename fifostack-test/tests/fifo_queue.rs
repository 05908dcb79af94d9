//! End-to-end tests against an in-process fifostack server

use fifostack_test::{ReceiveOptions, TestServer};
use std::collections::HashMap;
use std::time::{Duration, Instant};

async fn server_with_queue(name: &str, visibility_timeout: u64) -> (TestServer, String) {
    let server = TestServer::start().await.unwrap();
    let attributes = HashMap::from([("VisibilityTimeout", visibility_timeout.to_string())]);
    let url = server
        .client()
        .create_queue_with(name, attributes)
        .await
        .unwrap();
    (server, url)
}

#[tokio::test]
async fn test_send_and_receive_message() {
    let (server, url) = server_with_queue("test-queue.fifo", 30).await;
    let client = server.client();

    let message_id = client
        .send_message(&url, "test message", "message-group-id")
        .await
        .unwrap();

    let messages = client
        .receive_messages(&url, ReceiveOptions::default())
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_id, message_id);
    assert_eq!(messages[0].body, "test message");
    assert_eq!(messages[0].md5_of_body, "c72b9698fa1927e1dd12d3cf26ed84b2");
    assert_eq!(messages[0].group_id(), Some("message-group-id"));
    assert_eq!(messages[0].receive_count(), Some(1));
}

#[tokio::test]
async fn test_group_order_and_single_in_flight() {
    let (server, url) = server_with_queue("ordered.fifo", 30).await;
    let client = server.client();

    client.send_message(&url, "m1", "g").await.unwrap();
    client.send_message(&url, "m2", "g").await.unwrap();

    let first = client
        .receive_messages(&url, ReceiveOptions::max(10))
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].body, "m1");

    let blocked = client
        .receive_messages(&url, ReceiveOptions::max(10).wait(1))
        .await
        .unwrap();
    assert!(blocked.is_empty());

    client
        .delete_message(&url, &first[0].receipt_handle)
        .await
        .unwrap();

    let second = client
        .receive_messages(&url, ReceiveOptions::default())
        .await
        .unwrap();
    assert_eq!(second[0].body, "m2");
}

#[tokio::test]
async fn test_batch_receive_spans_groups() {
    let (server, url) = server_with_queue("groups.fifo", 30).await;
    let client = server.client();

    for group in ["a", "b", "c"] {
        client.send_message(&url, &format!("{group}1"), group).await.unwrap();
        client.send_message(&url, &format!("{group}2"), group).await.unwrap();
    }

    let batch = client
        .receive_messages(&url, ReceiveOptions::max(10))
        .await
        .unwrap();
    let bodies: Vec<&str> = batch.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["a1", "b1", "c1"]);
}

#[tokio::test]
async fn test_duplicate_send_is_suppressed() {
    let (server, url) = server_with_queue("dedup.fifo", 30).await;
    let client = server.client();

    let first = client
        .send_message_dedup(&url, "payload", "g", "dedup-1")
        .await
        .unwrap();
    let second = client
        .send_message_dedup(&url, "payload", "g", "dedup-1")
        .await
        .unwrap();
    assert_eq!(first, second);

    let messages = client
        .receive_messages(&url, ReceiveOptions::max(10))
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    client
        .delete_message(&url, &messages[0].receipt_handle)
        .await
        .unwrap();

    let after = client
        .receive_messages(&url, ReceiveOptions::max(10))
        .await
        .unwrap();
    assert!(after.is_empty());
}

#[tokio::test]
async fn test_lease_expiry_redelivers_and_stale_delete_is_noop() {
    let (server, url) = server_with_queue("lease.fifo", 1).await;
    let client = server.client();

    client.send_message(&url, "m1", "g").await.unwrap();
    let first = client
        .receive_messages(&url, ReceiveOptions::default())
        .await
        .unwrap();

    let redelivered = client
        .receive_messages(&url, ReceiveOptions::default().wait(3))
        .await
        .unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].message_id, first[0].message_id);
    assert_eq!(redelivered[0].receive_count(), Some(2));

    client
        .delete_message(&url, &first[0].receipt_handle)
        .await
        .unwrap();
    let queue = server.storage().get_queue("lease.fifo").unwrap();
    assert_eq!(queue.len(), 1);

    client
        .delete_message(&url, &redelivered[0].receipt_handle)
        .await
        .unwrap();
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_long_poll_wakes_on_send() {
    let (server, url) = server_with_queue("poll.fifo", 30).await;
    let client = server.client();

    let receiver = {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move {
            client
                .receive_messages(&url, ReceiveOptions::default().wait(10))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    let started = Instant::now();
    client.send_message(&url, "late", "g").await.unwrap();

    let messages = receiver.await.unwrap().unwrap();
    assert_eq!(messages[0].body, "late");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_empty_long_poll_respects_wait_time() {
    let (server, url) = server_with_queue("empty.fifo", 30).await;
    let client = server.client();

    let started = Instant::now();
    let messages = client
        .receive_messages(&url, ReceiveOptions::default().wait(1))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(messages.is_empty());
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3));
}

#[tokio::test]
async fn test_errors() {
    let server = TestServer::start().await.unwrap();
    let client = server.client();

    let err = client.get_queue_url("no-such-queue").await.unwrap_err();
    assert_eq!(err.code(), Some("QueueDoesNotExist"));
    assert_eq!(
        err.to_string(),
        "QueueDoesNotExist: The specified queue does not exist."
    );

    let err = client.create_queue("not-fifo").await.unwrap_err();
    assert_eq!(err.code(), Some("InvalidParameterValue"));

    let url = client.create_queue("errors.fifo").await.unwrap();
    let err = client.send_message(&url, "body", "").await.unwrap_err();
    assert_eq!(err.code(), Some("MissingParameter"));

    let err = client.delete_message(&url, "garbage!").await.unwrap_err();
    assert_eq!(err.code(), Some("ReceiptHandleIsInvalid"));
}

#[tokio::test]
async fn test_queue_lifecycle() {
    let server = TestServer::start().await.unwrap();
    let client = server.client();

    let url = client.create_queue("life.fifo").await.unwrap();
    assert_eq!(client.create_queue("life.fifo").await.unwrap(), url);
    assert_eq!(client.get_queue_url("life.fifo").await.unwrap(), url);
    assert!(url.starts_with(server.url()));

    client.send_message(&url, "m", "g").await.unwrap();
    let attributes = client.get_queue_attributes(&url).await.unwrap();
    assert_eq!(attributes["ApproximateNumberOfMessages"], "1");
    assert_eq!(attributes["FifoQueue"], "true");

    client.purge_queue(&url).await.unwrap();
    let attributes = client.get_queue_attributes(&url).await.unwrap();
    assert_eq!(attributes["ApproximateNumberOfMessages"], "0");

    client.delete_queue(&url).await.unwrap();
    let err = client.get_queue_url("life.fifo").await.unwrap_err();
    assert_eq!(err.code(), Some("QueueDoesNotExist"));
}

#[tokio::test]
async fn test_delete_queue_ends_pending_long_poll() {
    let (server, url) = server_with_queue("pending.fifo", 30).await;
    let client = server.client();

    let receiver = {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move {
            client
                .receive_messages(&url, ReceiveOptions::default().wait(10))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    let started = Instant::now();
    client.delete_queue(&url).await.unwrap();

    let err = receiver.await.unwrap().unwrap_err();
    assert_eq!(err.code(), Some("QueueDoesNotExist"));
    assert!(started.elapsed() < Duration::from_secs(2));
}
