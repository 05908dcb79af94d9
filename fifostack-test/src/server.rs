//! In-process test server

use fifostack_sqs::{router, SqsState, SqsStorage};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use crate::client::SqsClient;

/// A fifostack server bound to a random local port
pub struct TestServer {
    base_url: String,
    storage: Arc<SqsStorage>,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Bind `127.0.0.1:0` and serve the SQS API until dropped
    pub async fn start() -> Result<Self, TestError> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| TestError::StartFailed(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| TestError::StartFailed(e.to_string()))?;
        let base_url = format!("http://{addr}");

        let storage = Arc::new(SqsStorage::with_endpoint(&base_url));
        let app = router(Arc::new(SqsState::new(storage.clone())));

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Test server stopped");
            }
        });

        info!(addr = %addr, "Started fifostack test server");
        Ok(Self {
            base_url,
            storage,
            task,
        })
    }

    pub fn url(&self) -> &str {
        &self.base_url
    }

    /// Direct access to the queues behind the server
    pub fn storage(&self) -> &Arc<SqsStorage> {
        &self.storage
    }

    pub fn client(&self) -> SqsClient {
        SqsClient::new(self.base_url.clone())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Test errors
#[derive(Debug, Error)]
pub enum TestError {
    #[error("Failed to start server: {0}")]
    StartFailed(String),
}
