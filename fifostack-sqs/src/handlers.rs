//! HTTP handlers for the SQS JSON protocol

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
    routing::post,
    Router,
};
use bytes::Bytes;
use fifostack_core::{AwsError, ErrorCode, RequestId};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::SqsError;
use crate::message::{ReceivedMessage, SendRequest};
use crate::queue::QueueConfig;
use crate::storage::SqsStorage;

const CONTENT_TYPE_JSON: &str = "application/x-amz-json-1.0";
const TARGET_PREFIX: &str = "AmazonSQS.";

/// Shared state for SQS handlers
#[derive(Debug, Clone)]
pub struct SqsState {
    pub storage: Arc<SqsStorage>,
}

impl SqsState {
    pub fn new(storage: Arc<SqsStorage>) -> Self {
        Self { storage }
    }
}

/// Router serving the SQS API at `/`
pub fn router(state: Arc<SqsState>) -> Router {
    Router::new()
        .route("/", post(handle_request))
        .with_state(state)
}

/// Handle SQS requests based on X-Amz-Target header
pub async fn handle_request(
    State(state): State<Arc<SqsState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = RequestId::new();

    let target = headers
        .get("x-amz-target")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let action = target.strip_prefix(TARGET_PREFIX).unwrap_or(target);

    info!(action = %action, request_id = %request_id.id, "SQS request");

    let result = match parse_body(&body) {
        Ok(body) => dispatch(&state.storage, action, body).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(reply) => json_response(&request_id, reply),
        Err(e) => {
            warn!(action = %action, code = e.code.as_str(), message = %e.message, "SQS request failed");
            error_response(&request_id, &e)
        }
    }
}

/// Successful reply plus any extra response headers
struct Reply {
    body: Value,
    headers: Vec<(&'static str, String)>,
}

impl From<Value> for Reply {
    fn from(body: Value) -> Self {
        Self {
            body,
            headers: Vec::new(),
        }
    }
}

async fn dispatch(storage: &SqsStorage, action: &str, body: Value) -> Result<Reply, AwsError> {
    let reply: Reply = match action {
        "CreateQueue" => create_queue(storage, parse(body)?)?.into(),
        "GetQueueUrl" => get_queue_url(storage, parse(body)?)?.into(),
        "DeleteQueue" => delete_queue(storage, parse(body)?)?.into(),
        "ListQueues" => list_queues(storage, parse(body)?).into(),
        "GetQueueAttributes" => get_queue_attributes(storage, parse(body)?)?.into(),
        "PurgeQueue" => purge_queue(storage, parse(body)?)?.into(),
        "SendMessage" => send_message(storage, parse(body)?)?.into(),
        "ReceiveMessage" => receive_message(storage, parse(body)?).await?.into(),
        "DeleteMessage" => delete_message(storage, parse(body)?)?,
        _ => {
            return Err(AwsError::new(
                ErrorCode::InvalidAction,
                format!("The action {action} is not valid for this endpoint."),
            ))
        }
    };
    Ok(reply)
}

// === Request parsing ===

fn parse_body(body: &[u8]) -> Result<Value, AwsError> {
    if body.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(|e| {
        AwsError::new(
            ErrorCode::SerializationException,
            format!("Invalid JSON: {e}"),
        )
    })
}

fn parse<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, AwsError> {
    serde_json::from_value(body).map_err(|e| {
        AwsError::new(
            ErrorCode::SerializationException,
            format!("Invalid request: {e}"),
        )
    })
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, AwsError> {
    value.filter(|v| !v.is_empty()).ok_or_else(|| {
        AwsError::new(
            ErrorCode::MissingParameter,
            format!("The request must contain the parameter {name}."),
        )
    })
}

fn sqs(error: &SqsError) -> AwsError {
    AwsError::from(error)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueueNameRequest {
    queue_name: Option<String>,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueueUrlRequest {
    queue_url: Option<String>,
    #[serde(default)]
    attribute_names: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ListQueuesRequest {
    queue_name_prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MessageAttributeValue {
    data_type: String,
    string_value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendMessageRequest {
    queue_url: Option<String>,
    message_body: Option<String>,
    message_group_id: Option<String>,
    message_deduplication_id: Option<String>,
    #[serde(default)]
    message_attributes: HashMap<String, MessageAttributeValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveMessageRequest {
    queue_url: Option<String>,
    max_number_of_messages: Option<usize>,
    wait_time_seconds: Option<u64>,
    #[serde(default)]
    attribute_names: Vec<String>,
    #[serde(default)]
    message_system_attribute_names: Vec<String>,
    #[serde(default)]
    message_attribute_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeleteMessageRequest {
    queue_url: Option<String>,
    receipt_handle: Option<String>,
}

// === Handlers ===

fn create_queue(storage: &SqsStorage, request: QueueNameRequest) -> Result<Value, AwsError> {
    let name = required(request.queue_name.as_deref(), "QueueName")?;
    let config = QueueConfig::from_attributes(&request.attributes).map_err(|e| sqs(&e))?;
    let queue = storage.create_queue(name, config).map_err(|e| sqs(&e))?;
    Ok(json!({ "QueueUrl": queue.url }))
}

fn get_queue_url(storage: &SqsStorage, request: QueueNameRequest) -> Result<Value, AwsError> {
    let name = required(request.queue_name.as_deref(), "QueueName")?;
    let queue = storage.get_queue(name).map_err(|e| sqs(&e))?;
    Ok(json!({ "QueueUrl": queue.url }))
}

fn delete_queue(storage: &SqsStorage, request: QueueUrlRequest) -> Result<Value, AwsError> {
    let url = required(request.queue_url.as_deref(), "QueueUrl")?;
    let queue = storage.queue_for_url(url).map_err(|e| sqs(&e))?;
    storage.delete_queue(&queue.name).map_err(|e| sqs(&e))?;
    Ok(json!({}))
}

fn list_queues(storage: &SqsStorage, request: ListQueuesRequest) -> Value {
    let urls = storage.list_queues(request.queue_name_prefix.as_deref());
    if urls.is_empty() {
        json!({})
    } else {
        json!({ "QueueUrls": urls })
    }
}

fn get_queue_attributes(storage: &SqsStorage, request: QueueUrlRequest) -> Result<Value, AwsError> {
    let url = required(request.queue_url.as_deref(), "QueueUrl")?;
    let queue = storage.queue_for_url(url).map_err(|e| sqs(&e))?;

    let wanted = NameFilter::new(&request.attribute_names);
    let attributes: Map<String, Value> = queue
        .attributes()
        .into_iter()
        .filter(|(name, _)| wanted.matches(name))
        .map(|(name, value)| (name, Value::String(value)))
        .collect();

    Ok(json!({ "Attributes": attributes }))
}

fn purge_queue(storage: &SqsStorage, request: QueueUrlRequest) -> Result<Value, AwsError> {
    let url = required(request.queue_url.as_deref(), "QueueUrl")?;
    storage
        .queue_for_url(url)
        .and_then(|queue| queue.purge())
        .map_err(|e| sqs(&e))?;
    Ok(json!({}))
}

fn send_message(storage: &SqsStorage, request: SendMessageRequest) -> Result<Value, AwsError> {
    let url = required(request.queue_url.as_deref(), "QueueUrl")?;
    let body = required(request.message_body.as_deref(), "MessageBody")?;
    let group_id = required(request.message_group_id.as_deref(), "MessageGroupId")?;
    let queue = storage.queue_for_url(url).map_err(|e| sqs(&e))?;

    let mut attributes = HashMap::with_capacity(request.message_attributes.len());
    for (name, value) in request.message_attributes {
        let string_value = value.string_value.ok_or_else(|| {
            AwsError::new(
                ErrorCode::InvalidParameterValue,
                format!(
                    "Message attribute {name} of type {} must carry a StringValue",
                    value.data_type
                ),
            )
        })?;
        attributes.insert(name, string_value);
    }

    let receipt = queue
        .send(SendRequest {
            group_id: group_id.to_string(),
            dedup_id: request.message_deduplication_id,
            body: Bytes::copy_from_slice(body.as_bytes()),
            attributes,
        })
        .map_err(|e| sqs(&e))?;

    Ok(json!({
        "MD5OfMessageBody": receipt.body_md5,
        "MessageId": receipt.message_id.to_string(),
        "SequenceNumber": receipt.sequence_number,
    }))
}

async fn receive_message(
    storage: &SqsStorage,
    request: ReceiveMessageRequest,
) -> Result<Value, AwsError> {
    let url = required(request.queue_url.as_deref(), "QueueUrl")?;
    let queue = storage.queue_for_url(url).map_err(|e| sqs(&e))?;

    let messages = queue
        .receive(
            request.max_number_of_messages.unwrap_or(1),
            request.wait_time_seconds.map(Duration::from_secs),
        )
        .await
        .map_err(|e| sqs(&e))?;

    if messages.is_empty() {
        return Ok(json!({}));
    }

    let mut system_names = request.attribute_names;
    system_names.extend(request.message_system_attribute_names);
    let system_filter = NameFilter::new(&system_names);
    let attribute_filter = NameFilter::new(&request.message_attribute_names);

    let messages: Vec<Value> = messages
        .iter()
        .map(|m| message_json(m, &system_filter, &attribute_filter))
        .collect();

    Ok(json!({ "Messages": messages }))
}

fn delete_message(storage: &SqsStorage, request: DeleteMessageRequest) -> Result<Reply, AwsError> {
    let url = required(request.queue_url.as_deref(), "QueueUrl")?;
    let receipt_handle = required(request.receipt_handle.as_deref(), "ReceiptHandle")?;
    let queue = storage.queue_for_url(url).map_err(|e| sqs(&e))?;

    let deleted = queue.delete(receipt_handle).map_err(|e| sqs(&e))?;

    Ok(Reply {
        body: json!({}),
        headers: vec![("x-fifostack-deleted", deleted.to_string())],
    })
}

// === Response helpers ===

/// Attribute name selection: nothing requested means nothing returned,
/// `All` (or `.*`) means everything
struct NameFilter<'a> {
    names: &'a [String],
}

impl<'a> NameFilter<'a> {
    fn new(names: &'a [String]) -> Self {
        Self { names }
    }

    fn matches(&self, name: &str) -> bool {
        self.names.iter().any(|wanted| {
            wanted == "All"
                || wanted == ".*"
                || wanted == name
                || wanted
                    .strip_suffix(".*")
                    .is_some_and(|prefix| name.starts_with(prefix))
        })
    }
}

fn message_json(
    message: &ReceivedMessage,
    system_filter: &NameFilter<'_>,
    attribute_filter: &NameFilter<'_>,
) -> Value {
    let mut value = json!({
        "MessageId": message.message_id.to_string(),
        "ReceiptHandle": message.receipt_token,
        "MD5OfBody": message.body_md5,
        "Body": message.body_text(),
    });

    let system: Map<String, Value> = message
        .system_attributes()
        .into_iter()
        .filter(|(name, _)| system_filter.matches(name))
        .map(|(name, v)| (name.to_string(), Value::String(v)))
        .collect();
    if !system.is_empty() {
        value["Attributes"] = Value::Object(system);
    }

    let attributes: Map<String, Value> = message
        .attributes
        .iter()
        .filter(|(name, _)| attribute_filter.matches(name))
        .map(|(name, v)| {
            (
                name.clone(),
                json!({ "DataType": "String", "StringValue": v }),
            )
        })
        .collect();
    if !attributes.is_empty() {
        value["MessageAttributes"] = Value::Object(attributes);
    }

    value
}

fn json_response(request_id: &RequestId, reply: Reply) -> Response {
    let mut response = Response::new(Body::from(reply.body.to_string()));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(CONTENT_TYPE_JSON),
    );
    insert_request_id(headers, request_id);
    for (name, value) in reply.headers {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
    response
}

fn error_response(request_id: &RequestId, error: &AwsError) -> Response {
    let mut response = Response::new(Body::from(error.to_json()));
    *response.status_mut() = StatusCode::BAD_REQUEST;

    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(CONTENT_TYPE_JSON),
    );
    if let Ok(value) = HeaderValue::from_str(&error.query_error_header()) {
        headers.insert("x-amzn-query-error", value);
    }
    insert_request_id(headers, request_id);
    response
}

fn insert_request_id(headers: &mut HeaderMap, request_id: &RequestId) {
    if let Ok(value) = HeaderValue::from_str(&request_id.id) {
        headers.insert("x-amzn-requestid", value);
    }
    if let Ok(value) = HeaderValue::from_str(&request_id.extended_id) {
        headers.insert("x-amz-id-2", value);
    }
}
