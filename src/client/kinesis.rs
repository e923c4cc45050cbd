use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::client::{PutRecordOutput, PutRecordRequest, StreamClient};
use crate::error::ClientError;

const PUT_RECORD_TARGET: &str = "Kinesis_20131202.PutRecord";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const THROTTLE_TYPES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "LimitExceededException",
    "ThrottlingException",
];

fn default_timeout_ms() -> u64 {
    10_000
}

/// Talks the Kinesis JSON protocol to `endpoint`. Requests are not signed, so
/// the endpoint is expected to be a local emulator or a signing proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KinesisConfig {
    pub endpoint: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

pub struct KinesisClient {
    config: KinesisConfig,
    client: reqwest::Client,
}

impl KinesisClient {
    pub fn from_config(config: KinesisConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self { config, client })
    }
}

fn request_body(request: &PutRecordRequest) -> Value {
    let mut body = json!({
        "StreamName": request.stream_name,
        "PartitionKey": request.partition_key,
        "Data": STANDARD.encode(&request.data),
    });
    if let Some(key) = &request.explicit_hash_key {
        body["ExplicitHashKey"] = json!(key);
    }
    if let Some(seq) = &request.sequence_number_for_ordering {
        body["SequenceNumberForOrdering"] = json!(seq);
    }
    body
}

/// Map a non-success response onto a typed client error.
fn classify(status: StatusCode, body: &str) -> ClientError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let error_type = parsed
        .get("__type")
        .and_then(Value::as_str)
        .map(|t| t.rsplit('#').next().unwrap_or(t))
        .unwrap_or_default();
    let message = parsed
        .get("message")
        .or_else(|| parsed.get("Message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string());

    if THROTTLE_TYPES.contains(&error_type) || status == StatusCode::TOO_MANY_REQUESTS {
        ClientError::Throttled(message)
    } else if status.is_client_error() {
        ClientError::Rejected {
            status: status.as_u16(),
            message: format!("{error_type}: {message}"),
        }
    } else {
        ClientError::Service {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl StreamClient for KinesisClient {
    async fn put_record(&self, request: PutRecordRequest) -> Result<PutRecordOutput, ClientError> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .header("X-Amz-Target", PUT_RECORD_TARGET)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(request_body(&request).to_string())
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(classify(status, &body));
        }

        let parsed: Value =
            serde_json::from_str(&body).map_err(|e| ClientError::Transport(e.to_string()))?;
        let field = |name: &str| {
            parsed
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Ok(PutRecordOutput {
            shard_id: field("ShardId"),
            sequence_number: field("SequenceNumber"),
        })
    }
}
