//! Stream client doubles for integration tests

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kinesis_forwarder::client::{PutRecordOutput, PutRecordRequest, StreamClient};
use kinesis_forwarder::error::ClientError;
use serde_json::Value;

/// Stores every put and fails the first `fail_first` calls.
pub struct MockStreamClient {
    requests: Mutex<Vec<PutRecordRequest>>,
    fail_first: u32,
    calls: AtomicU32,
    latency: Duration,
}

#[allow(dead_code)]
impl MockStreamClient {
    pub fn new() -> Self {
        Self::failing(0)
    }

    pub fn failing(fail_first: u32) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            fail_first,
            calls: AtomicU32::new(0),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn requests(&self) -> Vec<PutRecordRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Each put decoded as JSON.
    pub fn payloads(&self) -> Vec<Value> {
        self.requests()
            .iter()
            .map(|r| serde_json::from_slice(&r.data).unwrap())
            .collect()
    }
}

#[async_trait]
impl StreamClient for MockStreamClient {
    async fn put_record(&self, request: PutRecordRequest) -> Result<PutRecordOutput, ClientError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.requests.lock().unwrap().push(request);
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(ClientError::Service {
                status: 503,
                message: "simulated outage".into(),
            });
        }
        Ok(PutRecordOutput {
            shard_id: "shardId-000000000000".into(),
            sequence_number: call.to_string(),
        })
    }
}
