use async_trait::async_trait;
use tracing::info;

use crate::error::ClientError;

#[cfg(feature = "kinesis")]
pub mod kinesis;

/// One `PutRecord` call against the append-only stream service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRecordRequest {
    pub stream_name: String,
    pub partition_key: String,
    pub data: Vec<u8>,
    pub explicit_hash_key: Option<String>,
    pub sequence_number_for_ordering: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutRecordOutput {
    pub shard_id: String,
    pub sequence_number: String,
}

/// Downstream side of the forwarder. Implementations own their own
/// connection, credentials and timeouts.
#[async_trait]
pub trait StreamClient: Send + Sync {
    async fn put_record(&self, request: PutRecordRequest) -> Result<PutRecordOutput, ClientError>;
}

/// A client that prints each put through `tracing`. Mostly useful for local runs
/// and for watching what a real stream would receive.
pub struct StdoutClient;

#[async_trait]
impl StreamClient for StdoutClient {
    async fn put_record(&self, request: PutRecordRequest) -> Result<PutRecordOutput, ClientError> {
        info!(
            stream = %request.stream_name,
            partition_key = %request.partition_key,
            bytes = request.data.len(),
            "{}",
            String::from_utf8_lossy(&request.data)
        );
        Ok(PutRecordOutput::default())
    }
}
