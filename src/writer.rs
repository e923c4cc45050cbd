//! The batching writer: buffers transformed records and ships them to the
//! stream client once the buffer is ready.
//!
//! Readiness is checked only when a record arrives. There is no background
//! flush timer, so a buffer whose interval has elapsed stays put until the
//! next record shows up or the writer is closed.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::{PutRecordRequest, StreamClient};
use crate::config::{PayloadMode, WriterConfig, WriterSettings};
use crate::error::{ConfigError, FlushError};
use crate::record::Record;
use crate::transform::{OutboundRecord, transform};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    pub records_accepted: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
    pub retries: u64,
    pub records_discarded: u64,
}

#[derive(Default)]
struct BufferState {
    records: Vec<OutboundRecord>,
    // Some iff `records` is non-empty.
    started_at: Option<Instant>,
    retry: Option<JoinHandle<()>>,
    stats: WriterStats,
}

impl BufferState {
    fn reset(&mut self) {
        self.records.clear();
        self.started_at = None;
    }

    fn retry_pending(&self) -> bool {
        self.retry.as_ref().is_some_and(|h| !h.is_finished())
    }
}

struct Inner {
    settings: WriterSettings,
    client: Arc<dyn StreamClient>,
    state: Mutex<BufferState>,
}

pub struct BatchingWriter {
    inner: Arc<Inner>,
    closed: bool,
}

impl BatchingWriter {
    pub fn new(config: WriterConfig, client: Arc<dyn StreamClient>) -> Result<Self, ConfigError> {
        let settings = config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                client,
                state: Mutex::new(BufferState::default()),
            }),
            closed: false,
        })
    }

    pub fn settings(&self) -> &WriterSettings {
        &self.inner.settings
    }

    /// Take one record. Returns once the record is buffered, or once the flush
    /// it triggered has resolved. Delivery failures never surface here.
    pub async fn accept(&mut self, record: Record) {
        if self.closed {
            warn!(event = %record.event, "record accepted after close, dropping");
            return;
        }

        let settings = &self.inner.settings;
        let outbound = transform(record, &settings.tags, settings.format);

        let mut state = self.inner.state.lock().await;
        state.records.push(outbound);
        state.stats.records_accepted += 1;
        if state.started_at.is_none() {
            state.started_at = Some(Instant::now());
        }

        if self.inner.is_ready(&state) {
            Inner::flush(&self.inner, &mut state, false).await;
        }
    }

    /// Flush whatever is buffered, regardless of threshold or interval. Only the
    /// first call has any effect.
    pub async fn drain_on_close(&mut self) {
        if self.closed {
            debug!("writer already closed");
            return;
        }
        self.closed = true;

        let mut state = self.inner.state.lock().await;
        if self.inner.settings.cancel_retry_on_close {
            if let Some(retry) = state.retry.take() {
                retry.abort();
                debug!("cancelled pending retry on close");
            }
        }
        info!(records = state.records.len(), "draining buffer on close");
        let closing = self.inner.settings.cancel_retry_on_close;
        Inner::flush(&self.inner, &mut state, closing).await;
    }

    /// Wait up to `grace` for a retry still pending after close. If it has not
    /// delivered the buffer by then it is aborted and the buffer discarded.
    pub async fn settle(&mut self, grace: Duration) {
        let Some(mut retry) = self.inner.state.lock().await.retry.take() else {
            return;
        };

        if tokio::time::timeout(grace, &mut retry).await.is_ok() {
            debug!("pending retry settled");
            return;
        }
        retry.abort();

        let mut state = self.inner.state.lock().await;
        let count = state.records.len();
        if count > 0 {
            state.stats.records_discarded += count as u64;
            warn!(records = count, grace = ?grace, "retry still failing at shutdown, discarding records");
            state.reset();
        }
    }

    pub async fn buffered(&self) -> usize {
        self.inner.state.lock().await.records.len()
    }

    pub async fn buffer_started_at(&self) -> Option<Instant> {
        self.inner.state.lock().await.started_at
    }

    pub async fn retry_pending(&self) -> bool {
        self.inner.state.lock().await.retry_pending()
    }

    pub async fn stats(&self) -> WriterStats {
        self.inner.state.lock().await.stats
    }
}

impl Inner {
    fn is_ready(&self, state: &BufferState) -> bool {
        if state.records.len() >= self.settings.threshold {
            return true;
        }
        match (self.settings.interval, state.started_at) {
            (Some(interval), Some(started)) => started.elapsed() >= interval,
            _ => false,
        }
    }

    /// Ship the buffer and apply the retry policy on failure. `closing` turns a
    /// failure into a discard even when retries are configured.
    async fn flush(inner: &Arc<Inner>, state: &mut BufferState, closing: bool) {
        let count = state.records.len();
        state.stats.flushes += 1;

        match inner.send(state).await {
            Ok(()) => {
                debug!(records = count, stream = %inner.settings.stream_name, "flushed buffer");
                state.reset();
            }
            Err(e) => {
                state.stats.failed_flushes += 1;
                error!(records = state.records.len(), "failed to flush buffer: {e}");
                match inner.settings.retry_delay {
                    Some(_) if !closing => Inner::schedule_retry(inner, state),
                    _ => {
                        state.stats.records_discarded += state.records.len() as u64;
                        warn!(records = state.records.len(), "discarding undelivered records");
                        state.reset();
                    }
                }
            }
        }
    }

    /// Send the buffer without touching its lifecycle, except that in
    /// per-record mode delivered records leave the buffer.
    async fn send(&self, state: &mut BufferState) -> Result<(), FlushError> {
        match self.settings.payload_mode {
            PayloadMode::Batch => {
                let data = serde_json::to_vec(&state.records)?;
                self.put(data).await
            }
            PayloadMode::PerRecord => {
                let mut delivered = 0;
                let mut outcome = Ok(());
                for record in &state.records {
                    let sent = match serde_json::to_vec(record) {
                        Ok(data) => self.put(data).await,
                        Err(e) => Err(e.into()),
                    };
                    if let Err(e) = sent {
                        outcome = Err(e);
                        break;
                    }
                    delivered += 1;
                }
                state.records.drain(..delivered);
                if state.records.is_empty() {
                    state.started_at = None;
                }
                outcome
            }
        }
    }

    async fn put(&self, data: Vec<u8>) -> Result<(), FlushError> {
        let request = PutRecordRequest {
            stream_name: self.settings.stream_name.clone(),
            partition_key: self.settings.partition_key.clone(),
            data,
            explicit_hash_key: self.settings.explicit_hash_key.clone(),
            sequence_number_for_ordering: self.settings.sequence_number_for_ordering.clone(),
        };
        self.client
            .put_record(request)
            .await
            .map(|_| ())
            .map_err(|source| FlushError::Client {
                stream: self.settings.stream_name.clone(),
                source,
            })
    }

    fn schedule_retry(inner: &Arc<Inner>, state: &mut BufferState) {
        if state.retry_pending() {
            debug!("retry already pending");
            return;
        }
        let Some(delay) = inner.settings.retry_delay else {
            return;
        };
        debug!(delay = ?delay, "scheduling retry");
        state.retry = Some(tokio::spawn(Inner::retry_loop(Arc::clone(inner))));
    }

    /// Single-delay retry, repeated for as long as attempts keep failing.
    async fn retry_loop(inner: Arc<Inner>) {
        let Some(delay) = inner.settings.retry_delay else {
            return;
        };
        loop {
            tokio::time::sleep(delay).await;

            let mut state = inner.state.lock().await;
            if state.records.is_empty() {
                debug!("retry found an empty buffer");
                state.retry = None;
                return;
            }

            state.stats.retries += 1;
            state.stats.flushes += 1;
            let count = state.records.len();
            match inner.send(&mut state).await {
                Ok(()) => {
                    info!(records = count, "retry delivered buffered records");
                    state.reset();
                    state.retry = None;
                    return;
                }
                Err(e) => {
                    state.stats.failed_flushes += 1;
                    error!(records = state.records.len(), "retry failed to flush buffer: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PutRecordOutput;
    use crate::error::ClientError;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::VecDeque;

    /// Records every request; fails while scripted failures remain.
    #[derive(Default)]
    struct RecordingClient {
        requests: std::sync::Mutex<Vec<PutRecordRequest>>,
        failures: std::sync::Mutex<VecDeque<bool>>,
    }

    impl RecordingClient {
        fn failing(pattern: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                requests: Default::default(),
                failures: std::sync::Mutex::new(pattern.iter().copied().collect()),
            })
        }

        fn requests(&self) -> Vec<PutRecordRequest> {
            self.requests.lock().unwrap().clone()
        }

        fn batches(&self) -> Vec<Value> {
            self.requests()
                .iter()
                .map(|r| serde_json::from_slice(&r.data).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl StreamClient for RecordingClient {
        async fn put_record(
            &self,
            request: PutRecordRequest,
        ) -> Result<PutRecordOutput, ClientError> {
            self.requests.lock().unwrap().push(request);
            let fail = self.failures.lock().unwrap().pop_front().unwrap_or(false);
            if fail {
                Err(ClientError::Throttled("simulated failure".into()))
            } else {
                Ok(PutRecordOutput::default())
            }
        }
    }

    fn config(threshold: usize, interval_ms: u64, retry_time_ms: u64) -> WriterConfig {
        WriterConfig {
            format: false,
            threshold,
            interval_ms,
            retry_time_ms,
            ..WriterConfig::new("llVool", "123")
        }
    }

    fn writer(config: WriterConfig, client: &Arc<RecordingClient>) -> BatchingWriter {
        BatchingWriter::new(config, client.clone() as Arc<dyn StreamClient>).unwrap()
    }

    fn record(n: i64) -> Record {
        Record::new("log", n).with_data(format!("message {n}"))
    }

    fn timestamps(batch: &Value) -> Vec<i64> {
        batch
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["timestamp"].as_i64().unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_every_threshold_records() {
        let client = Arc::new(RecordingClient::default());
        let mut writer = writer(config(3, 0, 0), &client);

        for n in 0..7 {
            writer.accept(record(n)).await;
        }

        let batches = client.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(timestamps(&batches[0]), vec![0, 1, 2]);
        assert_eq!(timestamps(&batches[1]), vec![3, 4, 5]);
        assert_eq!(writer.buffered().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_carries_routing_parameters() {
        let client = Arc::new(RecordingClient::default());
        let mut writer = writer(
            WriterConfig {
                explicit_hash_key: Some("42".into()),
                sequence_number_for_ordering: Some("7".into()),
                ..config(1, 0, 0)
            },
            &client,
        );

        writer.accept(record(1)).await;

        let requests = client.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].stream_name, "llVool");
        assert_eq!(requests[0].partition_key, "123");
        assert_eq!(requests[0].explicit_hash_key.as_deref(), Some("42"));
        assert_eq!(requests[0].sequence_number_for_ordering.as_deref(), Some("7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_has_no_background_timer() {
        let client = Arc::new(RecordingClient::default());
        let mut writer = writer(config(10, 1_000, 0), &client);

        writer.accept(record(1)).await;
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert!(client.requests().is_empty());
        assert_eq!(writer.buffered().await, 1);

        writer.accept(record(2)).await;
        let batches = client.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(timestamps(&batches[0]), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_not_reached() {
        let client = Arc::new(RecordingClient::default());
        let mut writer = writer(config(10, 1_000, 0), &client);

        writer.accept(record(1)).await;
        tokio::time::sleep(Duration::from_millis(999)).await;
        writer.accept(record(2)).await;

        assert!(client.requests().is_empty());
        assert_eq!(writer.buffered().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_flush_resets_buffer() {
        let client = Arc::new(RecordingClient::default());
        let mut writer = writer(config(2, 0, 0), &client);

        writer.accept(record(1)).await;
        let first_start = writer.buffer_started_at().await.unwrap();
        writer.accept(record(2)).await;

        assert_eq!(writer.buffered().await, 0);
        assert_eq!(writer.buffer_started_at().await, None);

        tokio::time::sleep(Duration::from_millis(10)).await;
        writer.accept(record(3)).await;
        let next_start = writer.buffer_started_at().await.unwrap();
        assert!(next_start > first_start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_without_retry_discards() {
        let client = RecordingClient::failing(&[true]);
        let mut writer = writer(config(2, 0, 0), &client);

        writer.accept(record(1)).await;
        writer.accept(record(2)).await;

        assert_eq!(client.requests().len(), 1);
        assert_eq!(writer.buffered().await, 0);
        assert_eq!(writer.buffer_started_at().await, None);
        assert!(!writer.retry_pending().await);

        let stats = writer.stats().await;
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(stats.records_discarded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_with_retry_keeps_records_and_resends() {
        let client = RecordingClient::failing(&[true]);
        let mut writer = writer(config(2, 0, 1_000), &client);

        writer.accept(record(1)).await;
        writer.accept(record(2)).await;

        assert_eq!(writer.buffered().await, 2);
        assert!(writer.buffer_started_at().await.is_some());
        assert!(writer.retry_pending().await);

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(client.requests().len(), 1);

        tokio::time::sleep(Duration::from_millis(2)).await;
        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], requests[1]);
        assert_eq!(writer.buffered().await, 0);
        assert!(!writer.retry_pending().await);
        assert_eq!(writer.stats().await.retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_repeats_until_success() {
        let client = RecordingClient::failing(&[true, true, true]);
        let mut writer = writer(config(1, 0, 100), &client);

        writer.accept(record(1)).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(client.requests().len(), 3);
        assert!(writer.retry_pending().await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.requests().len(), 4);
        assert_eq!(writer.buffered().await, 0);
        assert!(!writer.retry_pending().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_during_pending_retry_join_the_batch() {
        let client = RecordingClient::failing(&[true]);
        let mut writer = writer(config(5, 0, 1_000), &client);

        for n in 0..5 {
            writer.accept(record(n)).await;
        }
        // Buffer is still over threshold, so the next record triggers a fresh
        // flush that succeeds before the retry fires.
        writer.accept(record(5)).await;
        let batches = client.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(timestamps(&batches[1]), vec![0, 1, 2, 3, 4, 5]);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(client.requests().len(), 2, "retry against an empty buffer sends nothing");
        assert!(!writer.retry_pending().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_on_close_flushes_below_threshold() {
        let client = Arc::new(RecordingClient::default());
        let mut writer = writer(config(10, 600_000, 0), &client);

        writer.accept(record(1)).await;
        writer.accept(record(2)).await;
        assert!(client.requests().is_empty());

        writer.drain_on_close().await;
        let batches = client.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(timestamps(&batches[0]), vec![1, 2]);
        assert_eq!(writer.buffered().await, 0);

        writer.drain_on_close().await;
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_on_close_sends_empty_buffer() {
        let client = Arc::new(RecordingClient::default());
        let mut writer = writer(config(10, 0, 0), &client);

        writer.drain_on_close().await;
        assert_eq!(client.batches(), vec![json!([])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_after_close_drops_record() {
        let client = Arc::new(RecordingClient::default());
        let mut writer = writer(config(1, 0, 0), &client);

        writer.drain_on_close().await;
        writer.accept(record(1)).await;
        assert_eq!(client.requests().len(), 1);
        assert_eq!(writer.buffered().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_survives_close_by_default() {
        let client = RecordingClient::failing(&[true, true]);
        let mut writer = writer(config(1, 0, 1_000), &client);

        writer.accept(record(1)).await;
        assert!(writer.retry_pending().await);

        // The drain flush fails too; the pending retry still covers the buffer.
        writer.drain_on_close().await;
        assert_eq!(client.requests().len(), 2);
        assert_eq!(writer.buffered().await, 1);

        tokio::time::sleep(Duration::from_millis(1_001)).await;
        assert_eq!(client.requests().len(), 3);
        assert_eq!(writer.buffered().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_waits_for_pending_retry() {
        let client = RecordingClient::failing(&[true, true]);
        let mut writer = writer(config(10, 0, 50), &client);

        writer.accept(record(1)).await;
        writer.drain_on_close().await;
        assert!(writer.retry_pending().await);

        writer.settle(Duration::from_secs(1)).await;
        assert_eq!(client.requests().len(), 3);
        assert_eq!(writer.buffered().await, 0);
        assert_eq!(writer.stats().await.records_discarded, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_discards_after_grace() {
        let client = RecordingClient::failing(&[true; 100]);
        let mut writer = writer(config(10, 0, 50), &client);

        writer.accept(record(1)).await;
        writer.accept(record(2)).await;
        writer.drain_on_close().await;

        writer.settle(Duration::from_millis(175)).await;
        assert!(!writer.retry_pending().await);
        assert_eq!(writer.buffered().await, 0);
        assert_eq!(writer.stats().await.records_discarded, 2);

        let sent = client.requests().len();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.requests().len(), sent, "aborted retry must not fire again");
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_without_pending_retry_returns() {
        let client = Arc::new(RecordingClient::default());
        let mut writer = writer(config(10, 0, 50), &client);

        writer.accept(record(1)).await;
        writer.drain_on_close().await;
        writer.settle(Duration::from_secs(1)).await;
        assert_eq!(client.requests().len(), 1);
        assert_eq!(writer.stats().await.records_discarded, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_can_cancel_pending_retry() {
        let client = RecordingClient::failing(&[true, true]);
        let mut writer = writer(
            WriterConfig {
                cancel_retry_on_close: true,
                ..config(1, 0, 1_000)
            },
            &client,
        );

        writer.accept(record(1)).await;
        assert!(writer.retry_pending().await);

        writer.drain_on_close().await;
        assert!(!writer.retry_pending().await);
        assert_eq!(writer.buffered().await, 0);

        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert_eq!(client.requests().len(), 2);
        assert_eq!(writer.stats().await.records_discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_record_mode_discards_only_undelivered() {
        let client = RecordingClient::failing(&[false, false, false, true]);
        let mut writer = writer(
            WriterConfig {
                payload_mode: PayloadMode::PerRecord,
                ..config(5, 0, 0)
            },
            &client,
        );

        for n in 0..5 {
            writer.accept(record(n)).await;
        }

        assert_eq!(client.requests().len(), 4);
        assert_eq!(writer.buffered().await, 0);
        assert_eq!(writer.stats().await.records_discarded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_record_mode_keeps_undelivered_tail() {
        let client = RecordingClient::failing(&[false, true]);
        let mut writer = writer(
            WriterConfig {
                payload_mode: PayloadMode::PerRecord,
                ..config(3, 0, 500)
            },
            &client,
        );

        for n in 0..3 {
            writer.accept(record(n)).await;
        }

        let batches = client.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0]["timestamp"], 0);
        assert_eq!(batches[1]["timestamp"], 1);
        assert_eq!(writer.buffered().await, 2);

        tokio::time::sleep(Duration::from_millis(501)).await;
        let batches = client.batches();
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[2]["timestamp"], 1);
        assert_eq!(batches[3]["timestamp"], 2);
        assert_eq!(writer.buffered().await, 0);
        assert_eq!(writer.buffer_started_at().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_formatted_records_in_batch() {
        let client = Arc::new(RecordingClient::default());
        let mut writer = writer(
            WriterConfig {
                format: true,
                tags: vec!["obe".into(), "fox-services-testing".into()],
                ..config(1, 0, 0)
            },
            &client,
        );

        writer
            .accept(
                Record::new("log", 1519222686435)
                    .with_tags(["info", "db"])
                    .with_data("Configuring database"),
            )
            .await;

        assert_eq!(
            client.batches(),
            vec![json!([{
                "timestamp": "2018-02-21T14:18:06.435Z",
                "tags": ["info", "db", "obe", "fox-services-testing"],
                "log": "Configuring database"
            }])]
        );
    }
}
