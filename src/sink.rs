use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::record::Record;
use crate::writer::BatchingWriter;

/// Something that takes records one at a time and is told exactly once that
/// no more are coming.
#[async_trait]
pub trait SequentialSink: Send {
    async fn accept(&mut self, record: Record);
    async fn drain_on_close(&mut self);
}

#[async_trait]
impl SequentialSink for BatchingWriter {
    async fn accept(&mut self, record: Record) {
        BatchingWriter::accept(self, record).await
    }

    async fn drain_on_close(&mut self) {
        BatchingWriter::drain_on_close(self).await
    }
}

/// Feed every record from `rx` into `sink`, one at a time, then drain it once
/// all senders are gone. A bounded channel gives producers backpressure: the
/// next record is not pulled until the previous `accept` has resolved.
pub async fn run<S>(sink: &mut S, mut rx: mpsc::Receiver<Record>)
where
    S: SequentialSink + ?Sized,
{
    let mut received = 0u64;
    while let Some(record) = rx.recv().await {
        sink.accept(record).await;
        received += 1;
    }
    // Channel closed, all producers done
    debug!(records = received, "input closed");
    sink.drain_on_close().await;
}
