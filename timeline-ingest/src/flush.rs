use std::{sync::Arc, time::Instant};

use tracing::{error, info};

use crate::{
    datastore::Datastore,
    error::FlushError,
    event::EventRecord,
    metrics_consts::{FLUSHES, FLUSH_BATCH_SIZE, FLUSH_FAILURES, FLUSH_TIME, RECORDS_WRITTEN},
};

pub const DEFAULT_FLUSH_INTERVAL: usize = 1000;
/// Largest accepted flush interval.
pub const MAX_FLUSH_INTERVAL: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushSummary {
    pub total_written: u64,
    pub flush_calls: usize,
}

/// Buffers records and writes them to one index in batches of `threshold`.
/// Only one write is ever in flight, `push` and `finish` return once the
/// datastore has acknowledged the batch they triggered.
pub struct FlushController {
    datastore: Arc<dyn Datastore>,
    index: String,
    event_type: String,
    threshold: usize,
    buffer: Vec<EventRecord>,
    total_written: u64,
    flush_calls: usize,
}

impl FlushController {
    /// `threshold` must be at least 1, the caller validates it.
    pub fn new(
        datastore: Arc<dyn Datastore>,
        index: impl Into<String>,
        event_type: impl Into<String>,
        threshold: usize,
    ) -> Self {
        let threshold = threshold.max(1);
        Self {
            datastore,
            index: index.into(),
            event_type: event_type.into(),
            threshold,
            buffer: Vec::with_capacity(threshold.min(DEFAULT_FLUSH_INTERVAL)),
            total_written: 0,
            flush_calls: 0,
        }
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub async fn push(&mut self, record: EventRecord) -> Result<(), FlushError> {
        self.buffer.push(record);
        if self.buffer.len() >= self.threshold {
            self.flush().await?;
        }
        Ok(())
    }

    /// Writes out whatever is buffered. A no-op on an empty buffer.
    pub async fn flush(&mut self) -> Result<(), FlushError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let batch = std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(self.threshold.min(DEFAULT_FLUSH_INTERVAL)),
        );
        let batch_size = batch.len();
        let start = Instant::now();

        match self
            .datastore
            .bulk_write(&self.index, &self.event_type, &batch)
            .await
        {
            Ok(written) => {
                self.flush_calls += 1;
                self.total_written += written as u64;
                metrics::counter!(FLUSHES).increment(1);
                metrics::counter!(RECORDS_WRITTEN).increment(written as u64);
                metrics::histogram!(FLUSH_BATCH_SIZE).record(batch_size as f64);
                metrics::histogram!(FLUSH_TIME).record(start.elapsed().as_secs_f64());
                info!(
                    index = %self.index,
                    batch_size,
                    total_written = self.total_written,
                    "Flushed batch"
                );
                Ok(())
            }
            Err(source) => {
                metrics::counter!(FLUSH_FAILURES).increment(1);
                error!(
                    index = %self.index,
                    batch_size,
                    committed = self.total_written,
                    "Flush failed: {}",
                    source
                );
                Err(FlushError {
                    batch_size,
                    committed: self.total_written,
                    source,
                })
            }
        }
    }

    /// Flushes the trailing partial batch and reports the totals.
    pub async fn finish(mut self) -> Result<FlushSummary, FlushError> {
        self.flush().await?;
        Ok(FlushSummary {
            total_written: self.total_written,
            flush_calls: self.flush_calls,
        })
    }
}
