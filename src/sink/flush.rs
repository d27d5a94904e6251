use std::time::SystemTime;

use tracing::{debug, warn};

use super::cache::AggregationCache;
use super::record::LogRecord;
use super::rotation::{LogRotator, RotationError};

/// Result of a single flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushOutcome {
    /// Rows appended to the bucket file.
    pub rows: usize,
    /// True when the flush was skipped because no bucket is open yet.
    pub skipped: bool,
}

/// Drains the aggregation cache into the open bucket file.
#[derive(Debug, Clone, Copy)]
pub struct CacheFlusher {
    write_retries: u32,
}

impl CacheFlusher {
    /// Creates a flusher that retries a failed batch write `write_retries`
    /// times before giving up.
    pub fn new(write_retries: u32) -> Self {
        Self { write_retries }
    }

    /// Drains `cache` and appends one row per flow, stamped with `now`.
    ///
    /// The drain and the write happen under the cache lock. Without an open
    /// bucket nothing is drained, so the entries wait for the first bucket.
    pub fn flush(
        &self,
        cache: &AggregationCache,
        rotator: &mut LogRotator,
        now: SystemTime,
    ) -> Result<FlushOutcome, RotationError> {
        if !rotator.is_open() {
            return Ok(FlushOutcome {
                rows: 0,
                skipped: true,
            });
        }

        cache.drain_with(|drained| -> Result<FlushOutcome, RotationError> {
            if drained.is_empty() {
                return Ok(FlushOutcome::default());
            }

            let records: Vec<LogRecord> = drained
                .iter()
                .map(|(key, entry)| LogRecord::from_entry(*key, entry, now))
                .collect();

            let rows = self.write_with_retry(rotator, &records)?;
            debug!(rows, "flushed aggregated flows");

            Ok(FlushOutcome {
                rows,
                skipped: false,
            })
        })
    }

    /// Writes the batch once. A failed flush leaves the rows buffered in the
    /// rotator, so each retry only pushes out the unwritten remainder.
    fn write_with_retry(
        &self,
        rotator: &mut LogRotator,
        records: &[LogRecord],
    ) -> Result<usize, RotationError> {
        let mut last = match rotator.write(records) {
            Ok(rows) => return Ok(rows),
            Err(e @ RotationError::Flush { .. }) => e,
            Err(e) => return Err(e),
        };

        for attempt in 1..=self.write_retries {
            warn!(error = %last, attempt, "bucket write failed, retrying");
            match rotator.retry_pending() {
                Ok(()) => return Ok(records.len()),
                Err(e) => last = e,
            }
        }

        Err(last)
    }
}

impl Default for CacheFlusher {
    fn default() -> Self {
        Self::new(2)
    }
}
