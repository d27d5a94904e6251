use std::path::PathBuf;
use std::time::SystemTime;

use tracing::info;

use super::cache::AggregationCache;
use super::flush::CacheFlusher;
use super::rotation::{LogRotator, RotationError};
use super::summary::{Summary, SummaryReporter};

/// What the final shutdown sequence did.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// Rows written by the final flush.
    pub rows_flushed: usize,
    /// Bucket file that was open when shutdown started.
    pub closed_path: Option<PathBuf>,
    /// Summary of `closed_path`, if it had data.
    pub summary: Option<Summary>,
}

/// Runs the termination sequence: final flush, close, summary.
///
/// `run` consumes the coordinator, so the sequence executes at most once.
/// It borrows the rotator mutably for its whole duration, which keeps any
/// other flush from interleaving with it.
pub struct ShutdownCoordinator<'a> {
    cache: &'a AggregationCache,
    rotator: &'a mut LogRotator,
    flusher: CacheFlusher,
    reporter: SummaryReporter,
}

impl<'a> ShutdownCoordinator<'a> {
    pub fn new(
        cache: &'a AggregationCache,
        rotator: &'a mut LogRotator,
        flusher: CacheFlusher,
        reporter: SummaryReporter,
    ) -> Self {
        Self {
            cache,
            rotator,
            flusher,
            reporter,
        }
    }

    pub fn run(self, now: SystemTime) -> Result<ShutdownReport, RotationError> {
        let outcome = self.flusher.flush(self.cache, self.rotator, now)?;

        let closed_path = self.rotator.current_path().map(|p| p.to_path_buf());
        self.rotator.close()?;

        info!(
            rows = outcome.rows,
            pending = self.cache.len(),
            "final flush complete"
        );

        let summary = closed_path
            .as_deref()
            .and_then(|path| self.reporter.report(path));

        Ok(ShutdownReport {
            rows_flushed: outcome.rows,
            closed_path,
            summary,
        })
    }
}
