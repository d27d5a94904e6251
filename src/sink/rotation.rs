//! Hourly bucket files for aggregated rows.
//!
//! At most one bucket file is open at a time. Switching buckets flushes and
//! closes the previous writer before the next file is opened, and a header
//! row is written only when the file did not exist beforehand, so restarts
//! against an existing bucket never duplicate the header.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::{debug, info};

use super::record::{LogRecord, HEADER};

/// Bucket label format: year-month-day-hour, local time.
pub const BUCKET_LABEL_FORMAT: &str = "%Y-%m-%d-%H";

/// Errors raised while opening or appending to a bucket file.
#[derive(Error, Debug)]
pub enum RotationError {
    #[error("opening bucket file {}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("writing row to bucket file {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("flushing bucket file {}", .path.display())]
    Flush {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Label of the hourly window an event falls into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketLabel(String);

impl BucketLabel {
    pub fn from_time(t: SystemTime) -> Self {
        Self::from_datetime(DateTime::<Local>::from(t))
    }

    pub fn from_datetime(t: DateTime<Local>) -> Self {
        Self(t.format(BUCKET_LABEL_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Byte sink that keeps rendered rows until the underlying writer has
/// accepted them.
///
/// A failed write leaves the unsent tail buffered, so retrying resumes where
/// the previous attempt stopped and no row reaches the file twice.
pub struct PendingWriter<W> {
    inner: W,
    pending: Vec<u8>,
}

impl<W: Write> PendingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::with_capacity(4096),
        }
    }

    /// Renders `rows` as CSV and queues the bytes behind anything pending.
    pub fn push<I, R>(&mut self, rows: I) -> csv::Result<()>
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator,
        R::Item: AsRef<[u8]>,
    {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        for row in rows {
            writer.write_record(row)?;
        }
        let rendered = writer
            .into_inner()
            .map_err(|e| csv::Error::from(e.into_error()))?;

        self.pending.extend_from_slice(&rendered);
        Ok(())
    }

    /// Writes every pending byte, then flushes the underlying writer.
    pub fn write_pending(&mut self) -> io::Result<()> {
        while !self.pending.is_empty() {
            match self.inner.write(&self.pending) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "bucket file accepted no bytes",
                    ))
                }
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        self.inner.flush()
    }

    /// Bytes rendered but not yet accepted by the underlying writer.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

type BucketWriter = PendingWriter<Box<dyn Write + Send>>;

struct OpenBucket {
    label: BucketLabel,
    path: PathBuf,
    out: BucketWriter,
}

/// Owns the currently open bucket file and its CSV writer.
pub struct LogRotator {
    dir: PathBuf,
    file_prefix: String,
    current: Option<OpenBucket>,
}

impl LogRotator {
    /// Creates a rotator writing `<dir>/<file_prefix>-<label>.csv` files.
    pub fn new(dir: impl Into<PathBuf>, file_prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            file_prefix: file_prefix.into(),
            current: None,
        }
    }

    /// Path of the file backing `label`.
    pub fn path_for(&self, label: &BucketLabel) -> PathBuf {
        self.dir
            .join(format!("{}-{}.csv", self.file_prefix, label.as_str()))
    }

    /// Makes sure the bucket for `event_time` is the open one.
    ///
    /// Returns `true` when a new bucket file was opened.
    pub fn ensure_bucket(&mut self, event_time: SystemTime) -> Result<bool, RotationError> {
        let label = BucketLabel::from_time(event_time);
        if self
            .current
            .as_ref()
            .is_some_and(|open| open.label == label)
        {
            return Ok(false);
        }

        self.close()?;

        let path = self.path_for(&label);
        let is_new = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| RotationError::Open {
                path: path.clone(),
                source,
            })?;

        let file: Box<dyn Write + Send> = Box::new(file);
        let mut out: BucketWriter = PendingWriter::new(file);

        if is_new {
            out.push([HEADER]).map_err(|source| RotationError::Write {
                path: path.clone(),
                source,
            })?;
            out.write_pending().map_err(|source| RotationError::Flush {
                path: path.clone(),
                source,
            })?;
        }

        info!(path = %path.display(), bucket = %label, created = is_new, "opened bucket file");

        self.current = Some(OpenBucket { label, path, out });

        Ok(true)
    }

    /// Appends `records` to the open bucket and flushes them to disk.
    ///
    /// Returns the number of rows written; zero when no bucket is open yet.
    /// On a [`RotationError::Flush`] the rows stay buffered and
    /// [`retry_pending`](Self::retry_pending) finishes the write.
    pub fn write(&mut self, records: &[LogRecord]) -> Result<usize, RotationError> {
        let Some(open) = self.current.as_mut() else {
            return Ok(0);
        };

        open.out
            .push(records.iter().map(LogRecord::to_row))
            .map_err(|source| RotationError::Write {
                path: open.path.clone(),
                source,
            })?;

        open.out
            .write_pending()
            .map_err(|source| RotationError::Flush {
                path: open.path.clone(),
                source,
            })?;

        Ok(records.len())
    }

    /// Writes whatever a failed [`write`](Self::write) left buffered.
    pub fn retry_pending(&mut self) -> Result<(), RotationError> {
        let Some(open) = self.current.as_mut() else {
            return Ok(());
        };

        open.out
            .write_pending()
            .map_err(|source| RotationError::Flush {
                path: open.path.clone(),
                source,
            })
    }

    /// Flushes and closes the open bucket, if any.
    pub fn close(&mut self) -> Result<(), RotationError> {
        let Some(mut open) = self.current.take() else {
            return Ok(());
        };

        open.out
            .write_pending()
            .map_err(|source| RotationError::Flush {
                path: open.path.clone(),
                source,
            })?;

        debug!(path = %open.path.display(), "closed bucket file");

        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_label(&self) -> Option<&BucketLabel> {
        self.current.as_ref().map(|open| &open.label)
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|open| open.path.as_path())
    }

    /// Opens the bucket for `event_time` over `writer` instead of a file.
    #[cfg(test)]
    pub(crate) fn open_with_writer(
        &mut self,
        event_time: SystemTime,
        writer: Box<dyn Write + Send>,
    ) {
        let label = BucketLabel::from_time(event_time);
        let path = self.path_for(&label);
        self.current = Some(OpenBucket {
            label,
            path,
            out: PendingWriter::new(writer),
        });
    }
}
