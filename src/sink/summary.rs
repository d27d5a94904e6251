//! One-shot summary of a bucket file.
//!
//! The scan is linear over every data row: byte totals per direction and a
//! visit count per peer IP. The peer list shown in the report is the first
//! few entries of a hash map in iteration order, so which peers appear is
//! arbitrary and can change between runs. It is not a top-K by count.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::cache::Direction;
use super::record::{COL_DIRECTION, COL_IP, COL_SIZE};

/// Aggregate totals for one bucket file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub path: PathBuf,
    /// Data rows scanned, header excluded.
    pub rows: usize,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Visits per IP column value, including `unknown`.
    pub peer_visits: HashMap<String, u64>,
    peer_limit: usize,
}

impl Summary {
    /// Up to `peer_limit` peers in map iteration order.
    pub fn listed_peers(&self) -> Vec<(&str, u64)> {
        self.peer_visits
            .iter()
            .take(self.peer_limit)
            .map(|(ip, hits)| (ip.as_str(), *hits))
            .collect()
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "======= Summary Report =======")?;
        writeln!(f, "Total Uploaded:   {} bytes", self.uploaded)?;
        writeln!(f, "Total Downloaded: {} bytes", self.downloaded)?;
        writeln!(f)?;
        writeln!(f, "Top Contacted IPs:")?;
        for (ip, hits) in self.listed_peers() {
            writeln!(f, "- {ip}: {hits} connections")?;
        }
        writeln!(f, "==============================")
    }
}

/// Scans bucket files and prints summary reports.
#[derive(Debug, Clone, Copy)]
pub struct SummaryReporter {
    peer_limit: usize,
}

impl SummaryReporter {
    pub fn new(peer_limit: usize) -> Self {
        Self { peer_limit }
    }

    /// Reads `path` and computes its totals.
    ///
    /// Returns `None`, after logging, when the file cannot be opened, cannot
    /// be parsed, or holds no data row.
    pub fn summarize(&self, path: &Path) -> Option<Summary> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open log file for summary");
                return None;
            }
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);

        let mut summary = Summary {
            path: path.to_path_buf(),
            rows: 0,
            uploaded: 0,
            downloaded: 0,
            peer_visits: HashMap::new(),
            peer_limit: self.peer_limit,
        };

        for row in reader.byte_records() {
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    info!(path = %path.display(), error = %e, "no sufficient data for summary");
                    return None;
                }
            };

            // Malformed sizes count as zero; the row still counts as a visit.
            let size = row
                .get(COL_SIZE)
                .and_then(|raw| std::str::from_utf8(raw).ok())
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .unwrap_or(0);

            let direction = String::from_utf8_lossy(row.get(COL_DIRECTION).unwrap_or_default());
            match Direction::from_label(&direction) {
                Direction::Upload => summary.uploaded = summary.uploaded.saturating_add(size),
                Direction::Download => {
                    summary.downloaded = summary.downloaded.saturating_add(size);
                }
                Direction::Unknown => {}
            }

            // Undecodable bytes are replaced rather than failing the scan.
            let ip = String::from_utf8_lossy(row.get(COL_IP).unwrap_or_default());
            *summary.peer_visits.entry(ip.into_owned()).or_insert(0) += 1;
            summary.rows += 1;
        }

        if summary.rows == 0 {
            info!(path = %path.display(), "no sufficient data for summary");
            return None;
        }

        Some(summary)
    }

    /// Summarizes `path` and prints the report to stdout.
    pub fn report(&self, path: &Path) -> Option<Summary> {
        let summary = self.summarize(path)?;
        println!("{summary}");
        info!(
            path = %path.display(),
            rows = summary.rows,
            uploaded = summary.uploaded,
            downloaded = summary.downloaded,
            peers = summary.peer_visits.len(),
            "summary generated",
        );
        Some(summary)
    }
}

impl Default for SummaryReporter {
    fn default() -> Self {
        Self::new(5)
    }
}
