use std::time::SystemTime;

use chrono::{DateTime, Local};

use super::cache::{AggregateEntry, FlowKey};

/// Header row written once at the top of every bucket file.
pub const HEADER: [&str; 5] = ["Timestamp", "Direction", "Size(Bytes)", "IP", "Port"];

/// Row timestamp format, e.g. `2024/05/01 14:59:59`.
pub const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Column positions within a row.
pub const COL_DIRECTION: usize = 1;
pub const COL_SIZE: usize = 2;
pub const COL_IP: usize = 3;

/// One persisted row: the total for a flow at the moment of a flush.
///
/// Direction, IP and port columns all come from `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: DateTime<Local>,
    pub key: FlowKey,
    pub size_sum: u64,
}

impl LogRecord {
    /// Builds a row stamped with the flush time rather than any packet time.
    pub fn from_entry(key: FlowKey, entry: &AggregateEntry, flushed_at: SystemTime) -> Self {
        Self {
            timestamp: DateTime::<Local>::from(flushed_at),
            key,
            size_sum: entry.size_sum,
        }
    }

    /// Renders the record as CSV fields in header order.
    pub fn to_row(&self) -> [String; 5] {
        [
            format_timestamp(self.timestamp),
            self.key.direction.as_str().to_string(),
            self.size_sum.to_string(),
            self.key.ip_label(),
            self.key.port_label(),
        ]
    }
}

pub fn format_timestamp(ts: DateTime<Local>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}
