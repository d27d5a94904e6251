use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::SystemTime;

use parking_lot::Mutex;

/// Traffic direction relative to the capture device's local address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
    Unknown,
}

impl Direction {
    /// Label written to the direction column of a log row.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "Upload",
            Self::Download => "Download",
            Self::Unknown => "unknown",
        }
    }

    /// Parses a direction column value. Anything unrecognized is `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label {
            "Upload" => Self::Upload,
            "Download" => Self::Download,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an aggregation bucket: direction plus the remote endpoint.
///
/// A missing peer address or port is rendered as `unknown` in log rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub direction: Direction,
    pub peer_ip: Option<IpAddr>,
    pub peer_port: Option<u16>,
}

impl FlowKey {
    /// Key used for packets without transport-layer endpoints.
    pub const fn unknown() -> Self {
        Self {
            direction: Direction::Unknown,
            peer_ip: None,
            peer_port: None,
        }
    }

    pub fn ip_label(&self) -> String {
        self.peer_ip
            .map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
    }

    pub fn port_label(&self) -> String {
        self.peer_port
            .map_or_else(|| "unknown".to_string(), |port| port.to_string())
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{}",
            self.direction,
            self.ip_label(),
            self.port_label()
        )
    }
}

/// Running totals for one flow since the last drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateEntry {
    pub size_sum: u64,
    pub last_seen: SystemTime,
}

/// Concurrency-safe map from flow identity to running byte totals.
///
/// `record` and every drain variant take the same exclusive lock, so a drain
/// observes either all or none of any concurrent `record`.
pub struct AggregationCache {
    entries: Mutex<HashMap<FlowKey, AggregateEntry>>,
}

impl AggregationCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(64)),
        }
    }

    /// Merges `size` bytes into the entry for `key`, creating it if absent.
    pub fn record(&self, key: FlowKey, size: u64) {
        self.record_at(key, size, SystemTime::now());
    }

    /// Same as [`record`](Self::record) with an explicit `last_seen` time.
    pub fn record_at(&self, key: FlowKey, size: u64, now: SystemTime) {
        let mut entries = self.entries.lock();
        entries
            .entry(key)
            .and_modify(|entry| {
                entry.size_sum = entry.size_sum.saturating_add(size);
                entry.last_seen = now;
            })
            .or_insert(AggregateEntry {
                size_sum: size,
                last_seen: now,
            });
    }

    /// Removes and returns every entry as one atomic step.
    ///
    /// Iteration order of the returned entries is unspecified.
    pub fn drain_all(&self) -> Vec<(FlowKey, AggregateEntry)> {
        self.drain_with(|drained| drained)
    }

    /// Drains every entry and hands them to `f` while the lock is still held.
    ///
    /// Concurrent `record` calls block until `f` returns, which lets a flush
    /// persist the drained batch before any newer total is accumulated.
    pub fn drain_with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(Vec<(FlowKey, AggregateEntry)>) -> R,
    {
        let mut entries = self.entries.lock();
        let drained: Vec<_> = entries.drain().collect();
        f(drained)
    }

    /// Number of distinct flows currently held.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for AggregationCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use super::*;

    fn upload_to(ip: [u8; 4], port: u16) -> FlowKey {
        FlowKey {
            direction: Direction::Upload,
            peer_ip: Some(IpAddr::V4(Ipv4Addr::from(ip))),
            peer_port: Some(port),
        }
    }

    #[test]
    fn test_record_same_key_sums_sizes() {
        let cache = AggregationCache::new();
        let key = upload_to([1, 1, 1, 1], 443);

        for size in [100, 50, 7, 0, 1500] {
            cache.record(key, size);
        }

        let drained = cache.drain_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, key);
        assert_eq!(drained[0].1.size_sum, 1657);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_record_updates_last_seen() {
        let cache = AggregationCache::new();
        let key = upload_to([8, 8, 8, 8], 53);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        let t1 = t0 + Duration::from_secs(5);

        cache.record_at(key, 10, t0);
        cache.record_at(key, 20, t1);

        let drained = cache.drain_all();
        assert_eq!(drained[0].1.last_seen, t1);
        assert_eq!(drained[0].1.size_sum, 30);
    }

    #[test]
    fn test_distinct_keys_stay_separate() {
        let cache = AggregationCache::new();
        cache.record(upload_to([1, 1, 1, 1], 443), 10);
        cache.record(upload_to([1, 1, 1, 1], 80), 20);
        cache.record(
            FlowKey {
                direction: Direction::Download,
                ..upload_to([1, 1, 1, 1], 443)
            },
            30,
        );
        cache.record(FlowKey::unknown(), 40);

        assert_eq!(cache.len(), 4);

        let total: u64 = cache.drain_all().iter().map(|(_, e)| e.size_sum).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_drain_empty_cache() {
        let cache = AggregationCache::new();
        assert!(cache.drain_all().is_empty());
        assert!(cache.is_empty());
        assert!(cache.drain_all().is_empty());
    }

    #[test]
    fn test_second_drain_sees_only_new_records() {
        let cache = AggregationCache::new();
        let key = upload_to([9, 9, 9, 9], 22);

        cache.record(key, 5);
        assert_eq!(cache.drain_all()[0].1.size_sum, 5);

        cache.record(key, 7);
        let drained = cache.drain_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1.size_sum, 7);
    }

    #[test]
    fn test_drain_with_returns_closure_result() {
        let cache = AggregationCache::new();
        cache.record(upload_to([1, 2, 3, 4], 1), 3);
        cache.record(upload_to([1, 2, 3, 4], 2), 4);

        let count = cache.drain_with(|entries| entries.len());
        assert_eq!(count, 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_record_saturates() {
        let cache = AggregationCache::new();
        let key = upload_to([1, 1, 1, 1], 1);
        cache.record(key, u64::MAX);
        cache.record(key, 10);
        assert_eq!(cache.drain_all()[0].1.size_sum, u64::MAX);
    }

    #[test]
    fn test_flow_key_labels() {
        let key = upload_to([10, 0, 0, 1], 8080);
        assert_eq!(key.ip_label(), "10.0.0.1");
        assert_eq!(key.port_label(), "8080");
        assert_eq!(key.to_string(), "Upload 10.0.0.1:8080");

        let unknown = FlowKey::unknown();
        assert_eq!(unknown.ip_label(), "unknown");
        assert_eq!(unknown.port_label(), "unknown");
        assert_eq!(unknown.to_string(), "unknown unknown:unknown");
    }

    #[test]
    fn test_direction_labels_round_trip() {
        for direction in [Direction::Upload, Direction::Download, Direction::Unknown] {
            assert_eq!(Direction::from_label(direction.as_str()), direction);
        }
        assert_eq!(Direction::from_label("upload"), Direction::Unknown);
    }
}
