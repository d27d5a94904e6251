use std::sync::atomic::{AtomicU64, Ordering};

use crate::sink::cache::Direction;

const DIRECTIONS: [Direction; 3] = [Direction::Upload, Direction::Download, Direction::Unknown];

/// Lock-free per-direction packet and byte counters.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
pub struct PacketStats {
    packets: [AtomicU64; 3],
    bytes: [AtomicU64; 3],
}

/// Counters for one direction since the previous snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionCount {
    pub direction: Direction,
    pub packets: u64,
    pub bytes: u64,
}

fn slot(direction: Direction) -> usize {
    match direction {
        Direction::Upload => 0,
        Direction::Download => 1,
        Direction::Unknown => 2,
    }
}

impl PacketStats {
    /// Create a new zeroed PacketStats.
    pub fn new() -> Self {
        Self {
            packets: std::array::from_fn(|_| AtomicU64::new(0)),
            bytes: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Count one packet of `size` bytes.
    pub fn record(&self, direction: Direction, size: u64) {
        let i = slot(direction);
        self.packets[i].fetch_add(1, Ordering::Relaxed);
        self.bytes[i].fetch_add(size, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters, returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<DirectionCount> {
        let mut result = Vec::new();

        for direction in DIRECTIONS {
            let i = slot(direction);
            let packets = self.packets[i].swap(0, Ordering::Relaxed);
            let bytes = self.bytes[i].swap(0, Ordering::Relaxed);
            if packets > 0 {
                result.push(DirectionCount {
                    direction,
                    packets,
                    bytes,
                });
            }
        }

        result
    }
}

impl Default for PacketStats {
    fn default() -> Self {
        Self::new()
    }
}
