//! Work partitioning: split the ordered zone list into fixed-size packets
//!
//! Packets index *positions* in the ordered valid-zone list, not zone ids.
//! Ranges are inclusive on both ends, contiguous, non-overlapping, and cover
//! every position exactly once.

use butterfly_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default packet size used for both local and distributed execution
pub const DEFAULT_PACKET_SIZE: usize = 1000;

/// A contiguous `[start, end]` range of positions in the ordered zone list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkPacket {
    /// 1-based packet id, stable for the lifetime of a job
    pub id: u32,
    /// First position (inclusive)
    pub start: usize,
    /// Last position (inclusive)
    pub end: usize,
}

impl WorkPacket {
    /// Number of positions (rows) covered
    pub fn row_count(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn contains(&self, position: usize) -> bool {
        position >= self.start && position <= self.end
    }
}

/// Compute packet ranges for a list of `len` positions
///
/// The final packet is truncated to the list length. A list shorter than the
/// packet size yields a single packet; an empty list yields none.
pub fn calc_packet_ranges(len: usize, packet_size: usize) -> Result<Vec<WorkPacket>> {
    if packet_size == 0 {
        return Err(Error::Configuration(
            "packet size must be at least 1".to_string(),
        ));
    }

    let packets = (0..len)
        .step_by(packet_size)
        .enumerate()
        .map(|(i, start)| WorkPacket {
            id: i as u32 + 1,
            start,
            end: (start + packet_size).min(len) - 1,
        })
        .collect();

    Ok(packets)
}
