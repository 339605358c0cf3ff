//! Types shared by the frame transports.
//!
//! Both transports deliver the same view of a published frame and expose the
//! same statistics surface, so consumers can switch between shared memory
//! and the socket stream without code changes.

use std::path::PathBuf;

use url::Url;

use crate::checksum::{crc32_floats, CHECKSUM_CRC32};
use crate::error::CalderaError;

/// A read-only view of the latest published frame.
///
/// `data` points into transport-owned storage and stays valid until the next
/// poll on the same client; callers that need a stable snapshot copy it out.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub frame_id: u64,
    pub timestamp_ns: u64,
    pub width: u32,
    pub height: u32,
    pub float_count: u32,
    pub checksum: u32,
    pub checksum_algorithm: u32,
    /// Verification status; stays true until a verification fails.
    pub checksum_valid: bool,
    pub data: &'a [f32],
}

impl FrameView<'_> {
    /// Whether the producer attached a checksum to this frame.
    pub fn has_checksum(&self) -> bool {
        self.checksum_algorithm == CHECKSUM_CRC32 && self.checksum != 0
    }

    /// Recompute the payload CRC and compare. A frame without a checksum is
    /// never flagged as a mismatch.
    pub fn verify_checksum(&mut self) -> bool {
        if self.has_checksum() {
            self.checksum_valid = crc32_floats(self.data) == self.checksum;
        }
        self.checksum_valid
    }
}

/// Counters exposed by every publisher.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublisherStats {
    pub frames_attempted: u64,
    pub frames_published: u64,
    pub frames_dropped_capacity: u64,
    pub bytes_written: u64,
    /// EMA of the instantaneous publish rate.
    pub last_publish_fps: f32,
}

/// Counters exposed by every reader/client.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientStats {
    /// Polls that returned a frame.
    pub frames_observed: u64,
    /// Distinct frame-id transitions observed.
    pub distinct_frames: u64,
    /// Frames that carried a checksum.
    pub checksum_present: u64,
    pub checksum_verified: u64,
    pub checksum_mismatch: u64,
    pub last_frame_id: u64,
}

impl ClientStats {
    /// Record one observed frame, returning true when it is a new frame id.
    pub(crate) fn record_frame(&mut self, frame_id: u64) -> bool {
        self.frames_observed += 1;
        if self.distinct_frames == 0 || frame_id != self.last_frame_id {
            self.distinct_frames += 1;
            self.last_frame_id = frame_id;
            true
        } else {
            false
        }
    }
}

/// Parse a `unix:<path>` stream endpoint. Any other scheme is rejected.
pub fn parse_unix_endpoint(endpoint: &str) -> Result<PathBuf, CalderaError> {
    let url = Url::parse(endpoint)
        .map_err(|_| CalderaError::InvalidEndpoint(endpoint.to_string()))?;
    if url.scheme() != "unix" {
        return Err(CalderaError::InvalidEndpoint(endpoint.to_string()));
    }
    let path = url.path();
    if path.is_empty() {
        return Err(CalderaError::InvalidEndpoint(endpoint.to_string()));
    }
    Ok(PathBuf::from(path))
}
