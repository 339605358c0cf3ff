//! Payload integrity: CRC-32 over height map bytes plus the duty-cycle
//! policy that decides when a publisher recomputes it.

use std::time::{Duration, Instant};

/// Algorithm id meaning "no checksum was computed for this frame".
pub const CHECKSUM_NONE: u32 = 0;
/// Algorithm id for CRC-32 (polynomial 0xEDB88320, init/final 0xFFFFFFFF)
/// over the raw little-endian bytes of the f32 payload.
pub const CHECKSUM_CRC32: u32 = 1;

/// CRC-32 of a float payload.
///
/// The shared-memory segment and the socket wire format both store payloads
/// as little-endian IEEE-754 binary32, so on the supported platforms this is
/// a straight byte view of the slice.
pub fn crc32_floats(data: &[f32]) -> u32 {
    let bytes = unsafe {
        std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data))
    };
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Decides whether a publisher should compute a checksum for the current
/// frame. An interval of zero means "every frame"; otherwise a checksum is
/// computed at most once per interval and intermediate frames carry 0.
#[derive(Debug)]
pub struct ChecksumPolicy {
    interval: Duration,
    last: Option<Instant>,
}

impl ChecksumPolicy {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True when the current frame should carry a checksum.
    pub fn due(&mut self) -> bool {
        if self.interval.is_zero() {
            return true;
        }
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
