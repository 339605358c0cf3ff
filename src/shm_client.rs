//! Shared-memory frame reader and polling client.
//!
//! The reader maps a publisher's segment read-only and returns a view of the
//! latest committed buffer. Freshness over completeness: a poll may skip
//! frames, but it never observes a buffer the producer is still writing.

use std::fs::File;
use std::sync::atomic::{fence, Ordering};
use std::time::{Duration, Instant};

use memmap2::Mmap;

use crate::error::CalderaError;
use crate::shm::{
    atomic_load, buffer_bytes, payload_offset, read_meta, read_u32, segment_path, BufferMeta,
    OFF_ACTIVE_INDEX, OFF_MAGIC, OFF_VERSION, PAYLOAD_BASE, SHM_MAGIC, SHM_VERSION,
};
use crate::transport::{ClientStats, FrameView};

/// Read-only mapping of a publisher segment.
pub struct SharedMemoryReader {
    map: Mmap,
    buffer_bytes: usize,
}

impl SharedMemoryReader {
    /// Map the named segment. Fails gracefully before the producer created
    /// it, and rejects segments with a foreign layout or less capacity than
    /// the caller requires.
    pub fn open(name: &str, max_width: u32, max_height: u32) -> Result<Self, CalderaError> {
        let file = File::open(segment_path(name))?;
        let map = unsafe { Mmap::map(&file)? };
        if map.len() < PAYLOAD_BASE {
            return Err(CalderaError::CapacityTooSmall {
                available: 0,
                requested: buffer_bytes(max_width, max_height),
            });
        }
        let base = map.as_ptr();
        let magic = unsafe { read_u32(base, OFF_MAGIC) };
        if magic != SHM_MAGIC {
            return Err(CalderaError::BadMagic {
                name: name.to_string(),
                magic,
            });
        }
        let version = unsafe { read_u32(base, OFF_VERSION) };
        if version != SHM_VERSION {
            return Err(CalderaError::BadVersion {
                name: name.to_string(),
                version,
            });
        }
        let available = (map.len() - PAYLOAD_BASE) / 2;
        let requested = buffer_bytes(max_width, max_height);
        if available < requested {
            return Err(CalderaError::CapacityTooSmall {
                available,
                requested,
            });
        }
        Ok(Self {
            map,
            buffer_bytes: available,
        })
    }

    /// View of the latest committed frame, or `None` while the producer has
    /// not committed one. The view stays valid until the next poll.
    pub fn latest(&self) -> Option<FrameView<'_>> {
        let base = self.map.as_ptr();
        let active = unsafe { atomic_load(base, OFF_ACTIVE_INDEX, Ordering::Acquire) } & 1;
        let meta: BufferMeta = unsafe { read_meta(base, active) };
        if meta.ready != 1 {
            return None;
        }
        fence(Ordering::Acquire);
        let payload_len = meta.float_count as usize * std::mem::size_of::<f32>();
        if payload_len > self.buffer_bytes {
            // Corrupt metadata; never hand out a slice past the buffer.
            return None;
        }
        let data = unsafe {
            std::slice::from_raw_parts(
                base.add(payload_offset(active, self.buffer_bytes)) as *const f32,
                meta.float_count as usize,
            )
        };
        Some(FrameView {
            frame_id: meta.frame_id,
            timestamp_ns: meta.timestamp_ns,
            width: meta.width,
            height: meta.height,
            float_count: meta.float_count,
            checksum: meta.checksum,
            checksum_algorithm: meta.checksum_algorithm,
            checksum_valid: true,
            data,
        })
    }
}

/// Client-side settings for opening a publisher segment.
#[derive(Debug, Clone)]
pub struct ShmClientConfig {
    pub name: String,
    /// Capacity the segment must at least provide.
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for ShmClientConfig {
    fn default() -> Self {
        Self {
            name: "/caldera_worldframe".to_string(),
            max_width: 640,
            max_height: 480,
        }
    }
}

/// Polling client over [`SharedMemoryReader`] with connect-retry and stats.
pub struct SharedMemoryFrameClient {
    cfg: ShmClientConfig,
    reader: Option<SharedMemoryReader>,
    stats: ClientStats,
}

impl SharedMemoryFrameClient {
    pub fn new(cfg: ShmClientConfig) -> Self {
        Self {
            cfg,
            reader: None,
            stats: ClientStats::default(),
        }
    }

    /// Open the segment, retrying until the timeout elapses. A zero timeout
    /// means a single attempt.
    pub fn connect(&mut self, timeout: Duration) -> Result<(), CalderaError> {
        if self.reader.is_some() {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        loop {
            match SharedMemoryReader::open(&self.cfg.name, self.cfg.max_width, self.cfg.max_height)
            {
                Ok(reader) => {
                    self.reader = Some(reader);
                    return Ok(());
                }
                Err(err) => {
                    if timeout.is_zero() {
                        return Err(err);
                    }
                    if Instant::now() >= deadline {
                        return Err(CalderaError::ConnectTimeout(timeout.as_millis() as u64));
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
            }
        }
    }

    pub fn disconnect(&mut self) {
        self.reader = None;
    }

    pub fn is_connected(&self) -> bool {
        self.reader.is_some()
    }

    /// Latest committed frame with stats accounting and optional checksum
    /// verification.
    pub fn latest(&mut self, verify_checksum: bool) -> Option<FrameView<'_>> {
        let reader = self.reader.as_ref()?;
        let mut view = reader.latest()?;
        self.stats.record_frame(view.frame_id);
        if view.has_checksum() {
            self.stats.checksum_present += 1;
            if verify_checksum {
                if view.verify_checksum() {
                    self.stats.checksum_verified += 1;
                } else {
                    self.stats.checksum_mismatch += 1;
                }
            }
        }
        Some(view)
    }

    pub fn stats(&self) -> ClientStats {
        self.stats
    }
}
