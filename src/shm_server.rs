//! Shared-memory frame publisher.
//!
//! Single producer writing into a double-buffered named segment: frames go
//! into the inactive slot, the `ready` flag and `active_index` flip behind
//! full barriers, and readers on the other side never need a lock. Readers
//! may miss frames; they always observe the latest committed one.

use std::fs::OpenOptions;
use std::sync::atomic::{fence, Ordering};
use std::time::{Duration, Instant};

use memmap2::MmapMut;

use crate::checksum::{crc32_floats, ChecksumPolicy, CHECKSUM_CRC32, CHECKSUM_NONE};
use crate::config::ShmPublisherConfig;
use crate::error::CalderaError;
use crate::frame::WorldFrame;
use crate::shm::{
    buffer_bytes, payload_offset, segment_path, segment_size, set_ready, write_meta_fields,
    write_u32, BufferMeta, OFF_ACTIVE_INDEX, OFF_MAGIC, OFF_RESERVED, OFF_VERSION, SHM_MAGIC,
    SHM_VERSION,
};
use crate::transport::PublisherStats;

/// Emits a warning at most once per interval.
pub(crate) struct RateLimiter {
    min_interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub(crate) fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    pub(crate) fn allow(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Double-buffered shared-memory publisher for world frames.
pub struct SharedMemoryPublisher {
    cfg: ShmPublisherConfig,
    map: Option<MmapMut>,
    buffer_bytes: usize,
    running: bool,
    stats: PublisherStats,
    checksum: ChecksumPolicy,
    last_publish: Option<Instant>,
    drop_warn: RateLimiter,
}

impl SharedMemoryPublisher {
    pub fn new(cfg: ShmPublisherConfig) -> Self {
        let checksum = ChecksumPolicy::new(cfg.checksum_interval);
        Self {
            buffer_bytes: buffer_bytes(cfg.max_width, cfg.max_height),
            cfg,
            map: None,
            running: false,
            stats: PublisherStats::default(),
            checksum,
            last_publish: None,
            drop_warn: RateLimiter::new(Duration::from_secs(2)),
        }
    }

    /// Create (or reuse) and map the named segment, then accept frames.
    pub fn start(&mut self) -> Result<(), CalderaError> {
        if self.running {
            return Ok(());
        }
        let path = segment_path(&self.cfg.name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let size = segment_size(self.cfg.max_width, self.cfg.max_height);
        file.set_len(size as u64)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };

        // Initialize the header; a pre-existing segment is reset so stale
        // ready flags never leak into a new session.
        let base = map.as_mut_ptr();
        unsafe {
            write_u32(base, OFF_MAGIC, SHM_MAGIC);
            write_u32(base, OFF_VERSION, SHM_VERSION);
            write_u32(base, OFF_ACTIVE_INDEX, 0);
            write_u32(base, OFF_RESERVED, 0);
            write_meta_fields(base, 0, &BufferMeta::default());
            write_meta_fields(base, 1, &BufferMeta::default());
            set_ready(base, 0, 0, Ordering::Release);
            set_ready(base, 1, 0, Ordering::Release);
        }
        self.map = Some(map);
        self.running = true;
        tracing::info!(
            "Shared-memory publisher started name={} capacity={}x{}",
            self.cfg.name,
            self.cfg.max_width,
            self.cfg.max_height
        );
        Ok(())
    }

    /// Unmap the segment. The name stays in the namespace; see [`Self::unlink`].
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.map = None;
        tracing::info!("Shared-memory publisher stopped name={}", self.cfg.name);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Remove a segment name from the namespace (test/session teardown).
    pub fn unlink(name: &str) -> std::io::Result<()> {
        std::fs::remove_file(segment_path(name))
    }

    /// Publish one frame into the inactive slot and flip the active index.
    /// A no-op before `start`. Frames larger than the segment capacity are
    /// dropped and counted.
    pub fn publish(&mut self, frame: &WorldFrame) {
        if !self.running {
            return;
        }
        let Some(map) = self.map.as_mut() else {
            return;
        };
        self.stats.frames_attempted += 1;

        let hm = &frame.height_map;
        if hm.width > self.cfg.max_width || hm.height > self.cfg.max_height {
            self.stats.frames_dropped_capacity += 1;
            if self.drop_warn.allow() {
                tracing::warn!(
                    "Frame {}x{} exceeds segment capacity {}x{}, dropping",
                    hm.width,
                    hm.height,
                    self.cfg.max_width,
                    self.cfg.max_height
                );
            }
            return;
        }

        let (checksum, checksum_algorithm) = if frame.checksum != 0 {
            (frame.checksum, CHECKSUM_CRC32)
        } else if self.checksum.due() {
            (crc32_floats(&hm.data), CHECKSUM_CRC32)
        } else {
            (0, CHECKSUM_NONE)
        };

        let base = map.as_mut_ptr();
        unsafe {
            let active = crate::shm::read_u32(base, OFF_ACTIVE_INDEX);
            let write_index = 1 - (active & 1);

            set_ready(base, write_index, 0, Ordering::Release);
            write_meta_fields(
                base,
                write_index,
                &BufferMeta {
                    frame_id: frame.frame_id,
                    timestamp_ns: frame.timestamp_ns,
                    width: hm.width,
                    height: hm.height,
                    float_count: hm.data.len() as u32,
                    checksum,
                    checksum_algorithm,
                    ready: 0,
                },
            );
            let payload = base.add(payload_offset(write_index, self.buffer_bytes));
            std::ptr::copy_nonoverlapping(
                hm.data.as_ptr() as *const u8,
                payload,
                hm.data.len() * std::mem::size_of::<f32>(),
            );

            fence(Ordering::SeqCst);
            set_ready(base, write_index, 1, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            crate::shm::atomic_store(base, OFF_ACTIVE_INDEX, write_index, Ordering::SeqCst);
        }

        self.stats.frames_published += 1;
        self.stats.bytes_written += (hm.data.len() * std::mem::size_of::<f32>()) as u64;
        let now = Instant::now();
        if let Some(last) = self.last_publish {
            let dt = now.duration_since(last).as_secs_f32();
            if dt > 0.0 {
                let fps = 1.0 / dt;
                self.stats.last_publish_fps = if self.stats.last_publish_fps == 0.0 {
                    fps
                } else {
                    0.1 * fps + 0.9 * self.stats.last_publish_fps
                };
            }
        }
        self.last_publish = Some(now);

        tracing::debug!(
            "SHM wrote frame id={} size={}x{} floats={}",
            frame.frame_id,
            hm.width,
            hm.height,
            hm.data.len()
        );
    }

    pub fn snapshot_stats(&self) -> PublisherStats {
        self.stats
    }
}

impl Drop for SharedMemoryPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HeightMap;
    use std::sync::atomic::AtomicU32;

    static NAME_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn unique_segment_name(tag: &str) -> String {
        let n = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("/caldera_test_{}_{}_{}", tag, std::process::id(), n)
    }

    fn test_frame(width: u32, height: u32, fill: f32) -> WorldFrame {
        WorldFrame {
            frame_id: 1,
            timestamp_ns: 100,
            height_map: HeightMap {
                width,
                height,
                data: vec![fill; (width * height) as usize],
            },
            checksum: 0,
            checksum_algorithm: 0,
        }
    }

    #[test]
    fn test_publish_before_start_is_noop() {
        let name = unique_segment_name("noop");
        let mut publisher = SharedMemoryPublisher::new(ShmPublisherConfig {
            name: name.clone(),
            max_width: 8,
            max_height: 8,
            ..ShmPublisherConfig::default()
        });
        publisher.publish(&test_frame(4, 4, 1.0));
        let stats = publisher.snapshot_stats();
        assert_eq!(stats.frames_attempted, 0);
        assert_eq!(stats.frames_published, 0);
    }

    #[test]
    fn test_capacity_overflow_drops_frame() {
        let name = unique_segment_name("overflow");
        let mut publisher = SharedMemoryPublisher::new(ShmPublisherConfig {
            name: name.clone(),
            max_width: 8,
            max_height: 8,
            ..ShmPublisherConfig::default()
        });
        publisher.start().unwrap();
        publisher.publish(&test_frame(9, 8, 1.0));
        let stats = publisher.snapshot_stats();
        assert_eq!(stats.frames_published, 0);
        assert_eq!(stats.frames_dropped_capacity, 1);
        publisher.publish(&test_frame(8, 8, 1.0));
        let stats = publisher.snapshot_stats();
        assert_eq!(stats.frames_published, 1);
        assert_eq!(stats.frames_dropped_capacity, 1);
        publisher.stop();
        SharedMemoryPublisher::unlink(&name).unwrap();
    }

    #[test]
    fn test_rate_limiter() {
        let mut limiter = RateLimiter::new(Duration::from_secs(60));
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }
}
