//! Socket frame client.
//!
//! Blocking counterpart of the socket publisher with the same polling API
//! and stats surface as the shared-memory client: `connect` with retry,
//! `latest` reads exactly one frame (header then payload), malformed input
//! closes the connection and reports "no frame".

use std::io::Read;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use crate::checksum::crc32_floats;
use crate::error::CalderaError;
use crate::transport::{parse_unix_endpoint, ClientStats, FrameView};
use crate::wire::{WireHeader, WIRE_HEADER_BYTES};

/// Client-side socket settings.
#[derive(Debug, Clone)]
pub struct SocketClientConfig {
    /// Stream endpoint, `unix:<path>`.
    pub endpoint: String,
}

impl Default for SocketClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "unix:/tmp/caldera_worldframe.sock".to_string(),
        }
    }
}

/// Blocking framed-stream client.
pub struct SocketFrameClient {
    cfg: SocketClientConfig,
    stream: Option<UnixStream>,
    payload_bytes: Vec<u8>,
    payload: Vec<f32>,
    stats: ClientStats,
}

impl SocketFrameClient {
    pub fn new(cfg: SocketClientConfig) -> Self {
        Self {
            cfg,
            stream: None,
            payload_bytes: Vec::new(),
            payload: Vec::new(),
            stats: ClientStats::default(),
        }
    }

    /// Connect with retry until the timeout elapses. Unix stream connects
    /// complete synchronously, so each attempt either succeeds immediately
    /// or backs off 50 ms before the next try. A zero timeout means a
    /// single attempt.
    pub fn connect(&mut self, timeout: Duration) -> Result<(), CalderaError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let path = parse_unix_endpoint(&self.cfg.endpoint)?;
        let deadline = Instant::now() + timeout;
        loop {
            match UnixStream::connect(&path) {
                Ok(stream) => {
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(err) => {
                    if timeout.is_zero() {
                        return Err(err.into());
                    }
                    if Instant::now() >= deadline {
                        return Err(CalderaError::ConnectTimeout(timeout.as_millis() as u64));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    pub fn disconnect(&mut self) {
        self.stream = None;
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Block-read the next frame from the stream. Bad magic, wrong version,
    /// or a short read closes the connection and returns `None`.
    pub fn latest(&mut self, verify_checksum: bool) -> Option<FrameView<'_>> {
        let stream = self.stream.as_mut()?;

        let mut header_bytes = [0u8; WIRE_HEADER_BYTES];
        if stream.read_exact(&mut header_bytes).is_err() {
            self.stream = None;
            return None;
        }
        let header = match WireHeader::decode(&header_bytes) {
            Some(header) => header,
            None => {
                tracing::warn!("Malformed frame header on socket, disconnecting");
                self.stream = None;
                return None;
            }
        };

        let payload_len = header.float_count as usize * std::mem::size_of::<f32>();
        self.payload_bytes.resize(payload_len, 0);
        if payload_len > 0 {
            let stream = self.stream.as_mut()?;
            if stream.read_exact(&mut self.payload_bytes).is_err() {
                self.stream = None;
                return None;
            }
        }
        self.payload.clear();
        self.payload.extend(
            self.payload_bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        );

        self.stats.record_frame(header.frame_id);
        let mut view = FrameView {
            frame_id: header.frame_id,
            timestamp_ns: header.timestamp_ns,
            width: header.width,
            height: header.height,
            float_count: header.float_count,
            checksum: header.checksum,
            checksum_algorithm: header.checksum_algorithm,
            checksum_valid: true,
            data: &self.payload,
        };
        if view.has_checksum() {
            self.stats.checksum_present += 1;
            if verify_checksum {
                if crc32_floats(&self.payload) == header.checksum {
                    self.stats.checksum_verified += 1;
                } else {
                    self.stats.checksum_mismatch += 1;
                    view.checksum_valid = false;
                }
            }
        }
        Some(view)
    }

    pub fn stats(&self) -> ClientStats {
        self.stats
    }
}
