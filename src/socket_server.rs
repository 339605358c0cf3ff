//! Socket frame publisher.
//!
//! Streams each published frame to every connected client over a Unix
//! stream endpoint: one accept loop per endpoint, one writer task per
//! client. Writers are independent, so a slow client never blocks the
//! others; a client that cannot absorb a frame within the send timeout is
//! disconnected. Clients that fall behind the broadcast backlog simply skip
//! frames (the transport guarantees freshness, not completeness).

use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::checksum::{crc32_floats, ChecksumPolicy, CHECKSUM_CRC32, CHECKSUM_NONE};
use crate::config::SocketPublisherConfig;
use crate::error::CalderaError;
use crate::frame::WorldFrame;
use crate::transport::{parse_unix_endpoint, PublisherStats};
use crate::wire::encode_frame;

const FRAME_BACKLOG: usize = 8;

/// Framed stream publisher with per-client writer tasks.
pub struct SocketPublisher {
    cfg: SocketPublisherConfig,
    sock_path: Option<PathBuf>,
    tx: Option<broadcast::Sender<Bytes>>,
    cancel: CancellationToken,
    accept_thread: Option<std::thread::JoinHandle<()>>,
    stats: PublisherStats,
    checksum: ChecksumPolicy,
    last_publish: Option<Instant>,
}

impl SocketPublisher {
    pub fn new(cfg: SocketPublisherConfig) -> Self {
        let checksum = ChecksumPolicy::new(cfg.checksum_interval);
        Self {
            cfg,
            sock_path: None,
            tx: None,
            cancel: CancellationToken::new(),
            accept_thread: None,
            stats: PublisherStats::default(),
            checksum,
            last_publish: None,
        }
    }

    /// Bind the endpoint and start accepting clients.
    pub fn start(&mut self) -> Result<(), CalderaError> {
        if self.tx.is_some() {
            return Ok(());
        }
        let path = parse_unix_endpoint(&self.cfg.endpoint)?;
        // A stale socket file from a previous run would make bind fail.
        let _ = std::fs::remove_file(&path);
        let listener = std::os::unix::net::UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        let (tx, _) = broadcast::channel::<Bytes>(FRAME_BACKLOG);
        let cancel = CancellationToken::new();
        let accept_tx = tx.clone();
        let accept_cancel = cancel.clone();
        let send_timeout = self.cfg.send_timeout;
        let endpoint = self.cfg.endpoint.clone();

        let handle = std::thread::Builder::new()
            .name("socket-publisher".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        tracing::error!("Socket publisher runtime failed: {}", err);
                        return;
                    }
                };
                runtime.block_on(async move {
                    let listener = match UnixListener::from_std(listener) {
                        Ok(l) => l,
                        Err(err) => {
                            tracing::error!("Socket publisher listener failed: {}", err);
                            return;
                        }
                    };
                    accept_loop(listener, accept_tx, accept_cancel, send_timeout).await;
                });
            })?;

        self.sock_path = Some(path);
        self.tx = Some(tx);
        self.cancel = cancel;
        self.accept_thread = Some(handle);
        tracing::info!("Socket publisher listening on {}", endpoint);
        Ok(())
    }

    /// Close the listener and drain the per-client writers.
    pub fn stop(&mut self) {
        if self.tx.is_none() {
            return;
        }
        self.cancel.cancel();
        self.tx = None; // closes the channel, ending writer tasks
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        if let Some(path) = self.sock_path.take() {
            let _ = std::fs::remove_file(path);
        }
        tracing::info!("Socket publisher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.tx.is_some()
    }

    /// Encode and fan one frame out to all connected clients. A no-op
    /// before `start`.
    pub fn publish(&mut self, frame: &WorldFrame) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        self.stats.frames_attempted += 1;

        let (checksum, checksum_algorithm) = if frame.checksum != 0 {
            (frame.checksum, CHECKSUM_CRC32)
        } else if self.checksum.due() {
            (crc32_floats(&frame.height_map.data), CHECKSUM_CRC32)
        } else {
            (0, CHECKSUM_NONE)
        };
        let bytes = encode_frame(frame, checksum, checksum_algorithm);
        let len = bytes.len() as u64;
        // Send errors only mean "no client connected right now".
        let _ = tx.send(bytes);

        self.stats.frames_published += 1;
        self.stats.bytes_written += len;
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
    }

    pub fn snapshot_stats(&self) -> PublisherStats {
        self.stats
    }
}

impl Drop for SocketPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: UnixListener,
    tx: broadcast::Sender<Bytes>,
    cancel: CancellationToken,
    send_timeout: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        tracing::info!("Socket client connected");
                        let rx = tx.subscribe();
                        let client_cancel = cancel.clone();
                        tokio::spawn(async move {
                            client_writer(stream, rx, client_cancel, send_timeout).await;
                            tracing::info!("Socket client disconnected");
                        });
                    }
                    Err(err) => {
                        tracing::warn!("Socket accept failed: {}", err);
                        break;
                    }
                }
            }
        }
    }
}

async fn client_writer(
    mut stream: UnixStream,
    mut rx: broadcast::Receiver<Bytes>,
    cancel: CancellationToken,
    send_timeout: Duration,
) {
    loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(bytes) => bytes,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Socket client lagged, skipped {} frames", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        match tokio::time::timeout(send_timeout, stream.write_all(&bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::debug!("Socket write failed: {}", err);
                break;
            }
            Err(_) => {
                tracing::warn!("Socket client too slow, disconnecting");
                break;
            }
        }
    }
}
