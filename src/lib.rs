//! Real-time depth-sensor fusion pipeline.
//!
//! Raw depth frames from one or more sensors are converted into a calibrated
//! world-space height map, stabilized with temporal and spatial filters,
//! fused across concurrent sensor layers, and published to consumer
//! processes over two interchangeable transports:
//!
//! - **Shared memory**: a lock-free double-buffered segment; readers always
//!   observe the latest committed frame with zero copies.
//! - **Unix socket**: a framed stream with identical integrity semantics for
//!   consumers that prefer a connection.
//!
//! # Quick start
//!
//! ```ignore
//! use caldera::{
//!     FastGaussianBlur, ProcessingConfig, ProcessingPipeline, SharedMemoryPublisher,
//!     ShmPublisherConfig, SyntheticSensor, SyntheticSensorConfig,
//! };
//! use std::sync::{Arc, Mutex};
//!
//! let mut publisher = SharedMemoryPublisher::new(ShmPublisherConfig::from_env());
//! publisher.start()?;
//!
//! let mut pipeline = ProcessingPipeline::new(ProcessingConfig::from_env());
//! pipeline.set_temporal_filter(Box::new(FastGaussianBlur::new(1.5)));
//! pipeline.set_frame_sink(Box::new(move |frame| publisher.publish(frame)));
//!
//! // The HAL worker drives the pipeline; a mutex serializes frames.
//! let pipeline = Arc::new(Mutex::new(pipeline));
//! let mut sensor = SyntheticSensor::new(SyntheticSensorConfig::default());
//! let worker = pipeline.clone();
//! sensor.set_depth_frame_callback(Box::new(move |raw| {
//!     worker.lock().unwrap().process_raw_depth_frame(raw);
//! }));
//! sensor.start();
//! ```
//!
//! Consumers open the segment with [`SharedMemoryFrameClient`] (or connect a
//! [`SocketFrameClient`]) and poll `latest()` for a view of the freshest
//! frame, verifying the embedded CRC-32 on demand.

pub mod builder;
pub mod checksum;
pub mod config;
pub mod error;
pub mod frame;
pub mod fusion;
pub mod hal;
pub mod metrics;
pub mod pipeline;
pub mod shm;
pub mod shm_client;
pub mod shm_server;
pub mod socket_client;
pub mod socket_server;
pub mod spatial;
pub mod temporal;
pub mod transport;
pub mod wire;

pub use builder::{FrameBuilder, TransformParameters};
pub use checksum::{crc32_floats, ChecksumPolicy, CHECKSUM_CRC32, CHECKSUM_NONE};
pub use config::{
    AdaptiveMode, ProcessingConfig, ShmPublisherConfig, SmoothingKernel, SocketPublisherConfig,
    StrongKernel,
};
pub use error::CalderaError;
pub use frame::{HeightMap, Point3D, PointCloud, RawDepthFrame, ValidationSummary, WorldFrame};
pub use fusion::{FusionAccumulator, FusionInputLayer, FusionStats, FusionStrategy};
pub use hal::{FramePattern, SyntheticSensor, SyntheticSensorConfig};
pub use metrics::{AdaptiveState, StabilityMetrics};
pub use pipeline::{parse_pipeline_spec, ProcessingPipeline, StageSpec, WorldFrameSink};
pub use shm_client::{SharedMemoryFrameClient, SharedMemoryReader, ShmClientConfig};
pub use shm_server::SharedMemoryPublisher;
pub use socket_client::{SocketClientConfig, SocketFrameClient};
pub use socket_server::SocketPublisher;
pub use spatial::{SpatialFilter, SpatialKernel};
pub use temporal::{FastGaussianBlur, HeightMapFilter};
pub use transport::{parse_unix_endpoint, ClientStats, FrameView, PublisherStats};
pub use wire::{WireHeader, WIRE_HEADER_BYTES, WIRE_MAGIC, WIRE_VERSION};
