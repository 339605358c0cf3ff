//! Core frame data model shared by the processing pipeline and transports.

use crate::checksum::{crc32_floats, CHECKSUM_CRC32, CHECKSUM_NONE};

/// A raw depth frame as delivered by a sensor HAL.
///
/// Depth values are unsigned sensor units (typically millimeters); a value of
/// `0` means "no measurement at this pixel". The buffer may be shorter or
/// longer than `width * height`: missing cells are treated as invalid,
/// surplus cells are ignored.
#[derive(Debug, Clone, Default)]
pub struct RawDepthFrame {
    /// Logical sensor identifier (stable across frames).
    pub sensor_id: String,
    /// Capture timestamp in nanoseconds (monotonic source).
    pub timestamp_ns: u64,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Raw depth samples, row-major.
    pub data: Vec<u16>,
}

impl RawDepthFrame {
    /// Number of cells declared by the frame dimensions.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// One world-space point produced by the frame builder.
///
/// `x`/`y` are pixel offsets from the optical center, `z` is metric depth.
/// When `valid` is false, `z` is non-finite (or zero for padded tail cells).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point3D {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub valid: bool,
}

impl Point3D {
    pub fn valid_at(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z, valid: true }
    }

    pub fn invalid_at(x: f32, y: f32, z: f32) -> Self {
        Self {
            x,
            y,
            z,
            valid: false,
        }
    }
}

impl Default for Point3D {
    fn default() -> Self {
        Self::invalid_at(0.0, 0.0, f32::NAN)
    }
}

/// Dense point cloud with amortized storage, reused across frames.
#[derive(Debug, Clone, Default)]
pub struct PointCloud {
    pub width: u32,
    pub height: u32,
    pub timestamp_ns: u64,
    pub points: Vec<Point3D>,
}

impl PointCloud {
    /// Resize to the given dimensions, reusing capacity.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.points
            .resize(width as usize * height as usize, Point3D::default());
    }
}

/// Calibrated world-space elevation map. Non-finite cells are invalid.
#[derive(Debug, Clone, Default)]
pub struct HeightMap {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

/// A fully processed frame, ready for publishing.
#[derive(Debug, Clone, Default)]
pub struct WorldFrame {
    /// Strictly monotonic per publisher instance.
    pub frame_id: u64,
    /// Non-decreasing capture timestamp.
    pub timestamp_ns: u64,
    pub height_map: HeightMap,
    /// CRC-32 of the little-endian height map bytes, or 0 if not computed.
    pub checksum: u32,
    /// 1 when `checksum` is set, 0 otherwise.
    pub checksum_algorithm: u32,
}

impl WorldFrame {
    /// Compute and attach the payload checksum.
    pub fn with_checksum(mut self) -> Self {
        self.checksum = crc32_floats(&self.height_map.data);
        self.checksum_algorithm = if self.checksum != 0 {
            CHECKSUM_CRC32
        } else {
            CHECKSUM_NONE
        };
        self
    }
}

/// Per-frame validation counts reported by the frame builder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationSummary {
    pub valid: u32,
    pub invalid: u32,
}
