//! Frame builder: raw depth samples to a validated world-space point cloud.

use crate::frame::{Point3D, PointCloud, RawDepthFrame, ValidationSummary};

/// Calibration band: two planes delimiting the valid depth volume.
///
/// A point `(x, y, z)` is accepted when it lies on the non-negative side of
/// the min plane and the non-positive side of the max plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformParameters {
    pub min_valid_plane: [f32; 4],
    pub max_valid_plane: [f32; 4],
}

impl Default for TransformParameters {
    /// Accept depths in `[0, 2]` meters.
    fn default() -> Self {
        Self {
            min_valid_plane: [0.0, 0.0, 1.0, 0.0],
            max_valid_plane: [0.0, 0.0, 1.0, -2.0],
        }
    }
}

impl TransformParameters {
    pub fn new(min_valid_plane: [f32; 4], max_valid_plane: [f32; 4]) -> Self {
        Self {
            min_valid_plane,
            max_valid_plane,
        }
    }

    pub fn accepts(&self, x: f32, y: f32, z: f32) -> bool {
        plane_eval(&self.min_valid_plane, x, y, z) >= 0.0
            && plane_eval(&self.max_valid_plane, x, y, z) <= 0.0
    }

    /// Shift the band edges along their normals by elevation offsets in
    /// meters. Applied once at session start, and only when the planes did
    /// not come from explicit configuration.
    pub fn apply_elevation_offsets(&mut self, min_offset_m: Option<f32>, max_offset_m: Option<f32>) {
        if let Some(offset) = min_offset_m {
            self.min_valid_plane[3] -= offset * self.min_valid_plane[2];
        }
        if let Some(offset) = max_offset_m {
            self.max_valid_plane[3] -= offset * self.max_valid_plane[2];
        }
    }
}

fn plane_eval(plane: &[f32; 4], x: f32, y: f32, z: f32) -> f32 {
    plane[0] * x + plane[1] * y + plane[2] * z + plane[3]
}

/// Converts raw depth frames into validated point clouds.
///
/// Coordinates are pixel offsets from the optical center with unit pixel
/// pitch; depth is `raw * depth_scale` meters. A raw value of 0 and any
/// point outside the calibration band are invalid. Cells past the end of a
/// short buffer are materialized as invalid with `z = 0`.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    depth_scale: f32,
}

impl FrameBuilder {
    pub fn new(depth_scale: f32) -> Self {
        Self { depth_scale }
    }

    pub fn depth_scale(&self) -> f32 {
        self.depth_scale
    }

    /// Build `cloud` from `raw`, returning the validation counts.
    pub fn build(
        &self,
        raw: &RawDepthFrame,
        transform: &TransformParameters,
        cloud: &mut PointCloud,
    ) -> ValidationSummary {
        cloud.resize(raw.width, raw.height);
        cloud.timestamp_ns = raw.timestamp_ns;

        let mut summary = ValidationSummary::default();
        let width = raw.width as usize;
        let total = raw.pixel_count();
        let provided = raw.data.len().min(total);
        if total == 0 {
            return summary;
        }

        let cx = (raw.width as f32 - 1.0) * 0.5;
        let cy = (raw.height as f32 - 1.0) * 0.5;

        for idx in 0..provided {
            let x = (idx % width) as f32 - cx;
            let y = (idx / width) as f32 - cy;
            let d = raw.data[idx];
            let z = f32::from(d) * self.depth_scale;
            let mut valid = d != 0 && z.is_finite();
            if valid && !transform.accepts(x, y, z) {
                valid = false;
            }
            if valid {
                cloud.points[idx] = Point3D::valid_at(x, y, z);
                summary.valid += 1;
            } else {
                cloud.points[idx] = Point3D::invalid_at(x, y, f32::NAN);
                summary.invalid += 1;
            }
        }
        // Tail of a short buffer: invalid, zero depth.
        for idx in provided..total {
            let x = (idx % width) as f32 - cx;
            let y = (idx / width) as f32 - cy;
            cloud.points[idx] = Point3D::invalid_at(x, y, 0.0);
            summary.invalid += 1;
        }
        summary
    }
}
