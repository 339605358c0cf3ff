//! Multi-sensor layer fusion.
//!
//! Within one frame the accumulator collects zero or more sensor layers and
//! reconciles them into a single height map: a confidence-weighted average
//! when every layer carries confidence, per-pixel min-z otherwise. Layer
//! storage is owned by the accumulator and reused across frames.

use std::collections::HashMap;

/// One sensor's contribution for the current frame. Ephemeral: the
/// accumulator copies the data on [`FusionAccumulator::add_layer`].
#[derive(Debug, Clone, Copy)]
pub struct FusionInputLayer<'a> {
    pub sensor_id: &'a str,
    pub heights: &'a [f32],
    pub confidence: Option<&'a [f32]>,
    pub width: u32,
    pub height: u32,
}

/// Fusion strategy actually used for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FusionStrategy {
    /// Per-pixel minimum over finite values.
    #[default]
    MinZ,
    /// Confidence-weighted average with min-z fallback.
    ConfidenceWeighted,
}

/// Per-frame fusion statistics.
#[derive(Debug, Clone, Default)]
pub struct FusionStats {
    /// Layers accepted this frame.
    pub layer_count: usize,
    /// Alias of `layer_count` (layers seen this frame, i.e. non-stale).
    pub active_layer_count: usize,
    /// Known sensors absent for more than the dropout window.
    pub stale_excluded_count: usize,
    /// Finite-value count per accepted layer.
    pub layer_valid_counts: Vec<u32>,
    /// Pixels fused from actual data (not empty-fallback zeros).
    pub fused_valid_count: u32,
    pub fused_valid_ratio: f32,
    /// Pixels where all weights were zero and min-z stepped in.
    pub fallback_min_z_count: u32,
    /// Pixels with no finite contribution in any layer.
    pub fallback_empty_count: u32,
    pub strategy: FusionStrategy,
}

struct LayerEntry {
    sensor_id: String,
    offset: usize,
    conf_offset: Option<usize>,
}

/// Collects per-sensor layers and fuses them once per frame.
///
/// Usage per frame: `begin_frame` -> `add_layer`* -> `fuse`. Layers with
/// mismatched dimensions are silently rejected.
pub struct FusionAccumulator {
    frame_id: u64,
    width: u32,
    height: u32,
    pixel_count: usize,
    layers: Vec<LayerEntry>,
    heights_storage: Vec<f32>,
    confidence_storage: Vec<f32>,
    last_seen: HashMap<String, u64>,
    dropout_window: u64,
    stats: FusionStats,
}

impl FusionAccumulator {
    pub fn new(dropout_window: u64) -> Self {
        Self {
            frame_id: 0,
            width: 0,
            height: 0,
            pixel_count: 0,
            layers: Vec::new(),
            heights_storage: Vec::new(),
            confidence_storage: Vec::new(),
            last_seen: HashMap::new(),
            dropout_window,
            stats: FusionStats::default(),
        }
    }

    pub fn set_dropout_window(&mut self, window: u64) {
        self.dropout_window = window;
    }

    /// Reserve storage up front so high-rate streams never grow buffers.
    pub fn reserve_for(&mut self, width: u32, height: u32, expected_max_layers: usize) {
        let per_layer = width as usize * height as usize;
        let target = per_layer * expected_max_layers.max(1);
        if self.heights_storage.capacity() < target {
            self.heights_storage.reserve(target);
        }
        if self.confidence_storage.capacity() < target {
            self.confidence_storage.reserve(target);
        }
    }

    /// Start a new frame, clearing (not shrinking) the layer storage.
    pub fn begin_frame(&mut self, frame_id: u64, width: u32, height: u32) {
        self.frame_id = frame_id;
        self.width = width;
        self.height = height;
        self.pixel_count = width as usize * height as usize;
        self.layers.clear();
        self.heights_storage.clear();
        self.confidence_storage.clear();
        self.stats = FusionStats::default();
    }

    /// Accept a layer for the current frame. Dimension mismatches are
    /// rejected silently; a confidence buffer of the wrong length is ignored.
    pub fn add_layer(&mut self, layer: &FusionInputLayer<'_>) {
        if layer.width != self.width
            || layer.height != self.height
            || layer.heights.len() != self.pixel_count
        {
            tracing::debug!(
                "Rejecting fusion layer '{}' with mismatched dimensions {}x{}",
                layer.sensor_id,
                layer.width,
                layer.height
            );
            return;
        }
        let offset = self.heights_storage.len();
        self.heights_storage.extend_from_slice(layer.heights);
        let valid_count = layer.heights.iter().filter(|v| v.is_finite()).count() as u32;
        let conf_offset = match layer.confidence {
            Some(conf) if conf.len() == self.pixel_count => {
                let off = self.confidence_storage.len();
                self.confidence_storage.extend_from_slice(conf);
                Some(off)
            }
            _ => None,
        };
        self.layers.push(LayerEntry {
            sensor_id: layer.sensor_id.to_string(),
            offset,
            conf_offset,
        });
        self.stats.layer_valid_counts.push(valid_count);
        self.stats.layer_count = self.layers.len();
        self.last_seen.insert(layer.sensor_id.to_string(), self.frame_id);
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    pub fn stats(&self) -> &FusionStats {
        &self.stats
    }

    /// Fuse the collected layers into `out_heights` (and `out_confidence`
    /// when requested and the strategy supports it).
    pub fn fuse(&mut self, out_heights: &mut Vec<f32>, out_confidence: Option<&mut Vec<f32>>) {
        self.update_dropout();
        self.stats.active_layer_count = self.layers.len();

        if self.layers.is_empty() {
            out_heights.clear();
            if let Some(conf) = out_confidence {
                conf.clear();
            }
            return;
        }

        if self.layers.len() == 1 {
            self.fuse_single(out_heights);
            if let Some(conf) = out_confidence {
                conf.clear();
            }
            self.finish_stats();
            return;
        }

        let all_have_confidence = self.layers.iter().all(|l| l.conf_offset.is_some());
        if all_have_confidence {
            self.stats.strategy = FusionStrategy::ConfidenceWeighted;
            self.fuse_weighted(out_heights, out_confidence);
        } else {
            self.stats.strategy = FusionStrategy::MinZ;
            self.fuse_min_z(out_heights);
            if let Some(conf) = out_confidence {
                conf.clear();
            }
        }
        self.finish_stats();
    }

    fn update_dropout(&mut self) {
        self.stats.stale_excluded_count = 0;
        if self.dropout_window == 0 {
            return;
        }
        for last in self.last_seen.values() {
            if self.frame_id.saturating_sub(*last) > self.dropout_window {
                self.stats.stale_excluded_count += 1;
            }
        }
    }

    fn fuse_single(&mut self, out_heights: &mut Vec<f32>) {
        let layer = &self.layers[0];
        let src = &self.heights_storage[layer.offset..layer.offset + self.pixel_count];
        out_heights.resize(self.pixel_count, 0.0);
        for (dst, &v) in out_heights.iter_mut().zip(src) {
            if v.is_finite() {
                *dst = v;
                self.stats.fused_valid_count += 1;
            } else {
                *dst = 0.0;
                self.stats.fallback_empty_count += 1;
            }
        }
    }

    fn fuse_weighted(&mut self, out_heights: &mut Vec<f32>, out_confidence: Option<&mut Vec<f32>>) {
        out_heights.resize(self.pixel_count, 0.0);
        let pixel_count = self.pixel_count;
        let mut conf_out = out_confidence.map(|c| {
            c.resize(pixel_count, 0.0);
            c
        });

        for i in 0..self.pixel_count {
            let mut weight_sum = 0.0f32;
            let mut weight_sq_sum = 0.0f32;
            let mut weighted_height = 0.0f32;
            let mut min_finite = f32::INFINITY;
            let mut any_finite = false;

            for layer in &self.layers {
                let h = self.heights_storage[layer.offset + i];
                if !h.is_finite() {
                    continue;
                }
                any_finite = true;
                min_finite = min_finite.min(h);
                let conf_offset = layer.conf_offset.expect("weighted strategy requires confidence");
                let w = self.confidence_storage[conf_offset + i].clamp(0.0, 1.0);
                if w > 0.0 {
                    weight_sum += w;
                    weight_sq_sum += w * w;
                    weighted_height += w * h;
                }
            }

            let (height, confidence) = if weight_sum > 0.0 {
                self.stats.fused_valid_count += 1;
                (weighted_height / weight_sum, weight_sq_sum / weight_sum)
            } else if any_finite {
                self.stats.fused_valid_count += 1;
                self.stats.fallback_min_z_count += 1;
                (min_finite, 0.0)
            } else {
                self.stats.fallback_empty_count += 1;
                (0.0, 0.0)
            };
            out_heights[i] = height;
            if let Some(conf) = conf_out.as_deref_mut() {
                conf[i] = confidence;
            }
        }
    }

    fn fuse_min_z(&mut self, out_heights: &mut Vec<f32>) {
        out_heights.resize(self.pixel_count, 0.0);
        for i in 0..self.pixel_count {
            let mut min_finite = f32::INFINITY;
            let mut any_finite = false;
            for layer in &self.layers {
                let h = self.heights_storage[layer.offset + i];
                if h.is_finite() {
                    any_finite = true;
                    min_finite = min_finite.min(h);
                }
            }
            if any_finite {
                out_heights[i] = min_finite;
                self.stats.fused_valid_count += 1;
            } else {
                out_heights[i] = 0.0;
                self.stats.fallback_empty_count += 1;
            }
        }
    }

    fn finish_stats(&mut self) {
        self.stats.fused_valid_ratio = if self.pixel_count > 0 {
            self.stats.fused_valid_count as f32 / self.pixel_count as f32
        } else {
            0.0
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(fusion: &mut FusionAccumulator, id: &str, h: &[f32], c: Option<&[f32]>, w: u32, ht: u32) {
        fusion.add_layer(&FusionInputLayer {
            sensor_id: id,
            heights: h,
            confidence: c,
            width: w,
            height: ht,
        });
    }

    #[test]
    fn test_single_layer_passthrough() {
        let mut fusion = FusionAccumulator::new(60);
        let heights: Vec<f32> = (0..12).map(|i| i as f32 * 0.1).collect();
        fusion.begin_frame(7, 4, 3);
        add(&mut fusion, "sensorA", &heights, None, 4, 3);
        let mut out = Vec::new();
        fusion.fuse(&mut out, None);
        assert_eq!(out.len(), heights.len());
        for (o, e) in out.iter().zip(&heights) {
            assert_eq!(o, e);
        }
        assert_eq!(fusion.stats().fused_valid_count, 12);
    }

    #[test]
    fn test_single_layer_invalid_cells_zero_filled() {
        let mut fusion = FusionAccumulator::new(60);
        let heights = vec![f32::NAN; 4];
        let conf = vec![0.5f32; 4];
        fusion.begin_frame(1, 2, 2);
        add(&mut fusion, "A", &heights, Some(&conf), 2, 2);
        let mut out = Vec::new();
        let mut out_conf = vec![9.0f32; 4];
        fusion.fuse(&mut out, Some(&mut out_conf));
        for v in &out {
            assert_eq!(*v, 0.0);
        }
        // Single layer clears the confidence output.
        assert!(out_conf.is_empty());
        assert_eq!(fusion.stats().fused_valid_count, 0);
        assert_eq!(fusion.stats().fallback_empty_count, 4);
    }

    #[test]
    fn test_weighted_average_and_confidence() {
        let mut fusion = FusionAccumulator::new(60);
        let ha = [1.0f32, 10.0, 5.0];
        let hb = [3.0f32, 2.0, 20.0];
        let ca = [0.8f32, 0.1, 0.5];
        let cb = [0.2f32, 0.9, 0.5];
        fusion.begin_frame(100, 3, 1);
        add(&mut fusion, "A", &ha, Some(&ca), 3, 1);
        add(&mut fusion, "B", &hb, Some(&cb), 3, 1);
        let mut out = Vec::new();
        let mut conf = Vec::new();
        fusion.fuse(&mut out, Some(&mut conf));

        assert!((out[0] - 1.4).abs() < 1e-6);
        assert!((out[1] - 2.8).abs() < 1e-6);
        assert!((out[2] - 12.5).abs() < 1e-6);
        // Confidence aggregation: sum(w^2) / sum(w).
        assert!((conf[0] - 0.68).abs() < 1e-6);
        assert!((conf[1] - 0.82).abs() < 1e-6);
        assert!((conf[2] - 0.5).abs() < 1e-6);
        let stats = fusion.stats();
        assert_eq!(stats.strategy, FusionStrategy::ConfidenceWeighted);
        assert_eq!(stats.fallback_min_z_count, 0);
        assert_eq!(stats.fused_valid_count, 3);
    }

    #[test]
    fn test_confidence_clamped_to_unit_range() {
        let mut fusion = FusionAccumulator::new(60);
        let ha = [4.0f32, 6.0];
        let hb = [8.0f32, 2.0];
        let ca = [1.5f32, 2.2];
        let cb = [0.5f32, 10.0];
        fusion.begin_frame(400, 2, 1);
        add(&mut fusion, "A", &ha, Some(&ca), 2, 1);
        add(&mut fusion, "B", &hb, Some(&cb), 2, 1);
        let mut out = Vec::new();
        let mut conf = Vec::new();
        fusion.fuse(&mut out, Some(&mut conf));

        // Clamped weights: (1, 0.5) and (1, 1).
        assert!((out[0] - 5.333333).abs() < 1e-5);
        assert!((out[1] - 4.0).abs() < 1e-6);
        assert!((conf[0] - 0.8333333).abs() < 1e-5);
        assert!((conf[1] - 1.0).abs() < 1e-6);
        assert_eq!(fusion.stats().fallback_min_z_count, 0);
    }

    #[test]
    fn test_zero_confidence_falls_back_to_min_z() {
        let mut fusion = FusionAccumulator::new(60);
        let ha = [5.0f32, 9.0, 2.0];
        let hb = [7.0f32, 1.0, 8.0];
        let ca = [0.0f32, -0.1, 0.0]; // negative clamps to 0
        let cb = [0.0f32, 0.0, 0.0];
        fusion.begin_frame(300, 3, 1);
        add(&mut fusion, "A", &ha, Some(&ca), 3, 1);
        add(&mut fusion, "B", &hb, Some(&cb), 3, 1);
        let mut out = Vec::new();
        let mut conf = Vec::new();
        fusion.fuse(&mut out, Some(&mut conf));

        assert_eq!(out, vec![5.0, 1.0, 2.0]);
        assert_eq!(conf, vec![0.0, 0.0, 0.0]);
        let stats = fusion.stats();
        assert_eq!(stats.strategy, FusionStrategy::ConfidenceWeighted);
        assert_eq!(stats.fallback_min_z_count, 3);
        assert_eq!(stats.fused_valid_count, 3);
    }

    #[test]
    fn test_all_invalid_layers_zero_filled() {
        let mut fusion = FusionAccumulator::new(60);
        let ha = vec![f32::NAN; 4];
        let hb = vec![f32::NAN; 4];
        let ca = vec![0.5f32; 4];
        let cb = vec![0.7f32; 4];
        fusion.begin_frame(200, 2, 2);
        add(&mut fusion, "A", &ha, Some(&ca), 2, 2);
        add(&mut fusion, "B", &hb, Some(&cb), 2, 2);
        let mut out = Vec::new();
        let mut conf = Vec::new();
        fusion.fuse(&mut out, Some(&mut conf));

        assert!(out.iter().all(|v| *v == 0.0));
        assert!(conf.iter().all(|v| *v == 0.0));
        let stats = fusion.stats();
        assert_eq!(stats.strategy, FusionStrategy::ConfidenceWeighted);
        assert_eq!(stats.fused_valid_count, 0);
        assert_eq!(stats.fallback_empty_count, 4);
    }

    #[test]
    fn test_min_z_two_layers() {
        let mut fusion = FusionAccumulator::new(60);
        let a = [0.5f32, 1.0, 2.0, 3.5, 4.0, 5.0];
        let b = [0.6f32, 0.9, 2.5, 3.0, 10.0, 1.0];
        fusion.begin_frame(1, 3, 2);
        add(&mut fusion, "A", &a, None, 3, 2);
        add(&mut fusion, "B", &b, None, 3, 2);
        let mut out = Vec::new();
        fusion.fuse(&mut out, None);
        assert_eq!(out, vec![0.5, 0.9, 2.0, 3.0, 4.0, 1.0]);
        assert_eq!(fusion.stats().strategy, FusionStrategy::MinZ);
    }

    #[test]
    fn test_min_z_skips_nan() {
        let mut fusion = FusionAccumulator::new(60);
        let a = [f32::NAN, 1.0, 2.0, f32::NAN];
        let b = [0.5f32, f32::NAN, 3.0, 4.0];
        fusion.begin_frame(2, 2, 2);
        add(&mut fusion, "A", &a, None, 2, 2);
        add(&mut fusion, "B", &b, None, 2, 2);
        let mut out = Vec::new();
        fusion.fuse(&mut out, None);
        assert_eq!(out, vec![0.5, 1.0, 2.0, 4.0]);
    }

    #[test]
    fn test_layer_and_fused_counts() {
        let mut fusion = FusionAccumulator::new(60);
        let a = [0.0f32, 1.0, 2.0, f32::NAN, 4.0, 5.0];
        let b = [0.5f32, f32::NAN, 2.5, 3.5, 4.5, f32::NAN];
        fusion.begin_frame(10, 3, 2);
        add(&mut fusion, "A", &a, None, 3, 2);
        add(&mut fusion, "B", &b, None, 3, 2);
        let mut out = Vec::new();
        fusion.fuse(&mut out, None);
        let stats = fusion.stats();
        assert_eq!(stats.layer_count, 2);
        assert_eq!(stats.layer_valid_counts, vec![5, 4]);
        assert_eq!(stats.fused_valid_count, 6);
        assert!((stats.fused_valid_ratio - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut fusion = FusionAccumulator::new(60);
        let a = [1.0f32, 2.0];
        fusion.begin_frame(1, 2, 2);
        add(&mut fusion, "A", &a, None, 2, 1);
        assert_eq!(fusion.layer_count(), 0);
    }

    #[test]
    fn test_dropout_window_zero_disables() {
        let mut fusion = FusionAccumulator::new(0);
        let a = [1.0f32, 2.0, 3.0, 4.0];
        let b = [2.0f32, 1.0, 4.0, 3.0];
        fusion.begin_frame(1, 2, 2);
        add(&mut fusion, "A", &a, None, 2, 2);
        add(&mut fusion, "B", &b, None, 2, 2);
        let mut out = Vec::new();
        fusion.fuse(&mut out, None);
        assert_eq!(fusion.stats().active_layer_count, 2);
        assert_eq!(fusion.stats().stale_excluded_count, 0);

        fusion.begin_frame(2, 2, 2);
        add(&mut fusion, "A", &a, None, 2, 2);
        out.clear();
        fusion.fuse(&mut out, None);
        assert_eq!(fusion.stats().active_layer_count, 1);
        assert_eq!(fusion.stats().stale_excluded_count, 0);
    }

    #[test]
    fn test_dropout_marks_stale_after_window() {
        let mut fusion = FusionAccumulator::new(2);
        let a = [5.0f32];
        let b = [7.0f32];
        fusion.begin_frame(10, 1, 1);
        add(&mut fusion, "A", &a, None, 1, 1);
        add(&mut fusion, "B", &b, None, 1, 1);
        let mut out = Vec::new();
        fusion.fuse(&mut out, None);
        assert_eq!(fusion.stats().stale_excluded_count, 0);

        for frame in 11..=12 {
            fusion.begin_frame(frame, 1, 1);
            add(&mut fusion, "A", &a, None, 1, 1);
            out.clear();
            fusion.fuse(&mut out, None);
            // Absence of 1 then 2 frames stays within the window.
            assert_eq!(fusion.stats().stale_excluded_count, 0);
        }

        fusion.begin_frame(13, 1, 1);
        add(&mut fusion, "A", &a, None, 1, 1);
        out.clear();
        fusion.fuse(&mut out, None);
        // Absence of 3 frames exceeds the window of 2.
        assert_eq!(fusion.stats().stale_excluded_count, 1);
    }

    #[test]
    fn test_rejoin_clears_stale() {
        let mut fusion = FusionAccumulator::new(2);
        let a = [1.0f32];
        let b = [2.0f32];
        let mut out = Vec::new();
        fusion.begin_frame(1, 1, 1);
        add(&mut fusion, "A", &a, None, 1, 1);
        add(&mut fusion, "B", &b, None, 1, 1);
        fusion.fuse(&mut out, None);
        for frame in 2..=4 {
            fusion.begin_frame(frame, 1, 1);
            add(&mut fusion, "A", &a, None, 1, 1);
            fusion.fuse(&mut out, None);
        }
        assert_eq!(fusion.stats().stale_excluded_count, 1);

        fusion.begin_frame(5, 1, 1);
        add(&mut fusion, "A", &a, None, 1, 1);
        add(&mut fusion, "B", &b, None, 1, 1);
        fusion.fuse(&mut out, None);
        assert_eq!(fusion.stats().stale_excluded_count, 0);
        assert_eq!(fusion.stats().active_layer_count, 2);
    }

    #[test]
    fn test_empty_frame_clears_outputs() {
        let mut fusion = FusionAccumulator::new(60);
        fusion.begin_frame(1, 4, 4);
        let mut out = vec![1.0f32; 16];
        let mut conf = vec![1.0f32; 16];
        fusion.fuse(&mut out, Some(&mut conf));
        assert!(out.is_empty());
        assert!(conf.is_empty());
    }

    #[test]
    fn test_fused_bounds_within_layer_range() {
        let mut fusion = FusionAccumulator::new(60);
        let ha = [1.0f32, 4.0, 2.0, 9.0];
        let hb = [3.0f32, 2.0, 8.0, 1.0];
        let ca = [0.3f32, 0.9, 0.2, 0.6];
        let cb = [0.7f32, 0.4, 0.8, 0.5];
        fusion.begin_frame(1, 2, 2);
        add(&mut fusion, "A", &ha, Some(&ca), 2, 2);
        add(&mut fusion, "B", &hb, Some(&cb), 2, 2);
        let mut out = Vec::new();
        fusion.fuse(&mut out, None);
        for i in 0..4 {
            let lo = ha[i].min(hb[i]);
            let hi = ha[i].max(hb[i]);
            assert!(out[i] >= lo - 1e-6 && out[i] <= hi + 1e-6);
        }
    }
}
