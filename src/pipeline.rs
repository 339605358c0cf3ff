//! Stage-based processing pipeline.
//!
//! Each raw depth frame flows through an ordered list of stages
//! (build -> temporal -> spatial -> fusion by default), after which the
//! resulting world frame is handed to the configured sink. Stage order can
//! be overridden with a spec string such as
//! `build,temporal,spatial(kernel=wide5),fusion`; `->` works as a separator
//! too. All large buffers are owned by the pipeline and reused across
//! frames, so steady-state processing performs no allocation.

use std::collections::HashMap;
use std::time::Instant;

use crate::builder::{FrameBuilder, TransformParameters};
use crate::config::{AdaptiveMode, ProcessingConfig, SmoothingKernel, StrongKernel};
use crate::frame::{RawDepthFrame, ValidationSummary, WorldFrame};
use crate::fusion::{FusionAccumulator, FusionInputLayer, FusionStats};
use crate::metrics::{
    advance_gating, mean_abs_horizontal_diff, sample_indices, sampled_variance_and_edge,
    stability_ratio, AdaptiveState, SpatialSample, StabilityMetrics,
};
use crate::spatial::SpatialFilter;
use crate::temporal::{FastGaussianBlur, HeightMapFilter};

/// One parsed stage of a pipeline spec string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub name: String,
    pub params: HashMap<String, String>,
}

/// Parse a pipeline spec string into stage specs.
///
/// Stages are separated by commas or `->`; a stage may carry a parameter
/// list in parentheses (`spatial(kernel=wide5)`).
pub fn parse_pipeline_spec(spec: &str) -> Result<Vec<StageSpec>, String> {
    let normalized = spec.replace("->", ",");
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = 0u32;
    for ch in normalized.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                if depth == 0 {
                    return Err("unbalanced ')'".to_string());
                }
                depth -= 1;
                current.push(ch);
            }
            ',' if depth == 0 => {
                tokens.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if depth != 0 {
        return Err("unbalanced '('".to_string());
    }
    tokens.push(current);

    let mut stages = Vec::new();
    for token in tokens {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let (name, params) = match token.find('(') {
            Some(open) => {
                if !token.ends_with(')') {
                    return Err(format!("missing ')' in stage '{token}'"));
                }
                let name = token[..open].trim();
                let inner = &token[open + 1..token.len() - 1];
                let mut params = HashMap::new();
                for part in inner.split(',') {
                    let part = part.trim();
                    if part.is_empty() {
                        continue;
                    }
                    let (key, value) = part
                        .split_once('=')
                        .ok_or_else(|| format!("malformed parameter '{part}' in stage '{name}'"))?;
                    params.insert(key.trim().to_string(), value.trim().to_string());
                }
                (name, params)
            }
            None => (token, HashMap::new()),
        };
        if name.is_empty() {
            return Err(format!("empty stage name in '{token}'"));
        }
        stages.push(StageSpec {
            name: name.to_string(),
            params,
        });
    }
    Ok(stages)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Build,
    Temporal,
    Spatial(Option<SmoothingKernel>),
    Fusion,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Build => "build",
            Stage::Temporal => "temporal",
            Stage::Spatial(_) => "spatial",
            Stage::Fusion => "fusion",
        }
    }
}

/// Downstream consumer of finished frames.
pub type WorldFrameSink = Box<dyn FnMut(&WorldFrame) + Send>;

/// The per-sensor processing pipeline.
///
/// Not internally synchronized: callers serialize frames at the entry (the
/// HAL callback typically holds a mutex around `process_raw_depth_frame`).
pub struct ProcessingPipeline {
    cfg: ProcessingConfig,
    transform: TransformParameters,
    builder: FrameBuilder,
    temporal: Option<Box<dyn HeightMapFilter>>,
    spatial: SpatialFilter,
    fastgauss: FastGaussianBlur,
    fusion: FusionAccumulator,
    stages: Vec<Stage>,
    adaptive: AdaptiveState,
    metrics: StabilityMetrics,
    ema_variance: f32,
    frame_counter: u64,
    last_timestamp_ns: u64,
    width: u32,
    height: u32,
    cloud: crate::frame::PointCloud,
    height_map: Vec<f32>,
    validity: Vec<u8>,
    original_invalid: Vec<u8>,
    confidence_map: Vec<f32>,
    layer_confidence: Vec<f32>,
    prev_filtered: Vec<f32>,
    prev_filtered_valid: bool,
    fused_heights: Vec<f32>,
    fused_confidence: Vec<f32>,
    dup_heights: Vec<f32>,
    dup_confidence: Vec<f32>,
    dup_sensor_id: String,
    validation: ValidationSummary,
    out_frame: WorldFrame,
    sink: Option<WorldFrameSink>,
}

impl ProcessingPipeline {
    pub fn new(cfg: ProcessingConfig) -> Self {
        let mut transform = TransformParameters::new(cfg.min_plane, cfg.max_plane);
        if !cfg.explicit_planes {
            transform.apply_elevation_offsets(cfg.elev_min_offset_m, cfg.elev_max_offset_m);
        }
        let adaptive = AdaptiveState {
            strong_kernel: cfg.strong_kernel,
            ..AdaptiveState::default()
        };
        Self {
            builder: FrameBuilder::new(cfg.depth_scale),
            fastgauss: FastGaussianBlur::new(cfg.fastgauss_sigma),
            fusion: FusionAccumulator::new(cfg.dropout_window),
            transform,
            adaptive,
            cfg,
            temporal: None,
            spatial: SpatialFilter::new(),
            stages: Vec::new(),
            metrics: StabilityMetrics::default(),
            ema_variance: 0.0,
            frame_counter: 0,
            last_timestamp_ns: 0,
            width: 0,
            height: 0,
            cloud: crate::frame::PointCloud::default(),
            height_map: Vec::new(),
            validity: Vec::new(),
            original_invalid: Vec::new(),
            confidence_map: Vec::new(),
            layer_confidence: Vec::new(),
            prev_filtered: Vec::new(),
            prev_filtered_valid: false,
            fused_heights: Vec::new(),
            fused_confidence: Vec::new(),
            dup_heights: Vec::new(),
            dup_confidence: Vec::new(),
            dup_sensor_id: String::new(),
            validation: ValidationSummary::default(),
            out_frame: WorldFrame::default(),
            sink: None,
        }
    }

    /// Resolve the configuration from the environment.
    pub fn from_env() -> Self {
        Self::new(ProcessingConfig::from_env())
    }

    /// Install the temporal filter. Stage order is re-derived on the next
    /// frame when no explicit pipeline spec was configured.
    pub fn set_temporal_filter(&mut self, filter: Box<dyn HeightMapFilter>) {
        self.temporal = Some(filter);
        self.stages.clear();
    }

    /// Install the downstream frame sink.
    pub fn set_frame_sink(&mut self, sink: WorldFrameSink) {
        self.sink = Some(sink);
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.cfg
    }

    pub fn transform(&self) -> &TransformParameters {
        &self.transform
    }

    /// Replace the calibration band (e.g. after a recalibration).
    pub fn set_transform(&mut self, transform: TransformParameters) {
        self.transform = transform;
    }

    pub fn metrics(&self) -> &StabilityMetrics {
        &self.metrics
    }

    pub fn fusion_stats(&self) -> &FusionStats {
        self.fusion.stats()
    }

    pub fn last_validation(&self) -> ValidationSummary {
        self.validation
    }

    pub fn adaptive_state(&self) -> &AdaptiveState {
        &self.adaptive
    }

    /// Fused per-pixel confidence of the last frame (empty unless
    /// confidence export is enabled and at least two layers fused).
    pub fn fused_confidence(&self) -> &[f32] {
        &self.fused_confidence
    }

    /// Per-cell validity of the last built frame (1 = measured and in band).
    pub fn validity_mask(&self) -> &[u8] {
        &self.validity
    }

    pub fn frames_processed(&self) -> u64 {
        self.frame_counter
    }

    /// Run one raw depth frame through the stage pipeline and emit the
    /// resulting world frame to the sink.
    pub fn process_raw_depth_frame(&mut self, raw: &RawDepthFrame) {
        let frame_start = Instant::now();
        if self.frame_counter % 120 == 0 {
            tracing::info!(
                "Processing depth frame sensor={} w={} h={} frame={}",
                raw.sensor_id,
                raw.width,
                raw.height,
                self.frame_counter
            );
        }
        if self.stages.is_empty() {
            self.rebuild_stages();
        }
        self.update_adaptive_gating();

        let stages = self.stages.clone();
        let mut spatial_sample = SpatialSample::default();
        let mut blend_applied = false;
        let mut build_ms = 0.0f32;
        let mut fuse_ms = 0.0f32;
        for stage in &stages {
            match stage {
                Stage::Build => {
                    let t0 = Instant::now();
                    self.run_build_stage(raw);
                    build_ms = t0.elapsed().as_secs_f32() * 1e3;
                }
                Stage::Temporal => {
                    if let Some(filter) = self.temporal.as_mut() {
                        filter.apply(&mut self.height_map, self.width, self.height);
                    }
                }
                Stage::Spatial(kernel) => {
                    spatial_sample = self.run_spatial_stage(*kernel);
                }
                Stage::Fusion => {
                    let t0 = Instant::now();
                    blend_applied = self.run_fusion_stage(raw);
                    fuse_ms = t0.elapsed().as_secs_f32() * 1e3;
                }
            }
        }
        self.adaptive.temporal_blend_applied = blend_applied;

        let total_ms = frame_start.elapsed().as_secs_f32() * 1e3;
        if self.cfg.metrics_enabled {
            self.update_metrics(build_ms, fuse_ms, total_ms, &spatial_sample, blend_applied);
        } else {
            self.metrics.frame_id = self.frame_counter;
            self.metrics.width = self.width;
            self.metrics.height = self.height;
        }

        let timestamp_ns = raw.timestamp_ns.max(self.last_timestamp_ns);
        self.last_timestamp_ns = timestamp_ns;
        self.out_frame.frame_id = self.frame_counter;
        self.out_frame.timestamp_ns = timestamp_ns;
        self.out_frame.height_map.width = self.width;
        self.out_frame.height_map.height = self.height;
        self.out_frame.height_map.data.clear();
        self.out_frame.height_map.data.extend_from_slice(&self.height_map);
        self.out_frame.checksum = 0;
        self.out_frame.checksum_algorithm = 0;

        self.frame_counter += 1;
        if let Some(sink) = self.sink.as_mut() {
            sink(&self.out_frame);
        }
    }

    fn rebuild_stages(&mut self) {
        self.stages.clear();
        let parsed = match self.cfg.pipeline_spec.as_deref() {
            Some(spec) => match parse_pipeline_spec(spec) {
                Ok(specs) => Some(specs),
                Err(err) => {
                    tracing::warn!(
                        "Failed to parse pipeline spec '{}': {}; using defaults",
                        spec,
                        err
                    );
                    None
                }
            },
            None => None,
        };
        match parsed {
            Some(specs) => {
                for spec in &specs {
                    match spec.name.as_str() {
                        "build" => self.stages.push(Stage::Build),
                        "temporal" => self.stages.push(Stage::Temporal),
                        "spatial" => {
                            let kernel = match spec.params.get("kernel") {
                                Some(name) => {
                                    let parsed = SmoothingKernel::from_name(name);
                                    if parsed.is_none() {
                                        tracing::warn!(
                                            "Unknown spatial kernel '{}' in pipeline spec, using configured default",
                                            name
                                        );
                                    }
                                    parsed
                                }
                                None => None,
                            };
                            self.stages.push(Stage::Spatial(kernel));
                        }
                        "fusion" => self.stages.push(Stage::Fusion),
                        other => {
                            tracing::warn!("Unknown pipeline stage '{}' ignored", other);
                        }
                    }
                }
                // Frames must always be built and fused; an explicit spec
                // that omits either still keeps the output contract.
                if !self.stages.contains(&Stage::Build) {
                    self.stages.insert(0, Stage::Build);
                }
                if !self.stages.contains(&Stage::Fusion) {
                    self.stages.push(Stage::Fusion);
                }
            }
            None => {
                self.stages.push(Stage::Build);
                if self.temporal.is_some() {
                    self.stages.push(Stage::Temporal);
                }
                self.stages.push(Stage::Spatial(None));
                self.stages.push(Stage::Fusion);
            }
        }
        let order: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        tracing::info!("Pipeline stages: {}", order.join(" -> "));
    }

    fn update_adaptive_gating(&mut self) {
        if self.cfg.adaptive_mode == AdaptiveMode::Streak
            && self.cfg.metrics_enabled
            && self.frame_counter > 0
        {
            let stab = self.metrics.stability_ratio;
            let var = self.metrics.avg_variance;
            let unstable = stab < self.cfg.stability_min || var > self.cfg.variance_max;
            advance_gating(
                &mut self.adaptive,
                unstable,
                self.cfg.on_streak,
                self.cfg.off_streak,
            );
            self.adaptive.strong_active = self.adaptive.spatial_active
                && (var > self.cfg.strong_var_mult * self.cfg.variance_max
                    || stab < self.cfg.strong_stab_frac);
        } else {
            self.adaptive.spatial_active = false;
            self.adaptive.strong_active = false;
        }
    }

    fn run_build_stage(&mut self, raw: &RawDepthFrame) {
        self.validation = self.builder.build(raw, &self.transform, &mut self.cloud);
        self.width = self.cloud.width;
        self.height = self.cloud.height;
        let n = self.cloud.points.len();
        self.height_map.resize(n, f32::NAN);
        self.validity.resize(n, 0);
        self.original_invalid.resize(n, 0);
        let mut invalid = 0u32;
        for (i, p) in self.cloud.points.iter().enumerate() {
            let orig_invalid = !(p.valid && p.z.is_finite());
            self.original_invalid[i] = u8::from(orig_invalid);
            self.validity[i] = u8::from(!orig_invalid);
            self.height_map[i] = if orig_invalid { f32::NAN } else { p.z };
            if orig_invalid {
                invalid += 1;
            }
        }
        self.validation.invalid = invalid;
    }

    fn apply_kernel(&mut self, kernel: SmoothingKernel) {
        match kernel.spatial_kernel() {
            Some(k) => self
                .spatial
                .apply(&mut self.height_map, self.width, self.height, k),
            None => self
                .fastgauss
                .apply(&mut self.height_map, self.width, self.height),
        }
    }

    fn run_spatial_stage(&mut self, kernel_param: Option<SmoothingKernel>) -> SpatialSample {
        let mut sample = SpatialSample::default();
        let apply = self.cfg.spatial_enabled || self.adaptive.spatial_active;
        if !apply || self.height_map.is_empty() {
            return sample;
        }
        sample.applied = true;
        sample.strong = self.adaptive.strong_active;
        // A stage-level kernel parameter wins over the configured default.
        let kernel = kernel_param.unwrap_or(self.cfg.spatial_kernel);

        let indices = if self.cfg.metrics_enabled {
            sample_indices(
                self.height_map.len(),
                self.cfg.spatial_sample_count,
                self.frame_counter,
            )
        } else {
            Vec::new()
        };
        if !indices.is_empty() {
            let (var, edge) =
                sampled_variance_and_edge(&self.height_map, self.width, self.height, &indices);
            sample.pre_var = var;
            sample.pre_edge = edge;
            sample.sampled = true;
        }

        self.apply_kernel(kernel);
        if self.adaptive.strong_active {
            match self.adaptive.strong_kernel {
                StrongKernel::ClassicDouble => {
                    if self.cfg.strong_double_pass {
                        self.apply_kernel(kernel);
                    }
                }
                StrongKernel::Wide5 => self.apply_kernel(SmoothingKernel::Wide5),
                StrongKernel::Fastgauss => self.apply_kernel(SmoothingKernel::Fastgauss),
            }
        }

        if sample.sampled {
            let (var, edge) =
                sampled_variance_and_edge(&self.height_map, self.width, self.height, &indices);
            sample.post_var = var;
            sample.post_edge = edge;
        }
        sample
    }

    fn run_fusion_stage(&mut self, raw: &RawDepthFrame) -> bool {
        let n = self.height_map.len();
        let (w, h) = (self.width, self.height);

        let mut blend_applied = false;
        if self.cfg.temporal_scale > 1.0 && self.frame_counter > 0 && self.cfg.metrics_enabled {
            let unstable = self.metrics.stability_ratio < self.cfg.stability_min
                || self.metrics.avg_variance > self.cfg.variance_max;
            if unstable && self.prev_filtered_valid && self.prev_filtered.len() == n {
                let alpha = 1.0 / self.cfg.temporal_scale;
                for (cur, prev) in self.height_map.iter_mut().zip(&self.prev_filtered) {
                    if cur.is_finite() && prev.is_finite() {
                        *cur = alpha * *cur + (1.0 - alpha) * prev;
                    }
                }
                blend_applied = true;
            }
        }
        if self.cfg.temporal_scale > 1.0 {
            self.prev_filtered.clear();
            self.prev_filtered.extend_from_slice(&self.height_map);
            self.prev_filtered_valid = true;
        }

        self.fusion.begin_frame(self.frame_counter, w, h);
        let confidence: Option<&[f32]> = if self.cfg.confidence_enabled {
            // The confidence map of the previous frame weights this frame's
            // layer; before the first metrics pass fall back to the
            // configured base confidence (duplicate-layer mode) or zero.
            let fill = if self.cfg.dup_layer {
                self.cfg.dup_layer_base_conf
            } else {
                0.0
            };
            self.layer_confidence.resize(n, 0.0);
            for i in 0..n {
                self.layer_confidence[i] = self.confidence_map.get(i).copied().unwrap_or(fill);
            }
            Some(&self.layer_confidence)
        } else {
            None
        };
        self.fusion.add_layer(&FusionInputLayer {
            sensor_id: &raw.sensor_id,
            heights: &self.height_map,
            confidence,
            width: w,
            height: h,
        });

        if self.cfg.dup_layer {
            let shift = self.cfg.dup_layer_shift;
            self.dup_heights.clear();
            self.dup_heights.extend(
                self.height_map
                    .iter()
                    .map(|v| if v.is_finite() { *v + shift } else { *v }),
            );
            let dup_confidence: Option<&[f32]> = if self.cfg.confidence_enabled {
                self.dup_confidence.clear();
                self.dup_confidence.resize(n, self.cfg.dup_layer_dup_conf);
                Some(&self.dup_confidence)
            } else {
                None
            };
            self.dup_sensor_id.clear();
            self.dup_sensor_id.push_str(&raw.sensor_id);
            self.dup_sensor_id.push_str("_dup");
            self.fusion.add_layer(&FusionInputLayer {
                sensor_id: &self.dup_sensor_id,
                heights: &self.dup_heights,
                confidence: dup_confidence,
                width: w,
                height: h,
            });
        }

        let conf_out = if self.cfg.confidence_enabled && self.cfg.export_confidence {
            Some(&mut self.fused_confidence)
        } else {
            None
        };
        self.fusion.fuse(&mut self.fused_heights, conf_out);
        // External consumers see invalid cells as exact zeros.
        for v in self.fused_heights.iter_mut() {
            if !v.is_finite() {
                *v = 0.0;
            }
        }
        self.height_map.clear();
        self.height_map.extend_from_slice(&self.fused_heights);
        blend_applied
    }

    fn update_metrics(
        &mut self,
        build_ms: f32,
        fuse_ms: f32,
        total_ms: f32,
        sample: &SpatialSample,
        blend_applied: bool,
    ) {
        self.metrics.frame_id = self.frame_counter;
        self.metrics.width = self.width;
        self.metrics.height = self.height;
        self.metrics.hard_invalid = self.validation.invalid;
        self.metrics.build_ms = build_ms;
        self.metrics.fuse_ms = fuse_ms;
        self.metrics.proc_total_ms = total_ms;

        let (mean_abs, _) = mean_abs_horizontal_diff(&self.height_map, self.width, self.height);
        self.ema_variance = if self.ema_variance == 0.0 {
            mean_abs
        } else {
            0.1 * mean_abs + 0.9 * self.ema_variance
        };
        self.metrics.avg_variance = self.ema_variance;
        self.metrics.stability_ratio =
            stability_ratio(&self.height_map, self.width, self.height, mean_abs);
        self.metrics.adaptive_spatial = self.adaptive.spatial_active;
        self.metrics.adaptive_strong = sample.strong && sample.applied;
        self.metrics.adaptive_streak = if self.adaptive.spatial_active {
            self.adaptive.unstable_streak
        } else {
            0
        };
        self.metrics.adaptive_temporal_blend = blend_applied;
        self.metrics.spatial_variance_ratio =
            if sample.sampled && sample.applied && sample.pre_var > 0.0 && sample.post_var > 0.0 {
                sample.post_var / sample.pre_var
            } else {
                0.0
            };
        self.metrics.spatial_edge_preservation_ratio =
            if sample.sampled && sample.applied && sample.pre_edge > 0.0 && sample.post_edge > 0.0 {
                sample.post_edge / sample.pre_edge
            } else {
                0.0
            };

        if self.cfg.confidence_enabled {
            self.update_confidence();
        } else {
            self.metrics.mean_confidence = 0.0;
            self.metrics.fraction_low_confidence = 0.0;
            self.metrics.fraction_high_confidence = 0.0;
        }
    }

    fn update_confidence(&mut self) {
        let n = self.height_map.len();
        self.confidence_map.resize(n, 0.0);

        let s = self.metrics.stability_ratio.clamp(0.0, 1.0);
        let mut r = self.metrics.spatial_variance_ratio;
        if !r.is_finite() || r <= 0.0 || r > 2.0 {
            r = 1.0;
        }
        let t = if self.metrics.adaptive_temporal_blend {
            1.0
        } else {
            0.0
        };
        let mut w_s = self.cfg.conf_weight_s;
        let mut w_r = self.cfg.conf_weight_r;
        let mut w_t = self.cfg.conf_weight_t;
        if self.metrics.spatial_variance_ratio == 0.0 {
            w_r = 0.0;
        }
        let mut ws = w_s + w_r + w_t;
        if ws <= 0.0 {
            w_s = 1.0;
            w_r = 0.0;
            w_t = 0.0;
            ws = 1.0;
        }
        let comp_r = if w_r > 0.0 {
            w_r * (1.0 - r.clamp(0.0, 1.0))
        } else {
            0.0
        };
        let cell_confidence = ((w_s * s + comp_r + w_t * t) / ws).clamp(0.0, 1.0);

        let mut sum = 0.0f64;
        let mut valid_count = 0usize;
        let mut low = 0usize;
        let mut high = 0usize;
        for i in 0..n {
            let orig_invalid = self
                .original_invalid
                .get(i)
                .map(|v| *v != 0)
                .unwrap_or(false);
            let valid = self.height_map[i].is_finite() && !orig_invalid;
            let c = if valid {
                valid_count += 1;
                cell_confidence
            } else {
                0.0
            };
            self.confidence_map[i] = c;
            sum += f64::from(c);
            if c < self.cfg.conf_low_thresh {
                low += 1;
            } else if c > self.cfg.conf_high_thresh {
                high += 1;
            }
        }
        self.metrics.mean_confidence = if valid_count == 0 {
            0.0
        } else {
            (sum / valid_count as f64) as f32
        };
        self.metrics.fraction_low_confidence = if n == 0 { 0.0 } else { low as f32 / n as f32 };
        self.metrics.fraction_high_confidence = if n == 0 { 0.0 } else { high as f32 / n as f32 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn ramp_frame(width: u32, height: u32, ts: u64) -> RawDepthFrame {
        let mut data = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                data.push((x + y) as u16);
            }
        }
        RawDepthFrame {
            sensor_id: "synthetic0".into(),
            timestamp_ns: ts,
            width,
            height,
            data,
        }
    }

    fn constant_frame(width: u32, height: u32, value: u16, ts: u64) -> RawDepthFrame {
        RawDepthFrame {
            sensor_id: "synthetic0".into(),
            timestamp_ns: ts,
            width,
            height,
            data: vec![value; (width * height) as usize],
        }
    }

    fn collect_frames(pipeline: &mut ProcessingPipeline) -> Arc<Mutex<Vec<WorldFrame>>> {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink_frames = collected.clone();
        pipeline.set_frame_sink(Box::new(move |frame| {
            sink_frames.lock().unwrap().push(frame.clone());
        }));
        collected
    }

    #[test]
    fn test_parse_spec_with_params() {
        let stages = parse_pipeline_spec("build,temporal,spatial(kernel=wide5),fusion").unwrap();
        assert_eq!(stages.len(), 4);
        assert_eq!(stages[0].name, "build");
        assert_eq!(stages[2].name, "spatial");
        assert_eq!(stages[2].params.get("kernel").map(String::as_str), Some("wide5"));
    }

    #[test]
    fn test_parse_spec_arrow_separator() {
        let stages = parse_pipeline_spec("build -> spatial -> fusion").unwrap();
        let names: Vec<_> = stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["build", "spatial", "fusion"]);
    }

    #[test]
    fn test_parse_spec_rejects_malformed() {
        assert!(parse_pipeline_spec("spatial(kernel=wide5").is_err());
        assert!(parse_pipeline_spec("spatial(kernel)").is_err());
        assert!(parse_pipeline_spec("spatial)").is_err());
    }

    #[test]
    fn test_ramp_passthrough_and_monotonic_ids() {
        let mut pipeline = ProcessingPipeline::new(ProcessingConfig::default());
        let frames = collect_frames(&mut pipeline);
        for i in 0..3u64 {
            pipeline.process_raw_depth_frame(&ramp_frame(16, 16, 1000 + i));
        }
        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.frame_id, i as u64);
            assert_eq!(frame.height_map.width, 16);
            assert_eq!(frame.height_map.height, 16);
            for y in 0..16u32 {
                for x in 0..16u32 {
                    let expected = (x + y) as f32 * 0.001;
                    let got = frame.height_map.data[(y * 16 + x) as usize];
                    assert!(
                        (got - expected).abs() < 1e-6,
                        "cell ({x},{y}): {got} != {expected}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_empty_raw_data_publishes_zeros() {
        let mut pipeline = ProcessingPipeline::new(ProcessingConfig::default());
        let frames = collect_frames(&mut pipeline);
        let raw = RawDepthFrame {
            sensor_id: "synthetic0".into(),
            timestamp_ns: 5,
            width: 4,
            height: 4,
            data: Vec::new(),
        };
        pipeline.process_raw_depth_frame(&raw);
        assert_eq!(pipeline.last_validation().valid, 0);
        assert_eq!(pipeline.last_validation().invalid, 16);
        assert!(pipeline.validity_mask().iter().all(|v| *v == 0));
        let frames = frames.lock().unwrap();
        assert!(frames[0].height_map.data.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_timestamps_non_decreasing() {
        let mut pipeline = ProcessingPipeline::new(ProcessingConfig::default());
        let frames = collect_frames(&mut pipeline);
        pipeline.process_raw_depth_frame(&constant_frame(4, 4, 100, 50));
        // A sensor clock glitch must not move published timestamps backwards.
        pipeline.process_raw_depth_frame(&constant_frame(4, 4, 100, 20));
        let frames = frames.lock().unwrap();
        assert_eq!(frames[0].timestamp_ns, 50);
        assert_eq!(frames[1].timestamp_ns, 50);
    }

    #[test]
    fn test_explicit_spec_without_fusion_still_emits() {
        let cfg = ProcessingConfig {
            pipeline_spec: Some("spatial".to_string()),
            ..ProcessingConfig::default()
        };
        let mut pipeline = ProcessingPipeline::new(cfg);
        let frames = collect_frames(&mut pipeline);
        pipeline.process_raw_depth_frame(&constant_frame(4, 4, 1000, 1));
        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].height_map.data.iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_unknown_stage_ignored() {
        let cfg = ProcessingConfig {
            pipeline_spec: Some("build,warp,fusion".to_string()),
            ..ProcessingConfig::default()
        };
        let mut pipeline = ProcessingPipeline::new(cfg);
        let frames = collect_frames(&mut pipeline);
        pipeline.process_raw_depth_frame(&constant_frame(2, 2, 500, 1));
        assert_eq!(frames.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_metrics_flat_frame_is_stable() {
        let cfg = ProcessingConfig {
            metrics_enabled: true,
            ..ProcessingConfig::default()
        };
        let mut pipeline = ProcessingPipeline::new(cfg);
        pipeline.process_raw_depth_frame(&constant_frame(8, 8, 1000, 1));
        let m = pipeline.metrics();
        assert_eq!(m.stability_ratio, 1.0);
        assert_eq!(m.avg_variance, 0.0);
        assert_eq!(m.hard_invalid, 0);
        // Flat frame, spatial not applied: confidence is wS*1 / (wS + wT).
        let expected = 0.5 / 0.7;
        assert!((m.mean_confidence - expected).abs() < 1e-4);
    }

    #[test]
    fn test_adaptive_temporal_blend_mixes_frames() {
        let cfg = ProcessingConfig {
            metrics_enabled: true,
            temporal_scale: 4.0,
            // Force every frame unstable so the blend path runs.
            stability_min: 1.5,
            ..ProcessingConfig::default()
        };
        let mut pipeline = ProcessingPipeline::new(cfg);
        let frames = collect_frames(&mut pipeline);
        pipeline.process_raw_depth_frame(&constant_frame(4, 4, 1000, 1));
        pipeline.process_raw_depth_frame(&constant_frame(4, 4, 2000, 2));
        let frames = frames.lock().unwrap();
        // Frame 1 blends 1/4 of the new 2.0m map with 3/4 of the previous 1.0m.
        for v in &frames[1].height_map.data {
            assert!((v - 1.25).abs() < 1e-6);
        }
        assert!(pipeline.metrics().adaptive_temporal_blend);
    }

    #[test]
    fn test_dup_layer_weighted_fusion() {
        let cfg = ProcessingConfig {
            dup_layer: true,
            dup_layer_shift: 0.2,
            dup_layer_base_conf: 1.0,
            dup_layer_dup_conf: 1.0,
            ..ProcessingConfig::default()
        };
        let mut pipeline = ProcessingPipeline::new(cfg);
        let frames = collect_frames(&mut pipeline);
        pipeline.process_raw_depth_frame(&constant_frame(4, 4, 1000, 1));
        assert_eq!(pipeline.fusion_stats().layer_count, 2);
        let frames = frames.lock().unwrap();
        // Equal weights: (1.0 + 1.2) / 2.
        for v in &frames[0].height_map.data {
            assert!((v - 1.1).abs() < 1e-6);
        }
    }

    #[test]
    fn test_static_spatial_enable_smooths() {
        let cfg = ProcessingConfig {
            spatial_enabled: true,
            ..ProcessingConfig::default()
        };
        let mut pipeline = ProcessingPipeline::new(cfg);
        let frames = collect_frames(&mut pipeline);
        // Impulse in the middle of an otherwise flat frame.
        let mut raw = constant_frame(5, 5, 1000, 1);
        raw.data[12] = 1500;
        pipeline.process_raw_depth_frame(&raw);
        let frames = frames.lock().unwrap();
        let center = frames[0].height_map.data[12];
        assert!(center < 1.5 && center > 1.0);
    }

    #[test]
    fn test_temporal_filter_runs_when_installed() {
        let mut pipeline = ProcessingPipeline::new(ProcessingConfig::default());
        pipeline.set_temporal_filter(Box::new(FastGaussianBlur::new(1.5)));
        let frames = collect_frames(&mut pipeline);
        let mut raw = constant_frame(9, 9, 1000, 1);
        raw.data[4 * 9 + 4] = 1500;
        pipeline.process_raw_depth_frame(&raw);
        let frames = frames.lock().unwrap();
        let center = frames[0].height_map.data[4 * 9 + 4];
        assert!(center < 1.5);
    }
}
