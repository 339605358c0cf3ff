//! Per-frame stability metrics and the adaptive state they drive.

use crate::config::StrongKernel;

/// Statistics computed over each fused frame. Overwritten every frame; the
/// most recent instance is readable through the pipeline.
#[derive(Debug, Clone, Default)]
pub struct StabilityMetrics {
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    /// Cells invalid at build time (no measurement or out of band).
    pub hard_invalid: u32,
    pub build_ms: f32,
    pub fuse_ms: f32,
    pub proc_total_ms: f32,
    /// EMA of the mean absolute horizontal neighbor difference.
    pub avg_variance: f32,
    /// Fraction of neighbor pairs within the stability threshold.
    pub stability_ratio: f32,
    pub adaptive_spatial: bool,
    pub adaptive_strong: bool,
    /// Unstable streak length while spatial is active, 0 otherwise.
    pub adaptive_streak: u32,
    pub adaptive_temporal_blend: bool,
    /// Post/pre variance over the sampled subset; 0 when not applied.
    pub spatial_variance_ratio: f32,
    /// Post/pre mean gradient magnitude; 0 when not applied.
    pub spatial_edge_preservation_ratio: f32,
    pub mean_confidence: f32,
    pub fraction_low_confidence: f32,
    pub fraction_high_confidence: f32,
}

/// Adaptive gating state carried across frames. Per pipeline instance.
#[derive(Debug, Clone)]
pub struct AdaptiveState {
    pub spatial_active: bool,
    pub strong_active: bool,
    pub unstable_streak: u32,
    pub stable_streak: u32,
    pub temporal_blend_applied: bool,
    pub strong_kernel: StrongKernel,
}

impl Default for AdaptiveState {
    fn default() -> Self {
        Self {
            spatial_active: false,
            strong_active: false,
            unstable_streak: 0,
            stable_streak: 0,
            temporal_blend_applied: false,
            strong_kernel: StrongKernel::ClassicDouble,
        }
    }
}

/// Advance the spatial gating hysteresis with one frame's verdict.
///
/// Activation requires `on_streak` consecutive unstable frames; once active,
/// deactivation requires `off_streak` consecutive stable frames.
pub fn advance_gating(state: &mut AdaptiveState, unstable: bool, on_streak: u32, off_streak: u32) {
    if unstable {
        state.unstable_streak += 1;
        state.stable_streak = 0;
    } else {
        state.stable_streak += 1;
        state.unstable_streak = 0;
    }
    if !state.spatial_active && state.unstable_streak >= on_streak {
        state.spatial_active = true;
    }
    if state.spatial_active && state.stable_streak >= off_streak {
        state.spatial_active = false;
    }
}

/// Pre/post measurements around a spatial filter application.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpatialSample {
    pub applied: bool,
    pub strong: bool,
    pub sampled: bool,
    pub pre_var: f32,
    pub post_var: f32,
    pub pre_edge: f32,
    pub post_edge: f32,
}

/// Mean absolute difference between horizontally adjacent finite cells,
/// and the number of pairs considered.
pub fn mean_abs_horizontal_diff(data: &[f32], width: u32, height: u32) -> (f32, u32) {
    let w = width as usize;
    let mut total = 0.0f64;
    let mut count = 0u32;
    for y in 0..height as usize {
        for x in 1..w {
            let a = data[y * w + x - 1];
            let b = data[y * w + x];
            if a.is_finite() && b.is_finite() {
                total += f64::from((a - b).abs());
                count += 1;
            }
        }
    }
    let mean = if count > 0 { (total / f64::from(count)) as f32 } else { 0.0 };
    (mean, count)
}

/// Fraction of finite horizontal neighbor pairs whose difference stays
/// within `1.5 * mean_abs_diff + epsilon`. 1.0 when no pairs exist.
pub fn stability_ratio(data: &[f32], width: u32, height: u32, mean_abs_diff: f32) -> f32 {
    let w = width as usize;
    let thresh = mean_abs_diff * 1.5 + 1e-6;
    let mut stable = 0u32;
    let mut considered = 0u32;
    for y in 0..height as usize {
        for x in 1..w {
            let a = data[y * w + x - 1];
            let b = data[y * w + x];
            if a.is_finite() && b.is_finite() {
                considered += 1;
                if (a - b).abs() <= thresh {
                    stable += 1;
                }
            }
        }
    }
    if considered > 0 {
        stable as f32 / considered as f32
    } else {
        1.0
    }
}

/// Deterministic sample of cell indices for the spatial effectiveness
/// ratios. Empty when the map is not larger than the requested count
/// (small maps skip sampling entirely).
pub fn sample_indices(len: usize, count: usize, frame_id: u64) -> Vec<usize> {
    if count == 0 || len <= count {
        return Vec::new();
    }
    let step = (len / count).max(1);
    let seed = (frame_id.wrapping_mul(1_664_525).wrapping_add(1_013_904_223)) as usize % len;
    let mut idx = seed % step;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        if idx >= len {
            break;
        }
        out.push(idx);
        idx += step;
    }
    out
}

/// Sample variance and mean gradient magnitude over the given cells.
pub fn sampled_variance_and_edge(
    data: &[f32],
    width: u32,
    height: u32,
    indices: &[usize],
) -> (f32, f32) {
    let w = width as usize;
    let h = height as usize;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut n = 0u32;
    for &i in indices {
        let v = data[i];
        if v.is_finite() {
            sum += f64::from(v);
            sum_sq += f64::from(v) * f64::from(v);
            n += 1;
        }
    }
    let var = if n > 1 {
        ((sum_sq - (sum * sum) / f64::from(n)) / f64::from(n - 1)) as f32
    } else {
        0.0
    };

    let mut edge = 0.0f64;
    let mut edge_n = 0u32;
    for &i in indices {
        let c = data[i];
        if !c.is_finite() {
            continue;
        }
        let x = i % w;
        let y = i / w;
        let mut gx = 0.0f32;
        let mut gy = 0.0f32;
        if x + 1 < w {
            let r = data[i + 1];
            if r.is_finite() {
                gx = r - c;
            }
        }
        if y + 1 < h {
            let d = data[i + w];
            if d.is_finite() {
                gy = d - c;
            }
        }
        edge += f64::from(gx.abs() + gy.abs());
        edge_n += 1;
    }
    let mean_edge = if edge_n > 0 { (edge / f64::from(edge_n)) as f32 } else { 0.0 };
    (var, mean_edge)
}
