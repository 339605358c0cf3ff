//! Configuration resolver.
//!
//! Every tunable is collected into explicit config records populated from one
//! place — the process environment — instead of ad-hoc lookups scattered
//! through the pipeline. All records implement `Default` so tests can build
//! them programmatically without touching the environment.

use std::env;
use std::time::Duration;

use crate::spatial::SpatialKernel;

/// Base smoothing kernel selectable for the spatial stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmoothingKernel {
    /// Radius-1 separable `[1, 2, 1]` kernel.
    #[default]
    Classic,
    /// Radius-2 separable `[1, 4, 6, 4, 1]` kernel.
    Wide5,
    /// Three-pass box-blur Gaussian approximation.
    Fastgauss,
}

impl SmoothingKernel {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "classic" => Some(Self::Classic),
            "wide5" => Some(Self::Wide5),
            "fastgauss" => Some(Self::Fastgauss),
            _ => None,
        }
    }

    /// Mapping onto the separable spatial kernels; `Fastgauss` has none.
    pub fn spatial_kernel(self) -> Option<SpatialKernel> {
        match self {
            Self::Classic => Some(SpatialKernel::Classic),
            Self::Wide5 => Some(SpatialKernel::Wide5),
            Self::Fastgauss => None,
        }
    }
}

/// Second-pass kernel applied under strong adaptive conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrongKernel {
    /// Repeat the base kernel (gated by `strong_double_pass`).
    #[default]
    ClassicDouble,
    Wide5,
    Fastgauss,
}

impl StrongKernel {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "classic_double" => Some(Self::ClassicDouble),
            "wide5" => Some(Self::Wide5),
            "fastgauss" => Some(Self::Fastgauss),
            _ => None,
        }
    }
}

/// Adaptive gating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdaptiveMode {
    Off,
    /// Streak-based hysteresis over per-frame stability metrics.
    #[default]
    Streak,
}

impl AdaptiveMode {
    pub fn from_value(value: i64) -> Self {
        if value == 2 {
            Self::Streak
        } else {
            Self::Off
        }
    }
}

/// Tunables of the processing pipeline.
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    /// Meters per raw depth unit.
    pub depth_scale: f32,
    /// Emit and act on per-frame stability metrics.
    pub metrics_enabled: bool,
    pub adaptive_mode: AdaptiveMode,
    /// A frame is unstable when `stability_ratio` drops below this.
    pub stability_min: f32,
    /// A frame is unstable when the variance proxy exceeds this.
    pub variance_max: f32,
    /// Consecutive unstable frames before the spatial filter activates.
    pub on_streak: u32,
    /// Consecutive stable frames before it deactivates.
    pub off_streak: u32,
    /// Multiplies `variance_max` for the strong trigger.
    pub strong_var_mult: f32,
    /// Stability below this is strong.
    pub strong_stab_frac: f32,
    pub strong_double_pass: bool,
    pub strong_kernel: StrongKernel,
    /// Blend denominator k for adaptive temporal blending; <= 1 disables.
    pub temporal_scale: f32,
    pub confidence_enabled: bool,
    /// Fill the fused confidence output on `fuse`.
    pub export_confidence: bool,
    pub conf_weight_s: f32,
    pub conf_weight_r: f32,
    pub conf_weight_t: f32,
    pub conf_low_thresh: f32,
    pub conf_high_thresh: f32,
    /// Sensor counts as stale after strictly more than this many absent
    /// frames; 0 disables dropout tracking.
    pub dropout_window: u64,
    /// Lower validity plane (a, b, c, d); accept when `ax+by+cz+d >= 0`.
    pub min_plane: [f32; 4],
    /// Upper validity plane; accept when `ax+by+cz+d <= 0`.
    pub max_plane: [f32; 4],
    /// True when planes came from explicit configuration (offsets skipped).
    pub explicit_planes: bool,
    pub elev_min_offset_m: Option<f32>,
    pub elev_max_offset_m: Option<f32>,
    /// Stage order override, e.g. `build,temporal,spatial(kernel=wide5),fusion`.
    pub pipeline_spec: Option<String>,
    /// Force the spatial stage on regardless of adaptive gating.
    pub spatial_enabled: bool,
    /// Base kernel when the spatial stage carries no `kernel=` parameter.
    pub spatial_kernel: SmoothingKernel,
    /// Cells sampled for the pre/post spatial effectiveness ratios.
    pub spatial_sample_count: usize,
    /// Standard deviation of the box-blur Gaussian approximation.
    pub fastgauss_sigma: f32,
    /// Inject a shifted duplicate of the primary layer into fusion.
    pub dup_layer: bool,
    pub dup_layer_shift: f32,
    pub dup_layer_base_conf: f32,
    pub dup_layer_dup_conf: f32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            depth_scale: 0.001,
            metrics_enabled: false,
            adaptive_mode: AdaptiveMode::Streak,
            stability_min: 0.85,
            variance_max: 0.01,
            on_streak: 2,
            off_streak: 3,
            strong_var_mult: 3.0,
            strong_stab_frac: 0.5,
            strong_double_pass: true,
            strong_kernel: StrongKernel::ClassicDouble,
            temporal_scale: 1.0,
            confidence_enabled: true,
            export_confidence: false,
            conf_weight_s: 0.5,
            conf_weight_r: 0.3,
            conf_weight_t: 0.2,
            conf_low_thresh: 0.3,
            conf_high_thresh: 0.75,
            dropout_window: 60,
            min_plane: [0.0, 0.0, 1.0, 0.0],
            max_plane: [0.0, 0.0, 1.0, -2.0],
            explicit_planes: false,
            elev_min_offset_m: None,
            elev_max_offset_m: None,
            pipeline_spec: None,
            spatial_enabled: false,
            spatial_kernel: SmoothingKernel::Classic,
            spatial_sample_count: 512,
            fastgauss_sigma: 1.5,
            dup_layer: false,
            dup_layer_shift: 0.0,
            dup_layer_base_conf: 1.0,
            dup_layer_dup_conf: 1.0,
        }
    }
}

impl ProcessingConfig {
    /// Resolve from the environment, falling back to defaults per key.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.depth_scale = env_f32("CALDERA_DEPTH_SCALE", cfg.depth_scale);
        cfg.metrics_enabled = env_flag("CALDERA_PROCESSING_STABILITY_METRICS", cfg.metrics_enabled);
        cfg.adaptive_mode = AdaptiveMode::from_value(env_i64("CALDERA_ADAPTIVE_MODE", 2));
        cfg.stability_min = env_f32("CALDERA_ADAPTIVE_STAB_MIN", cfg.stability_min);
        cfg.variance_max = env_f32("CALDERA_ADAPTIVE_VAR_MAX", cfg.variance_max);
        cfg.on_streak = env_i64("CALDERA_ADAPTIVE_ON_STREAK", cfg.on_streak as i64).max(1) as u32;
        cfg.off_streak = env_i64("CALDERA_ADAPTIVE_OFF_STREAK", cfg.off_streak as i64).max(1) as u32;
        cfg.strong_var_mult = env_f32("CALDERA_ADAPTIVE_STRONG_VAR_MULT", cfg.strong_var_mult);
        cfg.strong_stab_frac = env_f32("CALDERA_ADAPTIVE_STRONG_STAB_FRAC", cfg.strong_stab_frac);
        cfg.strong_double_pass = env_flag("CALDERA_ADAPTIVE_STRONG_DOUBLE", cfg.strong_double_pass);
        if let Ok(name) = env::var("CALDERA_ADAPTIVE_STRONG_KERNEL") {
            match StrongKernel::from_name(&name) {
                Some(kernel) => cfg.strong_kernel = kernel,
                None => tracing::warn!("Unknown strong kernel '{}', keeping default", name),
            }
        }
        cfg.temporal_scale = env_f32("CALDERA_ADAPTIVE_TEMPORAL_SCALE", cfg.temporal_scale);
        cfg.confidence_enabled = env_flag("CALDERA_ENABLE_CONFIDENCE_MAP", cfg.confidence_enabled);
        cfg.export_confidence =
            env_flag("CALDERA_PROCESSING_EXPORT_CONFIDENCE", cfg.export_confidence);
        cfg.conf_weight_s = env_f32("CALDERA_CONF_WEIGHT_S", cfg.conf_weight_s);
        cfg.conf_weight_r = env_f32("CALDERA_CONF_WEIGHT_R", cfg.conf_weight_r);
        cfg.conf_weight_t = env_f32("CALDERA_CONF_WEIGHT_T", cfg.conf_weight_t);
        cfg.conf_low_thresh = env_f32("CALDERA_CONF_LOW_THRESH", cfg.conf_low_thresh);
        cfg.conf_high_thresh = env_f32("CALDERA_CONF_HIGH_THRESH", cfg.conf_high_thresh);
        cfg.dropout_window =
            env_i64("CALDERA_FUSION_DROPOUT_WINDOW", cfg.dropout_window as i64).max(0) as u64;
        if let Some(plane) = env_plane("CALDERA_CALIB_MIN_PLANE") {
            cfg.min_plane = plane;
            cfg.explicit_planes = true;
        }
        if let Some(plane) = env_plane("CALDERA_CALIB_MAX_PLANE") {
            cfg.max_plane = plane;
            cfg.explicit_planes = true;
        }
        cfg.elev_min_offset_m = env_opt_f32("CALDERA_ELEV_MIN_OFFSET_M");
        cfg.elev_max_offset_m = env_opt_f32("CALDERA_ELEV_MAX_OFFSET_M");
        cfg.pipeline_spec = env::var("CALDERA_PROCESSING_PIPELINE")
            .ok()
            .filter(|s| !s.is_empty());
        cfg.spatial_enabled = env_flag("CALDERA_ENABLE_SPATIAL_FILTER", cfg.spatial_enabled);
        if let Ok(name) = env::var("CALDERA_SPATIAL_KERNEL_ALT") {
            match SmoothingKernel::from_name(&name) {
                Some(kernel) => cfg.spatial_kernel = kernel,
                None => tracing::warn!("Unknown spatial kernel '{}', keeping default", name),
            }
        }
        cfg.spatial_sample_count =
            env_i64("CALDERA_SPATIAL_SAMPLE_COUNT", cfg.spatial_sample_count as i64).max(0)
                as usize;
        if cfg.spatial_sample_count == 0 {
            cfg.spatial_sample_count = Self::default().spatial_sample_count;
        }
        let sigma = env_f32("CALDERA_FASTGAUSS_SIGMA", cfg.fastgauss_sigma);
        if sigma > 0.1 && sigma < 20.0 {
            cfg.fastgauss_sigma = sigma;
        }
        cfg.dup_layer = env_flag("CALDERA_FUSION_DUP_LAYER", cfg.dup_layer);
        cfg.dup_layer_shift = env_f32("CALDERA_FUSION_DUP_LAYER_SHIFT", cfg.dup_layer_shift);
        if let Ok(value) = env::var("CALDERA_FUSION_DUP_LAYER_CONF") {
            if let Some((base, dup)) = parse_conf_pair(&value) {
                cfg.dup_layer_base_conf = base;
                cfg.dup_layer_dup_conf = dup;
            } else {
                tracing::warn!("Malformed CALDERA_FUSION_DUP_LAYER_CONF '{}', ignoring", value);
            }
        }
        cfg
    }
}

/// Shared-memory publisher settings.
#[derive(Debug, Clone)]
pub struct ShmPublisherConfig {
    /// POSIX shared-memory object name, e.g. `/caldera_worldframe`.
    pub name: String,
    pub max_width: u32,
    pub max_height: u32,
    /// Minimum time between checksum computations; zero = every frame.
    pub checksum_interval: Duration,
}

impl Default for ShmPublisherConfig {
    fn default() -> Self {
        Self {
            name: "/caldera_worldframe".to_string(),
            max_width: 640,
            max_height: 480,
            checksum_interval: Duration::ZERO,
        }
    }
}

impl ShmPublisherConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(name) = env::var("CALDERA_SHM_NAME") {
            if !name.is_empty() {
                cfg.name = name;
            }
        }
        cfg.max_width = env_i64("CALDERA_SHM_MAX_WIDTH", cfg.max_width as i64).max(1) as u32;
        cfg.max_height = env_i64("CALDERA_SHM_MAX_HEIGHT", cfg.max_height as i64).max(1) as u32;
        cfg.checksum_interval = Duration::from_millis(
            env_i64("CALDERA_SHM_CHECKSUM_INTERVAL_MS", 0).max(0) as u64,
        );
        cfg
    }
}

/// Socket publisher settings.
#[derive(Debug, Clone)]
pub struct SocketPublisherConfig {
    /// Stream endpoint, `unix:<path>`.
    pub endpoint: String,
    /// A client that cannot absorb a frame within this window is dropped.
    pub send_timeout: Duration,
    pub checksum_interval: Duration,
}

impl Default for SocketPublisherConfig {
    fn default() -> Self {
        Self {
            endpoint: "unix:/tmp/caldera_worldframe.sock".to_string(),
            send_timeout: Duration::from_millis(500),
            checksum_interval: Duration::ZERO,
        }
    }
}

impl SocketPublisherConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(endpoint) = env::var("CALDERA_SOCKET_ENDPOINT") {
            if !endpoint.is_empty() {
                cfg.endpoint = endpoint;
            }
        }
        cfg.checksum_interval = Duration::from_millis(
            env_i64("CALDERA_SHM_CHECKSUM_INTERVAL_MS", 0).max(0) as u64,
        );
        cfg
    }
}

/// Parse a plane string `a,b,c,d`.
pub fn parse_plane(value: &str) -> Option<[f32; 4]> {
    let mut out = [0.0f32; 4];
    let mut parts = value.split(',');
    for slot in out.iter_mut() {
        *slot = parts.next()?.trim().parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

fn parse_conf_pair(value: &str) -> Option<(f32, f32)> {
    let (base, dup) = value.split_once(',')?;
    let base: f32 = base.trim().parse().ok()?;
    let dup: f32 = dup.trim().parse().ok()?;
    if (0.0..=1.0).contains(&base) && (0.0..=1.0).contains(&dup) {
        Some((base, dup))
    } else {
        None
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => {
            let v = value.to_ascii_lowercase();
            v == "1" || v == "true" || v == "on" || v == "yes"
        }
        Err(_) => default,
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    match env::var(key) {
        Ok(value) => value.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Malformed {}='{}', using default {}", key, value, default);
            default
        }),
        Err(_) => default,
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    match env::var(key) {
        Ok(value) => value.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Malformed {}='{}', using default {}", key, value, default);
            default
        }),
        Err(_) => default,
    }
}

fn env_opt_f32(key: &str) -> Option<f32> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_plane(key: &str) -> Option<[f32; 4]> {
    let value = env::var(key).ok()?;
    let plane = parse_plane(&value);
    if plane.is_none() {
        tracing::warn!("Malformed {}='{}', ignoring", key, value);
    }
    plane
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plane() {
        assert_eq!(parse_plane("0,0,1,-2"), Some([0.0, 0.0, 1.0, -2.0]));
        assert_eq!(parse_plane(" 0.5, 1 , -1, 2.25 "), Some([0.5, 1.0, -1.0, 2.25]));
        assert_eq!(parse_plane("1,2,3"), None);
        assert_eq!(parse_plane("1,2,3,4,5"), None);
        assert_eq!(parse_plane("a,b,c,d"), None);
    }

    #[test]
    fn test_parse_conf_pair_clamps_range() {
        assert_eq!(parse_conf_pair("0.4,0.9"), Some((0.4, 0.9)));
        assert_eq!(parse_conf_pair("1.5,0.5"), None);
        assert_eq!(parse_conf_pair("0.5"), None);
    }

    #[test]
    fn test_kernel_names() {
        assert_eq!(SmoothingKernel::from_name("wide5"), Some(SmoothingKernel::Wide5));
        assert_eq!(SmoothingKernel::from_name("gauss"), None);
        assert_eq!(
            StrongKernel::from_name("classic_double"),
            Some(StrongKernel::ClassicDouble)
        );
    }

    #[test]
    fn test_adaptive_mode_values() {
        assert_eq!(AdaptiveMode::from_value(0), AdaptiveMode::Off);
        assert_eq!(AdaptiveMode::from_value(2), AdaptiveMode::Streak);
        assert_eq!(AdaptiveMode::from_value(7), AdaptiveMode::Off);
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = ProcessingConfig::default();
        assert_eq!(cfg.depth_scale, 0.001);
        assert_eq!(cfg.stability_min, 0.85);
        assert_eq!(cfg.variance_max, 0.01);
        assert_eq!(cfg.on_streak, 2);
        assert_eq!(cfg.off_streak, 3);
        assert_eq!(cfg.dropout_window, 60);
        assert_eq!(cfg.min_plane, [0.0, 0.0, 1.0, 0.0]);
        assert_eq!(cfg.max_plane, [0.0, 0.0, 1.0, -2.0]);

        let shm = ShmPublisherConfig::default();
        assert_eq!(shm.name, "/caldera_worldframe");
        assert_eq!((shm.max_width, shm.max_height), (640, 480));
    }
}
