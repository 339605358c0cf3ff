//! Separable NaN-aware spatial smoothing.
//!
//! Weights are accumulated only over finite neighbors actually sampled and
//! the result renormalized by their sum, so invalid cells neither spread nor
//! bias their surroundings.

/// Selectable separable kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpatialKernel {
    /// Radius-1 `[1, 2, 1]`.
    #[default]
    Classic,
    /// Radius-2 `[1, 4, 6, 4, 1]`.
    Wide5,
}

impl SpatialKernel {
    fn weights(self) -> &'static [f32] {
        match self {
            SpatialKernel::Classic => &[1.0, 2.0, 1.0],
            SpatialKernel::Wide5 => &[1.0, 4.0, 6.0, 4.0, 1.0],
        }
    }
}

/// In-place separable smoothing filter with reusable scratch storage.
#[derive(Debug, Default)]
pub struct SpatialFilter {
    scratch: Vec<f32>,
}

impl SpatialFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Smooth `data` in place. Non-finite centers are preserved; a finite
    /// center with no finite neighbor in reach is left unchanged.
    pub fn apply(&mut self, data: &mut [f32], width: u32, height: u32, kernel: SpatialKernel) {
        let w = width as usize;
        let h = height as usize;
        if w == 0 || h == 0 || data.len() != w * h {
            return;
        }
        if self.scratch.len() != data.len() {
            self.scratch.resize(data.len(), 0.0);
        }
        let weights = kernel.weights();
        let radius = (weights.len() / 2) as isize;

        // Horizontal pass: data -> scratch.
        for y in 0..h {
            let off = y * w;
            for x in 0..w {
                let c = data[off + x];
                if !c.is_finite() {
                    self.scratch[off + x] = c;
                    continue;
                }
                let mut acc = 0.0f32;
                let mut wsum = 0.0f32;
                for dx in -radius..=radius {
                    let xx = x as isize + dx;
                    if xx < 0 || xx >= w as isize {
                        continue;
                    }
                    let v = data[off + xx as usize];
                    if !v.is_finite() {
                        continue;
                    }
                    let wgt = weights[(dx + radius) as usize];
                    acc += v * wgt;
                    wsum += wgt;
                }
                self.scratch[off + x] = if wsum > 0.0 { acc / wsum } else { c };
            }
        }

        // Vertical pass: scratch -> data.
        for y in 0..h {
            for x in 0..w {
                let c = self.scratch[y * w + x];
                if !c.is_finite() {
                    data[y * w + x] = c;
                    continue;
                }
                let mut acc = 0.0f32;
                let mut wsum = 0.0f32;
                for dy in -radius..=radius {
                    let yy = y as isize + dy;
                    if yy < 0 || yy >= h as isize {
                        continue;
                    }
                    let v = self.scratch[yy as usize * w + x];
                    if !v.is_finite() {
                        continue;
                    }
                    let wgt = weights[(dy + radius) as usize];
                    acc += v * wgt;
                    wsum += wgt;
                }
                data[y * w + x] = if wsum > 0.0 { acc / wsum } else { c };
            }
        }
    }
}
