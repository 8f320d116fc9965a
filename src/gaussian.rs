//! Separable 2D Gaussian PSF model and residual construction.
//!
//! The model over a square spot window is built from two 1D Gaussian
//! profiles, one per axis, combined as an outer product:
//!
//! ```text
//! model[i, j] = photons * profile_y[i] * profile_x[j] + bg
//! ```
//!
//! Each 1D profile has unit area, so the total model intensity approximates
//! `photons + bg * size²`; the 2D integral is not forced to equal `photons`
//! exactly. Everything here runs in `f32` to match typical camera bit depths
//! and keep the per-iteration cost of the fitting loop low.
//!
//! [`FitScratch`] holds the coordinate grid and all intermediate buffers for
//! one spot fit, so the solver can evaluate the model thousands of times
//! without reallocating. A scratch instance belongs to exactly one fit call
//! at a time; concurrent fits each use their own.

use crate::localize::Spot;

/// 1/sqrt(2π)
const FRAC_1_SQRT_2PI: f32 = 0.398_942_3;

/// Fit parameter vector: `[x, y, photons, bg, sx, sy]`.
///
/// `x`/`y` are sub-pixel offsets from the spot center, `photons` is the total
/// integrated intensity, `bg` the uniform background level, and `sx`/`sy` the
/// Gaussian standard deviations along each axis (in pixels). The model is only
/// well-defined for `sx, sy > 0`; the solver's step control is relied on to
/// keep widths positive rather than clamping them here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Theta(pub [f32; 6]);

impl Theta {
    pub fn new(x: f32, y: f32, photons: f32, bg: f32, sx: f32, sy: f32) -> Self {
        Theta([x, y, photons, bg, sx, sy])
    }

    /// All-NaN sentinel marking a fit that was never attempted.
    pub fn nan() -> Self {
        Theta([f32::NAN; 6])
    }

    pub fn x(&self) -> f32 {
        self.0[0]
    }

    pub fn y(&self) -> f32 {
        self.0[1]
    }

    pub fn photons(&self) -> f32 {
        self.0[2]
    }

    pub fn bg(&self) -> f32 {
        self.0[3]
    }

    pub fn sx(&self) -> f32 {
        self.0[4]
    }

    pub fn sy(&self) -> f32 {
        self.0[5]
    }

    /// True if every component is finite.
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

/// Per-fit scratch buffers for model evaluation and residual construction.
///
/// Holds the 1D coordinate grid (`-size/2 ..= size/2`) and the intermediate
/// 1D profiles, the 2D model, and the flattened residual vector. Allocated
/// once per spot fit and reused across all solver iterations of that fit.
#[derive(Debug, Clone)]
pub struct FitScratch {
    size: usize,
    grid: Vec<f32>,
    model_x: Vec<f32>,
    model_y: Vec<f32>,
    model: Vec<f32>,
    residuals: Vec<f32>,
}

impl FitScratch {
    /// Create scratch buffers for spots of the given (odd) side length.
    pub fn new(size: usize) -> Self {
        let half = (size / 2) as i32;
        let grid: Vec<f32> = (-half..=half).map(|v| v as f32).collect();
        FitScratch {
            size,
            grid,
            model_x: vec![0.0; size],
            model_y: vec![0.0; size],
            model: vec![0.0; size * size],
            residuals: vec![0.0; size * size],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The most recently evaluated model image (row-major).
    pub fn model(&self) -> &[f32] {
        &self.model
    }
}

/// Sample a unit-area 1D Gaussian at each grid point.
///
/// `out[i] = norm * exp(-0.5 * ((grid[i] - mu) / sigma)²)` with
/// `norm = 1 / (sigma * sqrt(2π))`. A zero or negative `sigma` is not
/// guarded; it produces non-finite samples that propagate into the residuals
/// and are rejected by the solver's step control.
pub fn gaussian_1d(mu: f32, sigma: f32, grid: &[f32], out: &mut [f32]) {
    let norm = FRAC_1_SQRT_2PI / sigma;
    for (o, &g) in out.iter_mut().zip(grid.iter()) {
        let t = (g - mu) / sigma;
        *o = norm * (-0.5 * t * t).exp();
    }
}

/// Evaluate the separable 2D model for `theta` into `scratch.model`.
pub fn compute_model<'a>(theta: &Theta, scratch: &'a mut FitScratch) -> &'a [f32] {
    let size = scratch.size;
    gaussian_1d(theta.x(), theta.sx(), &scratch.grid, &mut scratch.model_x);
    gaussian_1d(theta.y(), theta.sy(), &scratch.grid, &mut scratch.model_y);
    let photons = theta.photons();
    let bg = theta.bg();
    for i in 0..size {
        let py = scratch.model_y[i];
        let row = &mut scratch.model[i * size..(i + 1) * size];
        for (m, &px) in row.iter_mut().zip(scratch.model_x.iter()) {
            *m = photons * py * px + bg;
        }
    }
    &scratch.model
}

/// Compute the flattened row-major residual vector `observed - model`.
///
/// Pure function of `theta` and `spot`; the scratch buffers are only written,
/// never read across calls. The spot's side length must match the scratch.
pub fn compute_residuals<'a>(
    theta: &Theta,
    spot: &Spot,
    scratch: &'a mut FitScratch,
) -> &'a [f32] {
    debug_assert_eq!(spot.size(), scratch.size);
    compute_model(theta, scratch);
    for ((r, &obs), &m) in scratch
        .residuals
        .iter_mut()
        .zip(spot.pixels().iter())
        .zip(scratch.model.iter())
    {
        *r = obs - m;
    }
    &scratch.residuals
}
