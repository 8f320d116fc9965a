//! Core data records and the localization assembler.
//!
//! A [`Spot`] is a square pixel window believed to contain one emitter. Each
//! spot carries an [`Identification`] with its acquisition frame and window
//! origin. After fitting, [`locs_from_fits`] combines the fitted parameter
//! vectors with their identifications into the science-facing
//! [`Localization`] records, sorted by frame.

use anyhow::{ensure, Result};

use crate::gaussian::Theta;

/// A square window of pixel intensities around one candidate emitter.
///
/// The side length is odd so a well-defined center pixel exists. Pixels are
/// stored row-major. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Spot {
    size: usize,
    pixels: Vec<f32>,
}

impl Spot {
    /// Create a spot from row-major pixel data.
    ///
    /// Fails if `size` is even or zero, or if `pixels.len() != size * size`.
    pub fn new(size: usize, pixels: Vec<f32>) -> Result<Self> {
        ensure!(size % 2 == 1, "Spot side length must be odd, got {size}");
        ensure!(
            pixels.len() == size * size,
            "Pixel data length ({}) does not match size² ({}x{}={})",
            pixels.len(),
            size,
            size,
            size * size
        );
        Ok(Spot { size, pixels })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.pixels[row * self.size + col]
    }

    /// Minimum pixel value; used as the initial background estimate.
    pub fn min(&self) -> f32 {
        self.pixels.iter().copied().fold(f32::INFINITY, f32::min)
    }

    /// Sum of all pixel values.
    pub fn sum(&self) -> f32 {
        self.pixels.iter().sum()
    }
}

/// Per-spot metadata produced by upstream spot detection.
///
/// Ordering corresponds 1:1 with the spot collection handed to the fitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Identification {
    /// Acquisition frame index.
    pub frame: u32,
    /// Integer pixel x coordinate of the spot window origin.
    pub x: f32,
    /// Integer pixel y coordinate of the spot window origin.
    pub y: f32,
    /// Net-gradient quality score from the detection stage.
    pub net_gradient: f32,
}

/// One localized emitter: fit results combined with frame metadata.
///
/// `z` and `d_zcalib` are NaN until the z fitter populates them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Localization {
    pub frame: u32,
    /// Sub-pixel x position in image coordinates.
    pub x: f32,
    /// Sub-pixel y position in image coordinates.
    pub y: f32,
    /// Total integrated photon count.
    pub photons: f32,
    /// PSF width along x (pixels).
    pub sx: f32,
    /// PSF width along y (pixels).
    pub sy: f32,
    /// Uniform background level.
    pub bg: f32,
    /// Localization precision along x.
    pub lpx: f32,
    /// Localization precision along y.
    pub lpy: f32,
    /// Net-gradient quality score carried over from detection.
    pub net_gradient: f32,
    /// Depth coordinate; NaN until z fitting.
    pub z: f32,
    /// Calibration-curve residual distance; NaN until z fitting.
    pub d_zcalib: f32,
}

/// Assemble localization records from fitted parameter vectors.
///
/// For each spot, the fitted sub-pixel offset is added to the spot window
/// origin and shifted by half the window size so positions land in image
/// coordinates. Localization precision is `width / sqrt(photons)` per axis;
/// note that `lpx` is derived from `sy` and `lpy` from `sx` — downstream
/// consumers rely on this pairing, do not "fix" it.
///
/// The result is sorted by frame with a stable sort, so localizations within
/// a frame keep their relative input order.
pub fn locs_from_fits(
    identifications: &[Identification],
    theta: &[Theta],
    box_size: usize,
) -> Result<Vec<Localization>> {
    ensure!(
        identifications.len() == theta.len(),
        "Identification count ({}) does not match fit count ({})",
        identifications.len(),
        theta.len()
    );
    ensure!(
        box_size % 2 == 1,
        "Spot window size must be odd, got {box_size}"
    );

    let box_offset = (box_size / 2) as f32;
    let mut locs: Vec<Localization> = identifications
        .iter()
        .zip(theta.iter())
        .map(|(id, t)| {
            let sqrt_photons = t.photons().sqrt();
            Localization {
                frame: id.frame,
                x: t.x() + id.x - box_offset,
                y: t.y() + id.y - box_offset,
                photons: t.photons(),
                sx: t.sx(),
                sy: t.sy(),
                bg: t.bg(),
                lpx: t.sy() / sqrt_photons,
                lpy: t.sx() / sqrt_photons,
                net_gradient: id.net_gradient,
                z: f32::NAN,
                d_zcalib: f32::NAN,
            }
        })
        .collect();

    // Stable sort: per-frame grouping matters downstream, relative order
    // within a frame is preserved from the input.
    locs.sort_by_key(|l| l.frame);
    Ok(locs)
}
