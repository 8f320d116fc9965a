//! Calibration curve building from a controlled axial scan.
//!
//! A calibration dataset is a localization set recorded while stepping the
//! stage by a fixed increment per frame, so every frame maps to a known
//! depth. The builder:
//!
//! 1. Computes per-frame mean and variance of the fitted widths sx and sy.
//! 2. Drops localizations whose squared deviation from their frame's mean
//!    width exceeds that frame's variance (a light per-frame outlier gate).
//! 3. Recomputes the per-frame mean widths on the filtered set.
//! 4. Fits a 6th-degree polynomial (ordinary least squares on a Vandermonde
//!    basis) to the (depth, mean width) pairs for each axis independently.
//!
//! Depth values are centered so the scan spans `[-range/2, +range/2]`. The
//! resulting [`Calibration`] is the explicit value every z-fit consumes —
//! there is no ambient calibration state. As a self-consistency check the
//! scan dataset is immediately re-fit through the z fitter and returned with
//! depths divided by the magnification factor, separating the physical
//! calibration-space coordinate from the reported, instrument-corrected one.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{ensure, Context, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::localize::Localization;
use crate::zfit;

/// Depth calibration: one width-vs-depth polynomial per axis plus the
/// instrument magnification factor.
///
/// Coefficients are ordered highest degree first. The serialized field names
/// follow the interchange convention used by external configuration stores,
/// typically under a `"3D Calibration"` key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// sx(z) polynomial coefficients, highest degree first.
    #[serde(rename = "X Coefficients")]
    pub cx: [f64; 7],
    /// sy(z) polynomial coefficients, highest degree first.
    #[serde(rename = "Y Coefficients")]
    pub cy: [f64; 7],
    /// Scale between calibration-space depth and reported depth.
    #[serde(rename = "Magnification Factor")]
    pub magnification_factor: f64,
}

impl Calibration {
    /// Write the calibration record as JSON.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref()).with_context(|| {
            format!("Failed to create calibration file: {}", path.as_ref().display())
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .context("Failed to serialize calibration")?;
        Ok(())
    }

    /// Read a calibration record previously written by [`save_to_file`].
    ///
    /// [`save_to_file`]: Calibration::save_to_file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref()).with_context(|| {
            format!("Failed to open calibration file: {}", path.as_ref().display())
        })?;
        let calibration = serde_json::from_reader(BufReader::new(file))
            .context("Failed to parse calibration")?;
        Ok(calibration)
    }
}

/// Output of [`calibrate_z`]: the fitted calibration plus the scan dataset
/// re-fit through the z fitter as a self-consistency check.
#[derive(Debug, Clone)]
pub struct CalibrationResult {
    pub calibration: Calibration,
    /// The gated scan localizations with z fitted against the new
    /// calibration, reported in instrument-corrected coordinates.
    pub locs: Vec<Localization>,
}

/// Build a depth calibration from an axial-scan localization set.
///
/// `n_frames` is the number of stage positions in the scan and `step` the
/// stage increment per frame; frame `f` corresponds to depth
/// `f * step - (n_frames - 1) * step / 2`.
pub fn calibrate_z(
    locs: &[Localization],
    n_frames: u32,
    step: f64,
    magnification_factor: f64,
) -> Result<CalibrationResult> {
    ensure!(
        n_frames >= 7,
        "A 6th-degree calibration fit needs at least 7 scan frames, got {n_frames}"
    );
    ensure!(step > 0.0, "Scan step must be positive, got {step}");
    ensure!(!locs.is_empty(), "Calibration dataset is empty");
    ensure!(
        locs.iter().all(|l| l.frame < n_frames),
        "Localization frame index exceeds scan length ({n_frames} frames)"
    );

    let range = (n_frames - 1) as f64 * step;
    let z_range: Vec<f64> = (0..n_frames)
        .map(|f| f as f64 * step - range / 2.0)
        .collect();

    // Per-frame width statistics on the raw dataset
    let (mean_sx, var_sx) = frame_stats(locs, n_frames, |l| l.sx);
    let (mean_sy, var_sy) = frame_stats(locs, n_frames, |l| l.sy);

    // Per-frame outlier gate: keep localizations within one frame-variance
    // of their frame's mean width on both axes.
    let kept: Vec<Localization> = locs
        .iter()
        .copied()
        .filter(|l| {
            let f = l.frame as usize;
            let dx = l.sx as f64 - mean_sx[f];
            let dy = l.sy as f64 - mean_sy[f];
            dx * dx < var_sx[f] && dy * dy < var_sy[f]
        })
        .collect();
    debug!(
        "Width gate kept {} of {} scan localizations",
        kept.len(),
        locs.len()
    );
    ensure!(!kept.is_empty(), "No localizations survived the width gate");

    // The calibration curves are fit to per-frame means of the gated set.
    // Frames left empty (in the scan or by the gate) have NaN means and are
    // skipped, so a sparse scan still calibrates from the frames it has.
    let (mean_sx, _) = frame_stats(&kept, n_frames, |l| l.sx);
    let (mean_sy, _) = frame_stats(&kept, n_frames, |l| l.sy);
    let mut zs = Vec::with_capacity(z_range.len());
    let mut mxs = Vec::with_capacity(z_range.len());
    let mut mys = Vec::with_capacity(z_range.len());
    for f in 0..n_frames as usize {
        if mean_sx[f].is_finite() && mean_sy[f].is_finite() {
            zs.push(z_range[f]);
            mxs.push(mean_sx[f]);
            mys.push(mean_sy[f]);
        }
    }
    ensure!(
        zs.len() >= 7,
        "A 6th-degree calibration fit needs at least 7 populated scan frames, got {}",
        zs.len()
    );

    let cx = polyfit6(&zs, &mxs)?;
    let cy = polyfit6(&zs, &mys)?;
    let calibration = Calibration {
        cx,
        cy,
        magnification_factor,
    };
    info!(
        "Calibrated z over {} frames (range ±{:.1}): cx={:?}, cy={:?}",
        n_frames,
        range / 2.0,
        cx,
        cy
    );

    // Self-consistency: re-fit the scan through the z fitter and report in
    // instrument-corrected coordinates.
    let mut fitted = zfit::fit_z(&kept, &calibration, 2.0);
    for l in &mut fitted {
        l.z /= magnification_factor as f32;
    }

    Ok(CalibrationResult {
        calibration,
        locs: fitted,
    })
}

/// Per-frame mean and (population) variance of a width field.
/// Frames with no localizations yield NaN entries.
fn frame_stats(
    locs: &[Localization],
    n_frames: u32,
    field: impl Fn(&Localization) -> f32,
) -> (Vec<f64>, Vec<f64>) {
    let n = n_frames as usize;
    let mut count = vec![0usize; n];
    let mut sum = vec![0.0_f64; n];
    let mut sum_sq = vec![0.0_f64; n];
    for l in locs {
        let f = l.frame as usize;
        let v = field(l) as f64;
        count[f] += 1;
        sum[f] += v;
        sum_sq[f] += v * v;
    }
    let mut mean = vec![f64::NAN; n];
    let mut var = vec![f64::NAN; n];
    for f in 0..n {
        if count[f] > 0 {
            let m = sum[f] / count[f] as f64;
            mean[f] = m;
            var[f] = sum_sq[f] / count[f] as f64 - m * m;
        }
    }
    (mean, var)
}

/// Ordinary least-squares fit of a 6th-degree polynomial on a Vandermonde
/// basis, solved by SVD. Returns coefficients highest degree first.
fn polyfit6(xs: &[f64], ys: &[f64]) -> Result<[f64; 7]> {
    ensure!(
        xs.len() == ys.len() && xs.len() >= 7,
        "Polynomial fit needs at least 7 points, got {}",
        xs.len()
    );

    let n = xs.len();
    let mut a = DMatrix::<f64>::zeros(n, 7);
    for (i, &x) in xs.iter().enumerate() {
        for j in 0..7 {
            a[(i, j)] = x.powi(6 - j as i32);
        }
    }
    let b = DVector::from_column_slice(ys);

    let svd = a.svd(true, true);
    let coeffs = svd
        .solve(&b, 1e-12)
        .map_err(|e| anyhow::anyhow!("Polynomial fit failed: {e}"))?;

    let mut out = [0.0_f64; 7];
    for j in 0..7 {
        out[j] = coeffs[j];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zfit::polyval;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn test_polyfit6_recovers_known_polynomial() {
        // 0.3 z³ - 0.5 z + 2
        let truth = [0.0, 0.0, 0.0, 0.3, 0.0, -0.5, 2.0];
        let xs: Vec<f64> = (0..15).map(|i| -1.4 + 0.2 * i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|&x| polyval(&truth, x)).collect();
        let coeffs = polyfit6(&xs, &ys).unwrap();
        for (c, t) in coeffs.iter().zip(truth.iter()) {
            assert!((c - t).abs() < 1e-8, "coeffs = {coeffs:?}");
        }
    }

    #[test]
    fn test_frame_stats() {
        let mut locs = Vec::new();
        for &sx in &[1.0_f32, 2.0, 3.0] {
            let mut l = base_loc(0, sx, 1.0);
            l.sx = sx;
            locs.push(l);
        }
        let (mean, var) = frame_stats(&locs, 2, |l| l.sx);
        assert!((mean[0] - 2.0).abs() < 1e-12);
        assert!((var[0] - 2.0 / 3.0).abs() < 1e-12);
        assert!(mean[1].is_nan(), "empty frame must be NaN");
    }

    fn base_loc(frame: u32, sx: f32, sy: f32) -> Localization {
        Localization {
            frame,
            x: 0.0,
            y: 0.0,
            photons: 1000.0,
            sx,
            sy,
            bg: 0.0,
            lpx: 0.0,
            lpy: 0.0,
            net_gradient: 0.0,
            z: f32::NAN,
            d_zcalib: f32::NAN,
        }
    }

    /// Synthetic astigmatic scan: widths follow known curves plus jitter.
    fn synthetic_scan(
        cx: &[f64; 7],
        cy: &[f64; 7],
        n_frames: u32,
        step: f64,
        per_frame: usize,
        noise: f64,
    ) -> Vec<Localization> {
        let range = (n_frames - 1) as f64 * step;
        let mut rng = StdRng::seed_from_u64(7);
        let jitter = Normal::new(0.0, noise).unwrap();
        let mut locs = Vec::new();
        for f in 0..n_frames {
            let z = f as f64 * step - range / 2.0;
            for _ in 0..per_frame {
                locs.push(base_loc(
                    f,
                    (polyval(cx, z) + jitter.sample(&mut rng)) as f32,
                    (polyval(cy, z) + jitter.sample(&mut rng)) as f32,
                ));
            }
        }
        locs
    }

    #[test]
    fn test_calibrate_z_recovers_curves() {
        let cx = [0.0, 0.0, 0.0, 0.0, 0.6, 0.4, 1.3];
        let cy = [0.0, 0.0, 0.0, 0.0, 0.6, -0.4, 1.3];
        let n_frames = 21;
        let step = 0.1;
        let locs = synthetic_scan(&cx, &cy, n_frames, step, 40, 0.01);

        let result = calibrate_z(&locs, n_frames, step, 1.0).unwrap();

        // The fitted curves should closely track the truth across the scan
        let range = (n_frames - 1) as f64 * step;
        for i in 0..=20 {
            let z = -range / 2.0 + range * i as f64 / 20.0;
            let ex = (polyval(&result.calibration.cx, z) - polyval(&cx, z)).abs();
            let ey = (polyval(&result.calibration.cy, z) - polyval(&cy, z)).abs();
            assert!(ex < 0.02, "cx deviates by {ex} at z={z}");
            assert!(ey < 0.02, "cy deviates by {ey} at z={z}");
        }

        // Self-consistency refit: fitted z tracks the known stage depth
        assert!(!result.locs.is_empty());
        let mut errs: Vec<f64> = result
            .locs
            .iter()
            .map(|l| {
                let true_z = l.frame as f64 * step - range / 2.0;
                (l.z as f64 - true_z).abs()
            })
            .collect();
        errs.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let median = errs[errs.len() / 2];
        assert!(median < 0.05, "median |z error| = {median}");
    }

    #[test]
    fn test_calibrate_z_tolerates_empty_frames() {
        let cx = [0.0, 0.0, 0.0, 0.0, 0.6, 0.4, 1.3];
        let cy = [0.0, 0.0, 0.0, 0.0, 0.6, -0.4, 1.3];
        let n_frames = 17;
        let step = 0.1;
        let mut locs = synthetic_scan(&cx, &cy, n_frames, step, 40, 0.01);
        // Two stage positions yielded no localizations at all
        locs.retain(|l| l.frame != 3 && l.frame != 11);

        let result = calibrate_z(&locs, n_frames, step, 1.0).unwrap();
        let range = (n_frames - 1) as f64 * step;
        for i in 0..=20 {
            let z = -range / 2.0 + range * i as f64 / 20.0;
            let ex = (polyval(&result.calibration.cx, z) - polyval(&cx, z)).abs();
            assert!(ex < 0.03, "cx deviates by {ex} at z={z}");
        }

        // Fewer than 7 populated frames is still an error
        let sparse: Vec<Localization> = locs.iter().copied().filter(|l| l.frame < 6).collect();
        assert!(calibrate_z(&sparse, n_frames, step, 1.0).is_err());
    }

    #[test]
    fn test_calibrate_z_magnification_divides_reported_z() {
        let cx = [0.0, 0.0, 0.0, 0.0, 0.6, 0.4, 1.3];
        let cy = [0.0, 0.0, 0.0, 0.0, 0.6, -0.4, 1.3];
        let n_frames = 15;
        let step = 0.1;
        let locs = synthetic_scan(&cx, &cy, n_frames, step, 40, 0.01);

        let plain = calibrate_z(&locs, n_frames, step, 1.0).unwrap();
        let scaled = calibrate_z(&locs, n_frames, step, 2.0).unwrap();
        assert_eq!(scaled.calibration.magnification_factor, 2.0);
        // Reported (instrument-corrected) depths are magnification-independent
        assert_eq!(plain.locs.len(), scaled.locs.len());
        for (a, b) in plain.locs.iter().zip(scaled.locs.iter()) {
            assert!((a.z - b.z).abs() < 1e-4, "{} vs {}", a.z, b.z);
        }
    }

    #[test]
    fn test_calibrate_z_input_validation() {
        let locs = vec![base_loc(0, 1.0, 1.0)];
        assert!(calibrate_z(&locs, 5, 0.1, 1.0).is_err(), "too few frames");
        assert!(calibrate_z(&[], 15, 0.1, 1.0).is_err(), "empty dataset");
        assert!(
            calibrate_z(&locs, 15, -0.1, 1.0).is_err(),
            "negative step"
        );
        let bad = vec![base_loc(20, 1.0, 1.0)];
        assert!(
            calibrate_z(&bad, 15, 0.1, 1.0).is_err(),
            "frame out of range"
        );
    }

    #[test]
    fn test_calibration_save_load_roundtrip() {
        // Coefficients with full f64 precision must survive the JSON trip
        // bit-for-bit; fitted coefficients are rarely round decimals.
        let calibration = Calibration {
            cx: [0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.981_686_485_279_593_9],
            cy: [6.0, 5.0, 4.0, 3.0, 2.0, 1.0, 1.0 / 3.0],
            magnification_factor: 0.79,
        };
        let dir = std::env::temp_dir();
        let path = dir.join("smlocalize_test_calibration.json");
        calibration.save_to_file(&path).unwrap();
        let loaded = Calibration::load_from_file(&path).unwrap();
        assert_eq!(calibration, loaded);
        let _ = std::fs::remove_file(&path);
    }
}
