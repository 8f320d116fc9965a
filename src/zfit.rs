//! Depth (z) recovery from fitted PSF width asymmetry.
//!
//! An astigmatic imaging path makes the PSF width along x and y vary
//! oppositely with depth. Given a pre-measured calibration (one 6th-degree
//! polynomial per axis mapping depth to expected width), each localization's
//! depth is the scalar `z` minimizing
//!
//! ```text
//! (√sx − √polyx(z))² + (√sy − √polyy(z))²
//! ```
//!
//! The square-root transform on the widths empirically improves z precision
//! over plain squared width error (Huang et al. '08) and is preserved
//! deliberately. Minimization is unbracketed scalar descent: a golden-ratio
//! downhill bracket search started from (0, 1), refined by Brent's method.
//!
//! After fitting, `z` is scaled by the calibration's magnification factor and
//! `d_zcalib = √objective` is recorded as a per-localization goodness-of-fit
//! distance. [`filter_z_fits`] then rejects localizations whose `d_zcalib`
//! exceeds a caller-chosen multiple of the population RMS — a self-calibrating
//! threshold that only makes sense over the full merged result set, which is
//! why the parallel path fits chunks unfiltered and filters once at the end.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, info};

use crate::calibrate::Calibration;
use crate::localize::Localization;
use crate::parallel::{self, BatchJob, PoolConfig};

// ── Polynomial evaluation ───────────────────────────────────────────────────

/// Evaluate a 6th-degree polynomial with coefficients ordered
/// highest-degree-first (Horner).
pub fn polyval(coeffs: &[f64; 7], z: f64) -> f64 {
    coeffs.iter().fold(0.0, |acc, &c| acc * z + c)
}

/// The z-fit objective for one localization.
fn zfit_objective(z: f64, sx: f64, sy: f64, cx: &[f64; 7], cy: &[f64; 7]) -> f64 {
    let wx = polyval(cx, z);
    let wy = polyval(cy, z);
    let dx = sx.sqrt() - wx.sqrt();
    let dy = sy.sqrt() - wy.sqrt();
    dx * dx + dy * dy
}

// ── Scalar minimization (bracket + Brent) ───────────────────────────────────

const GOLD: f64 = 1.618_034;
const GROW_LIMIT: f64 = 110.0;
const TINY: f64 = 1e-21;
const CGOLD: f64 = 0.381_966_0;
const BRENT_TOL: f64 = 1.48e-8;
const MIN_TOL: f64 = 1e-11;
const BRACKET_MAX_ITER: usize = 1000;
const BRENT_MAX_ITER: usize = 500;

/// Search downhill from (0, 1) for a triple `xa < xb < xc` (or reversed) with
/// `f(xb) < f(xa)` and `f(xb) < f(xc)`, expanding by the golden ratio with
/// parabolic extrapolation. Non-finite objective values compare as
/// non-improvements and stop the expansion.
fn bracket_minimum<F: Fn(f64) -> f64>(f: &F) -> (f64, f64, f64) {
    let (mut xa, mut xb) = (0.0_f64, 1.0_f64);
    let (mut fa, mut fb) = (f(xa), f(xb));
    if fa < fb {
        std::mem::swap(&mut xa, &mut xb);
        std::mem::swap(&mut fa, &mut fb);
    }
    let mut xc = xb + GOLD * (xb - xa);
    let mut fc = f(xc);

    let mut iter = 0;
    while fc < fb {
        if iter >= BRACKET_MAX_ITER {
            break;
        }
        iter += 1;

        let tmp1 = (xb - xa) * (fb - fc);
        let tmp2 = (xb - xc) * (fb - fa);
        let val = tmp2 - tmp1;
        let denom = if val.abs() < TINY {
            2.0 * TINY.copysign(val)
        } else {
            2.0 * val
        };
        let mut w = xb - ((xb - xc) * tmp2 - (xb - xa) * tmp1) / denom;
        let wlim = xb + GROW_LIMIT * (xc - xb);
        let mut fw;

        if (w - xc) * (xb - w) > 0.0 {
            // Parabolic candidate between b and c
            fw = f(w);
            if fw < fc {
                return (xb, w, xc);
            } else if fw > fb {
                return (xa, xb, w);
            }
            w = xc + GOLD * (xc - xb);
            fw = f(w);
        } else if (w - wlim) * (wlim - xc) >= 0.0 {
            w = wlim;
            fw = f(w);
        } else if (w - wlim) * (xc - w) > 0.0 {
            fw = f(w);
            if fw < fc {
                xb = xc;
                xc = w;
                w = xc + GOLD * (xc - xb);
                fb = fc;
                fc = fw;
                fw = f(w);
            }
        } else {
            w = xc + GOLD * (xc - xb);
            fw = f(w);
        }
        xa = xb;
        xb = xc;
        xc = w;
        fa = fb;
        fb = fc;
        fc = fw;
    }
    (xa, xb, xc)
}

/// Brent's method: parabolic interpolation falling back to golden-section
/// steps inside the bracket. Returns the minimizing abscissa and its
/// objective value.
fn brent_minimize<F: Fn(f64) -> f64>(f: &F, xa: f64, xb: f64, xc: f64) -> (f64, f64) {
    let (mut a, mut b) = if xa < xc { (xa, xc) } else { (xc, xa) };
    let mut x = xb;
    let mut w = xb;
    let mut v = xb;
    let mut fx = f(x);
    let mut fw = fx;
    let mut fv = fx;
    let mut deltax = 0.0_f64;
    let mut rat = 0.0_f64;

    for _ in 0..BRENT_MAX_ITER {
        let tol1 = BRENT_TOL * x.abs() + MIN_TOL;
        let tol2 = 2.0 * tol1;
        let xmid = 0.5 * (a + b);
        if (x - xmid).abs() < tol2 - 0.5 * (b - a) {
            break;
        }

        if deltax.abs() <= tol1 {
            // Golden-section step
            deltax = if x >= xmid { a - x } else { b - x };
            rat = CGOLD * deltax;
        } else {
            // Parabolic fit through (x, w, v)
            let tmp1 = (x - w) * (fx - fv);
            let mut tmp2 = (x - v) * (fx - fw);
            let mut p = (x - v) * tmp2 - (x - w) * tmp1;
            tmp2 = 2.0 * (tmp2 - tmp1);
            if tmp2 > 0.0 {
                p = -p;
            }
            tmp2 = tmp2.abs();
            let dx_temp = deltax;
            deltax = rat;
            if p > tmp2 * (a - x) && p < tmp2 * (b - x) && p.abs() < (0.5 * tmp2 * dx_temp).abs() {
                rat = p / tmp2;
                let u = x + rat;
                if (u - a) < tol2 || (b - u) < tol2 {
                    rat = if xmid - x >= 0.0 { tol1 } else { -tol1 };
                }
            } else {
                deltax = if x >= xmid { a - x } else { b - x };
                rat = CGOLD * deltax;
            }
        }

        let u = if rat.abs() > tol1 {
            x + rat
        } else if rat >= 0.0 {
            x + tol1
        } else {
            x - tol1
        };
        let fu = f(u);

        if fu > fx {
            if u < x {
                a = u;
            } else {
                b = u;
            }
            if fu <= fw || w == x {
                v = w;
                w = u;
                fv = fw;
                fw = fu;
            } else if fu <= fv || v == x || v == w {
                v = u;
                fv = fu;
            }
        } else {
            if u >= x {
                a = x;
            } else {
                b = x;
            }
            v = w;
            w = x;
            x = u;
            fv = fw;
            fw = fx;
            fx = fu;
        }
    }
    (x, fx)
}

/// Minimize the z-fit objective for one (sx, sy) pair.
/// Returns the unscaled depth and the minimized objective value.
fn minimize_z(sx: f64, sy: f64, calibration: &Calibration) -> (f64, f64) {
    let f = |z: f64| zfit_objective(z, sx, sy, &calibration.cx, &calibration.cy);
    let (xa, xb, xc) = bracket_minimum(&f);
    brent_minimize(&f, xa, xb, xc)
}

// ── Z fitting ───────────────────────────────────────────────────────────────

/// Fit a depth coordinate for each localization against the calibration.
///
/// Sets `z` (scaled by the calibration's magnification factor) and
/// `d_zcalib` (square root of the minimized objective) on every record, then
/// applies [`filter_z_fits`] with the given multiplier. Pass `filter <= 0.0`
/// to keep every record.
pub fn fit_z(
    locs: &[Localization],
    calibration: &Calibration,
    filter: f32,
) -> Vec<Localization> {
    let mut out = locs.to_vec();
    for l in &mut out {
        let (z, square_d_zcalib) = minimize_z(l.sx as f64, l.sy as f64, calibration);
        l.z = (z * calibration.magnification_factor) as f32;
        l.d_zcalib = square_d_zcalib.sqrt() as f32;
    }
    filter_z_fits(out, filter)
}

/// Reject localizations whose calibration residual exceeds `k` times the
/// population RMS of `d_zcalib`.
///
/// `k <= 0` disables filtering. The RMS ignores NaN entries, but NaN
/// residuals never satisfy the threshold and are dropped when filtering is
/// active. The threshold is population-relative, so it must be applied to
/// the full merged result set, never per-chunk.
pub fn filter_z_fits(locs: Vec<Localization>, k: f32) -> Vec<Localization> {
    if k <= 0.0 {
        return locs;
    }
    let mut sum_sq = 0.0_f64;
    let mut count = 0usize;
    for l in &locs {
        if l.d_zcalib.is_nan() {
            continue;
        }
        sum_sq += (l.d_zcalib as f64).powi(2);
        count += 1;
    }
    if count == 0 {
        return Vec::new();
    }
    let rmsd = (sum_sq / count as f64).sqrt() as f32;
    let threshold = k * rmsd;
    let before = locs.len();
    let kept: Vec<Localization> = locs
        .into_iter()
        .filter(|l| l.d_zcalib <= threshold)
        .collect();
    debug!(
        "z-fit filter (k={k}): kept {} of {} localizations (rmsd={rmsd:.4})",
        kept.len(),
        before
    );
    kept
}

// ── Parallel z fitting ──────────────────────────────────────────────────────

/// Dispatch z fitting across worker threads without blocking.
///
/// The batch is chunked at `tasks_per_worker × workers` granularity so
/// completion counters advance frequently enough for progress reporting.
/// Chunks are fit with `filter = 0`; the outlier filter is the caller's job
/// after merging (see [`fit_z_parallel`]).
pub fn dispatch_fit_z(
    locs: Vec<Localization>,
    calibration: &Calibration,
    pool: &PoolConfig,
) -> BatchJob<Localization> {
    let n = locs.len();
    let n_workers = pool.effective_workers();
    let n_chunks = (pool.tasks_per_worker * n_workers).max(1);
    let locs = Arc::new(locs);
    let calibration = *calibration;
    parallel::dispatch(n, n_chunks, n_workers, move |range| {
        fit_z(&locs[range], &calibration, 0.0)
    })
}

/// Fit z for a localization batch in parallel, blocking until complete, then
/// apply the outlier filter over the full merged population.
pub fn fit_z_parallel(
    locs: Vec<Localization>,
    calibration: &Calibration,
    filter: f32,
    pool: &PoolConfig,
) -> Result<Vec<Localization>> {
    let t0 = Instant::now();
    let n = locs.len();
    let merged = dispatch_fit_z(locs, calibration, pool).wait()?;
    info!(
        "z-fit: {} localizations in {:.1} ms",
        n,
        t0.elapsed().as_secs_f64() * 1e3
    );
    Ok(filter_z_fits(merged, filter))
}
