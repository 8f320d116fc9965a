//! # smlocalize
//!
//! Sub-pixel localization of point-like emitters in single-molecule
//! microscopy data, with astigmatism-based depth recovery.
//!
//! Given square pixel windows ("spots") each believed to contain one
//! emitter, `smlocalize` fits a separable 2D Gaussian PSF model per spot to
//! recover sub-pixel position, photon count, background, and per-axis PSF
//! widths. A second stage converts the fitted width asymmetry into a depth
//! coordinate using a polynomial calibration curve measured from an axial
//! scan, turning 2D image data into 3D localizations.
//!
//! ## Features
//!
//! - **Per-spot Gaussian fitting** — finite-difference Levenberg–Marquardt
//!   with deliberately loose tolerances, tuned for millions of fits
//! - **Order-preserving parallelism** — batches are chunked across a worker
//!   pool; merged results always match input order, and non-blocking job
//!   handles expose progress counters
//! - **Depth calibration** — robust per-frame width statistics and
//!   6th-degree polynomial curves fitted from a stage scan
//! - **Z fitting** — per-localization scalar minimization on a
//!   square-root-transformed width objective, with population-relative
//!   RMSD outlier rejection
//!
//! ## Example
//!
//! ```
//! use smlocalize::{
//!     fit_spots, locs_from_fits, FitScratch, Identification, LmConfig, Spot, Theta,
//! };
//!
//! // Synthesize one noiseless spot from known parameters
//! let truth = Theta::new(0.3, -0.2, 1000.0, 5.0, 1.1, 1.3);
//! let mut scratch = FitScratch::new(7);
//! let pixels = smlocalize::gaussian::compute_model(&truth, &mut scratch).to_vec();
//! let spot = Spot::new(7, pixels).unwrap();
//!
//! // Fit the batch and assemble localization records
//! let theta = fit_spots(std::slice::from_ref(&spot), &LmConfig::default());
//! let ids = [Identification {
//!     frame: 0,
//!     x: 100.0,
//!     y: 200.0,
//!     net_gradient: 50.0,
//! }];
//! let locs = locs_from_fits(&ids, &theta, 7).unwrap();
//! assert_eq!(locs.len(), 1);
//! ```
//!
//! ## Pipeline overview
//!
//! 1. **Spot fitting** — [`fit_spots`] (or [`fit_spots_parallel`]) turns each
//!    spot into a 6-parameter vector `[x, y, photons, bg, sx, sy]`
//! 2. **Assembly** — [`locs_from_fits`] merges fit results with per-spot
//!    [`Identification`] metadata into frame-sorted [`Localization`] records
//! 3. **Calibration** — [`calibrate_z`] builds width-vs-depth polynomials
//!    from an axial scan; the [`Calibration`] persists as a small JSON record
//! 4. **Z fitting** — [`fit_z`] (or [`fit_z_parallel`]) recovers a depth per
//!    localization and tags it with a calibration residual; [`filter_z_fits`]
//!    rejects outliers relative to the population RMS

pub mod calibrate;
pub mod fit;
pub mod gaussian;
pub mod localize;
pub mod parallel;
pub mod zfit;

pub use calibrate::{calibrate_z, Calibration, CalibrationResult};
pub use fit::{dispatch_fit_spots, fit_spot, fit_spots, fit_spots_parallel, LmConfig, SpotFit};
pub use gaussian::{FitScratch, Theta};
pub use localize::{locs_from_fits, Identification, Localization, Spot};
pub use parallel::{BatchJob, PoolConfig};
pub use zfit::{dispatch_fit_z, filter_z_fits, fit_z, fit_z_parallel};
