//! Reflection prediction against the Ewald sphere.
//!
//! Every Miller index inside the resolution cutoff whose reciprocal-lattice
//! point lies close enough to the sphere to carry meaningful partiality is
//! projected onto the detector. The partiality models trade fidelity for
//! cost; XSphere integrates the reflection sphere against the full spectrum.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::constants::MAX_MILLER_INDEX;
use super::crystal::Crystal;
use super::error::PredictionError;
use super::geometry::Detector;
use super::image::Image;
use super::reflection::{Reflection, RefList};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartialityModel {
    /// Partiality 1, Lorentz 1; for unknown spectra
    Unity,
    /// Spheres of radius r0 + m|q| intersected with a finite-width Ewald
    /// sphere, integrated over the spectrum components
    XSphere,
    /// Gaussian in the signed excitation error, width set by the profile
    /// radius
    EwaldOffset,
    /// Deterministic pseudo-random partiality, seeded by serial and indices
    Random,
}

/// Reflections smaller than this fraction are not worth predicting
fn min_partiality() -> f64 {
    (-0.5f64 * 1.7 * 1.7).exp()
}

/// Weighted running mean/variance accumulator (West's algorithm)
#[derive(Default)]
struct MeanVariance {
    sumw: f64,
    mean: f64,
    m2: f64,
}

impl MeanVariance {
    fn push(&mut self, x: f64, w: f64) {
        if w == 0.0 {
            return;
        }
        let sumw_new = self.sumw + w;
        let delta = x - self.mean;
        let r = delta * w / sumw_new;
        self.mean += r;
        self.m2 += self.sumw * delta * r;
        self.sumw = sumw_new;
    }
}

fn safe_khalf(xl: f64, yl: f64, zl: f64) -> f64 {
    if zl >= 0.0 {
        return f64::NAN;
    }
    -(xl * xl + yl * yl + zl * zl) / (2.0 * zl)
}

struct PartialityResult {
    partiality: f64,
    kpred: f64,
}

/// The XSphere overlap computation for one reciprocal-lattice point
fn xsphere_partiality(
    image: &Image,
    profile_radius: f64,
    xl: f64,
    yl: f64,
    zl: f64,
) -> PartialityResult {
    let r = profile_radius.abs();
    let mut part = MeanVariance::default();
    let mut spec_k = MeanVariance::default();

    for g in image.spectrum.gaussians() {
        // Project the lattice point onto this component's Ewald sphere
        let (mut x, mut y, mut z) = (xl, yl, zl + g.kcen);
        let norm = 1.0 / (x * x + y * y + z * z).sqrt();
        x *= norm;
        y *= norm;
        z *= norm;

        // Sphere width along the projection direction
        let sigma_proj = (1.0 - z) * g.sigma;

        spec_k.push(g.kcen, g.area);
        spec_k.m2 += g.area * g.sigma * g.sigma;

        let w0 = 1.0 / (r * r);
        let w1 = 1.0 / (sigma_proj * sigma_proj);

        x *= g.kcen;
        y *= g.kcen;
        z *= g.kcen;
        z -= g.kcen;

        let (kpred, exerr2) = if w0 / w1 <= f64::MIN_POSITIVE {
            // Laue limit: the spectrum is much wider than the profile
            let e = g.kcen - safe_khalf(xl, yl, zl);
            (g.kcen, e * e)
        } else if w1 / w0 <= f64::MIN_POSITIVE {
            // Monochromatic limit
            let kp = safe_khalf(xl, yl, zl);
            let e = g.kcen - kp;
            (kp, e * e)
        } else {
            let exerr2 = (x - xl) * (x - xl) + (y - yl) * (y - yl) + (z - zl) * (z - zl);
            // Weighted average of the lattice point and its sphere projection
            let zlp0 = if zl < 0.0 { zl } else { 0.0 };
            let ax = (xl * w0 + x * w1) / (w0 + w1);
            let ay = (yl * w0 + y * w1) / (w0 + w1);
            let az = (zlp0 * w0 + z * w1) / (w0 + w1);
            (safe_khalf(ax, ay, az), exerr2)
        };

        let sigma2 = r * r + sigma_proj * sigma_proj;
        let exponent = -0.5 * exerr2 / sigma2;
        let overlap = if exponent > -700.0 {
            exponent.exp() * (r * r / sigma2).sqrt()
        } else {
            0.0
        };

        part.push(kpred, g.area * overlap);
    }

    let mut partiality = part.sumw;
    // Revert the Lorentz-like factor introduced by the spectral width
    if part.sumw > 0.0 && spec_k.sumw > 0.0 {
        partiality *= ((profile_radius * profile_radius + spec_k.m2 / spec_k.sumw)
            / (profile_radius * profile_radius))
            .sqrt();
    }

    PartialityResult {
        partiality: partiality.clamp(0.0, 1.0),
        kpred: if part.sumw > 0.0 {
            part.mean
        } else {
            image.spectrum.mean_k()
        },
    }
}

fn random_partiality(serial: u64, h: i32, k: i32, l: i32) -> f64 {
    let seed = serial
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add((h as u64) ^ ((k as u64) << 21) ^ ((l as u64) << 42));
    let mut rng = StdRng::seed_from_u64(seed);
    rng.gen_range(0.0..1.0)
}

/// Evaluate one candidate lattice point; None when it misses the sphere or
/// the detector.
fn check_reflection(
    image: &Image,
    det: &Detector,
    crystal: &Crystal,
    model: PartialityModel,
    h: i32,
    k: i32,
    l: i32,
    xl: f64,
    yl: f64,
    zl: f64,
) -> Option<Reflection> {
    let r = crystal.profile_radius.abs() + crystal.mosaicity * (xl * xl + yl * yl + zl * zl).sqrt();
    let knom = 1.0 / image.lambda;

    // Signed excitation error against the nominal sphere
    let dx = xl;
    let dy = yl;
    let dz = zl + knom;
    let dcs = (dx * dx + dy * dy + dz * dz).sqrt();
    let exerr = knom - dcs;

    let (partiality, kpred) = match model {
        PartialityModel::Unity => {
            if exerr.abs() > r {
                return None;
            }
            (1.0, safe_khalf(xl, yl, zl))
        }
        PartialityModel::XSphere => {
            let pr = xsphere_partiality(image, r, xl, yl, zl);
            if pr.partiality < min_partiality() {
                return None;
            }
            (pr.partiality, pr.kpred)
        }
        PartialityModel::EwaldOffset => {
            let p = (-0.5 * (exerr / r) * (exerr / r)).exp();
            if p < min_partiality() {
                return None;
            }
            (p, safe_khalf(xl, yl, zl))
        }
        PartialityModel::Random => {
            if exerr.abs() > 2.0 * r {
                return None;
            }
            (
                random_partiality(image.serial, h, k, l).clamp(min_partiality(), 1.0),
                safe_khalf(xl, yl, zl),
            )
        }
    };

    let kpred = if kpred.is_finite() { kpred } else { knom };
    let (panel, fs, ss) = det.locate_peak(xl, yl, zl, kpred)?;

    let mut refl = Reflection::new(h, k, l);
    refl.fs = fs;
    refl.ss = ss;
    refl.panel = panel;
    refl.excitation_error = exerr;
    refl.kpred = kpred;
    refl.partiality = partiality;
    refl.lorentz = 1.0;
    Some(refl)
}

/// Largest 1/d visible anywhere on the detector, m^-1
pub fn largest_q(det: &Detector, lambda: f64) -> f64 {
    let mut best = 0.0f64;
    for p in &det.panels {
        for (fs, ss) in [
            (0.0, 0.0),
            (p.w as f64, 0.0),
            (0.0, p.h as f64),
            (p.w as f64, p.h as f64),
        ] {
            best = best.max(p.resolution(fs, ss, lambda));
        }
    }
    best
}

/// Predict every reflection of `crystal` out to `max_res` (1/d, m^-1),
/// replacing its reflection list.
pub fn predict_reflections(
    crystal: &mut Crystal,
    image: &Image,
    det: &Detector,
    model: PartialityModel,
    max_res: f64,
) -> Result<(), PredictionError> {
    if image.lambda <= 0.0 {
        return Err(PredictionError::BadWavelength);
    }
    if image.spectrum.is_empty() {
        return Err(PredictionError::EmptySpectrum);
    }
    if !crystal.cell.is_sensible() {
        return Err(PredictionError::CellError(
            super::error::CellError::NotSensible,
        ));
    }

    let mres = largest_q(det, image.lambda).min(max_res);

    let (av, bv, cv) = crystal.cell.cartesian();
    let hmax = (mres * super::matrix::modulus(&av)) as i32;
    let kmax = (mres * super::matrix::modulus(&bv)) as i32;
    let lmax = (mres * super::matrix::modulus(&cv)) as i32;
    let (hmax, kmax, lmax) = (
        hmax.min(MAX_MILLER_INDEX),
        kmax.min(MAX_MILLER_INDEX),
        lmax.min(MAX_MILLER_INDEX),
    );

    let (astar, bstar, cstar) = crystal.cell.reciprocal()?;

    let mut reflections: RefList = Vec::new();
    for h in -hmax..=hmax {
        for k in -kmax..=kmax {
            for l in -lmax..=lmax {
                if h == 0 && k == 0 && l == 0 {
                    continue;
                }
                if crystal.cell.forbidden_reflection(h, k, l) {
                    continue;
                }
                let (hf, kf, lf) = (h as f64, k as f64, l as f64);
                let xl = hf * astar[0] + kf * bstar[0] + lf * cstar[0];
                let yl = hf * astar[1] + kf * bstar[1] + lf * cstar[1];
                let zl = hf * astar[2] + kf * bstar[2] + lf * cstar[2];
                // |g| = 2 sin(theta)/lambda = 1/d
                if (xl * xl + yl * yl + zl * zl).sqrt() > mres {
                    continue;
                }

                if let Some(refl) =
                    check_reflection(image, det, crystal, model, h, k, l, xl, yl, zl)
                {
                    reflections.push(refl);
                }
            }
        }
    }

    crystal.reflections = reflections;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{LatticeType, UnitCell};
    use crate::geometry::single_panel;

    fn cubic_crystal() -> Crystal {
        let half_pi = std::f64::consts::FRAC_PI_2;
        let cell = UnitCell::from_parameters(50e-10, 50e-10, 50e-10, half_pi, half_pi, half_pi)
            .unwrap()
            .with_lattice(LatticeType::Cubic, 'P');
        let mut c = Crystal::new(cell, "test");
        c.profile_radius = 2e7;
        c
    }

    fn setup() -> (crate::geometry::Detector, Image) {
        let det = single_panel(512, 512, 0.08, 110e-6);
        let image = Image::new(&det, 1.3e-10);
        (det, image)
    }

    #[test]
    fn predictions_land_on_the_panel() {
        let (det, image) = setup();
        let mut crystal = cubic_crystal();
        predict_reflections(&mut crystal, &image, &det, PartialityModel::XSphere, 1e10).unwrap();
        assert!(!crystal.reflections.is_empty());
        for r in &crystal.reflections {
            let p = &det.panels[r.panel];
            assert!(p.contains(r.fs, r.ss), "({}, {}) off panel", r.fs, r.ss);
            assert!((0.0..=1.0).contains(&r.partiality));
            assert!(!(r.h == 0 && r.k == 0 && r.l == 0));
        }
    }

    #[test]
    fn centred_cell_skips_forbidden_reflections() {
        let (det, image) = setup();
        let mut crystal = cubic_crystal();
        crystal.cell = crystal.cell.clone().with_lattice(LatticeType::Cubic, 'I');
        predict_reflections(&mut crystal, &image, &det, PartialityModel::XSphere, 1e10).unwrap();
        for r in &crystal.reflections {
            assert_eq!((r.h + r.k + r.l).rem_euclid(2), 0);
        }
    }

    #[test]
    fn unity_model_gives_unit_partiality() {
        let (det, image) = setup();
        let mut crystal = cubic_crystal();
        predict_reflections(&mut crystal, &image, &det, PartialityModel::Unity, 1e10).unwrap();
        for r in &crystal.reflections {
            assert_eq!(r.partiality, 1.0);
            assert_eq!(r.lorentz, 1.0);
        }
    }

    #[test]
    fn random_model_is_deterministic_per_serial() {
        let (det, mut image) = setup();
        image.serial = 42;
        let mut c1 = cubic_crystal();
        predict_reflections(&mut c1, &image, &det, PartialityModel::Random, 1e10).unwrap();
        let mut c2 = cubic_crystal();
        predict_reflections(&mut c2, &image, &det, PartialityModel::Random, 1e10).unwrap();
        assert_eq!(c1.reflections.len(), c2.reflections.len());
        for (a, b) in c1.reflections.iter().zip(c2.reflections.iter()) {
            assert_eq!(a.partiality, b.partiality);
        }
        image.serial = 43;
        let mut c3 = cubic_crystal();
        predict_reflections(&mut c3, &image, &det, PartialityModel::Random, 1e10).unwrap();
        let differs = c1
            .reflections
            .iter()
            .zip(c3.reflections.iter())
            .any(|(a, b)| a.partiality != b.partiality);
        assert!(differs);
    }

    #[test]
    fn bad_wavelength_is_an_error() {
        let (det, mut image) = setup();
        image.lambda = -1.0;
        let mut crystal = cubic_crystal();
        let r = predict_reflections(&mut crystal, &image, &det, PartialityModel::Unity, 1e10);
        assert!(r.is_err());
    }
}
