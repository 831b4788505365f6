//! Post-indexing refinement of the prediction parameters.
//!
//! A Nelder-Mead simplex walks four parameters: two small rotations of the
//! cell about the lab x and y axes, the profile radius, and the wavelength.
//! The residual is peak-to-prediction disagreement, with a scaled
//! log-intensity term added when a reference reflection list is available.
//! The lattice ambiguity operators are each tried and the best reindexing
//! kept. Hard clamps reject obviously-bad steps before they are evaluated.

use super::cell::LatticeType;
use super::constants::{MAX_PROFILE_RADIUS, MAX_REFINE_ROTATION};
use super::crystal::Crystal;
use super::error::RefineError;
use super::geometry::Detector;
use super::image::Image;
use super::matrix::Mat3;
use super::peaks::PeakList;
use super::predict::{predict_reflections, PartialityModel};
use super::spectrum::Spectrum;

/// Reference intensities for the log-intensity residual term
pub trait ReferenceIntensities {
    fn lookup(&self, h: i32, k: i32, l: i32) -> Option<f64>;
}

/// Pixel radius within which a prediction explains an observed peak
const MATCH_RADIUS: f64 = 4.0;

/// Reindexing operators of the lattice ambiguity group. Identity is always
/// present; lattices with a merging ambiguity add their twin operator.
pub fn ambiguity_operators(lattice: LatticeType) -> Vec<Mat3> {
    let ident: Mat3 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
    let mut ops = vec![ident];
    match lattice {
        LatticeType::Hexagonal | LatticeType::Rhombohedral => {
            // (h, k, l) -> (k, h, -l)
            ops.push([[0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]]);
        }
        LatticeType::Tetragonal => {
            // (h, k, l) -> (k, h, -l)
            ops.push([[0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]]);
        }
        _ => {}
    }
    ops
}

/// Estimate the profile radius from the excitation errors of predictions
/// which coincide with observed peaks. Falls back to leaving the radius
/// untouched when too few matches exist.
pub fn refine_radius(
    crystal: &mut Crystal,
    image: &Image,
    det: &Detector,
    peaks: &PeakList,
    model: PartialityModel,
    max_res: f64,
) -> Result<(), RefineError> {
    // Inflate the radius for the trial prediction so near-misses are seen
    let saved = crystal.profile_radius;
    crystal.profile_radius = saved * 10.0;
    predict_reflections(crystal, image, det, model, max_res)?;
    crystal.profile_radius = saved;

    let mut matched_errors: Vec<f64> = Vec::new();
    for peak in peaks {
        let best = crystal
            .reflections
            .iter()
            .filter(|r| r.panel == peak.panel)
            .map(|r| {
                let d = ((r.fs - peak.fs).powi(2) + (r.ss - peak.ss).powi(2)).sqrt();
                (d, r.excitation_error.abs())
            })
            .min_by(|a, b| a.0.total_cmp(&b.0));
        if let Some((d, exerr)) = best {
            if d <= MATCH_RADIUS {
                matched_errors.push(exerr);
            }
        }
    }

    if matched_errors.len() < 10 {
        return Err(RefineError::TooFewReflections);
    }
    let mid = matched_errors.len() / 2;
    matched_errors.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    let estimate = (1.5 * matched_errors[mid]).clamp(1e5, MAX_PROFILE_RADIUS);
    crystal.profile_radius = estimate;
    Ok(())
}

struct ResidualContext<'a> {
    base: &'a Crystal,
    image: &'a Image,
    det: &'a Detector,
    peaks: &'a PeakList,
    reference: Option<&'a dyn ReferenceIntensities>,
    model: PartialityModel,
    max_res: f64,
}

/// Residual of one parameter vector [rot_x, rot_y, radius, lambda]
fn residual(ctx: &ResidualContext, params: &[f64; 4]) -> f64 {
    let [rx, ry, radius, lambda] = *params;

    // Hard clamps reject obviously-bad steps
    if radius.abs() > MAX_PROFILE_RADIUS || radius <= 0.0 {
        return f64::INFINITY;
    }
    if lambda <= 0.0 {
        return f64::INFINITY;
    }
    if (rx * rx + ry * ry).sqrt() > MAX_REFINE_ROTATION {
        return f64::INFINITY;
    }

    let mut trial = ctx.base.clone();
    trial.cell = trial.cell.rotated([1.0, 0.0, 0.0], rx).rotated([0.0, 1.0, 0.0], ry);
    trial.profile_radius = radius;

    let mut trial_image = ctx.image.clone();
    trial_image.lambda = lambda;
    trial_image.spectrum = Spectrum::monochromatic(lambda, ctx.det.beam.bandwidth);

    if predict_reflections(&mut trial, &trial_image, ctx.det, ctx.model, ctx.max_res).is_err() {
        return f64::INFINITY;
    }
    if trial.reflections.is_empty() {
        return f64::INFINITY;
    }

    // Position term: distance from each observed peak to the nearest
    // prediction, capped so unexplained peaks cost a constant
    let mut total = 0.0;
    let mut n_matched = 0usize;
    let mut log_offsets: Vec<f64> = Vec::new();
    for peak in ctx.peaks {
        let mut best: Option<(f64, &super::reflection::Reflection)> = None;
        for r in trial.reflections.iter().filter(|r| r.panel == peak.panel) {
            let d = ((r.fs - peak.fs).powi(2) + (r.ss - peak.ss).powi(2)).sqrt();
            if best.as_ref().map(|(bd, _)| d < *bd).unwrap_or(true) {
                best = Some((d, r));
            }
        }
        match best {
            Some((d, r)) if d <= MATCH_RADIUS => {
                total += d * d;
                n_matched += 1;
                if let Some(refs) = ctx.reference {
                    if let Some(i_ref) = refs.lookup(r.h, r.k, r.l) {
                        let pred = r.partiality * i_ref;
                        if peak.intensity > 0.0 && pred > 0.0 {
                            log_offsets.push(peak.intensity.ln() - pred.ln());
                        }
                    }
                }
            }
            _ => total += MATCH_RADIUS * MATCH_RADIUS,
        }
    }

    if n_matched == 0 {
        return f64::INFINITY;
    }

    // Scaled log-intensity disagreement: the overall scale factor is free,
    // so the mean log offset is removed before squaring
    if log_offsets.len() >= 3 {
        let mean: f64 = log_offsets.iter().sum::<f64>() / log_offsets.len() as f64;
        let intensity_term: f64 = log_offsets
            .iter()
            .map(|d| (d - mean) * (d - mean))
            .sum::<f64>()
            / log_offsets.len() as f64;
        total += intensity_term * n_matched as f64;
    }

    total / n_matched as f64
}

/// Downhill simplex over the four prediction parameters
fn simplex_minimize<F: Fn(&[f64; 4]) -> f64>(
    f: F,
    start: [f64; 4],
    steps: [f64; 4],
    max_iter: usize,
) -> ([f64; 4], f64) {
    const ALPHA: f64 = 1.0;
    const GAMMA: f64 = 2.0;
    const RHO: f64 = 0.5;
    const SIGMA: f64 = 0.5;

    let mut simplex: Vec<([f64; 4], f64)> = Vec::with_capacity(5);
    simplex.push((start, f(&start)));
    for i in 0..4 {
        let mut v = start;
        v[i] += steps[i];
        simplex.push((v, f(&v)));
    }

    for _ in 0..max_iter {
        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        let best = simplex[0].1;
        let worst = simplex[4].1;
        if worst.is_finite() && (worst - best).abs() < 1e-12 * (1.0 + best.abs()) {
            break;
        }

        // Centroid of all but the worst
        let mut centroid = [0.0; 4];
        for (v, _) in simplex.iter().take(4) {
            for i in 0..4 {
                centroid[i] += v[i] / 4.0;
            }
        }

        let reflect = |c: &[f64; 4], w: &[f64; 4], coeff: f64| {
            let mut out = [0.0; 4];
            for i in 0..4 {
                out[i] = c[i] + coeff * (c[i] - w[i]);
            }
            out
        };

        let worst_v = simplex[4].0;
        let xr = reflect(&centroid, &worst_v, ALPHA);
        let fr = f(&xr);

        if fr < simplex[0].1 {
            let xe = reflect(&centroid, &worst_v, GAMMA);
            let fe = f(&xe);
            simplex[4] = if fe < fr { (xe, fe) } else { (xr, fr) };
        } else if fr < simplex[3].1 {
            simplex[4] = (xr, fr);
        } else {
            let xc = reflect(&centroid, &worst_v, -RHO);
            let fc = f(&xc);
            if fc < simplex[4].1 {
                simplex[4] = (xc, fc);
            } else {
                // Shrink towards the best vertex
                let best_v = simplex[0].0;
                for entry in simplex.iter_mut().skip(1) {
                    for i in 0..4 {
                        entry.0[i] = best_v[i] + SIGMA * (entry.0[i] - best_v[i]);
                    }
                    entry.1 = f(&entry.0);
                }
            }
        }
    }

    simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
    simplex[0]
}

/// Outcome of a full prediction refinement
pub struct RefineResult {
    pub lambda: f64,
    pub residual: f64,
}

/// Refine the crystal's orientation, profile radius and the wavelength, and
/// try each lattice-ambiguity reindexing, keeping the best. On success the
/// crystal's cell and radius are updated and the refined wavelength is
/// returned for the caller to apply to the image.
pub fn refine_prediction(
    crystal: &mut Crystal,
    image: &Image,
    det: &Detector,
    peaks: &PeakList,
    reference: Option<&dyn ReferenceIntensities>,
    model: PartialityModel,
    max_res: f64,
) -> Result<RefineResult, RefineError> {
    if peaks.is_empty() {
        return Err(RefineError::TooFewReflections);
    }

    let mut best: Option<(f64, Crystal, f64)> = None;
    for op in ambiguity_operators(crystal.cell.lattice_type()) {
        let reindexed = crystal
            .cell
            .reindexed(&op)
            .map_err(|_| RefineError::NonFinite)?;
        let mut base = crystal.clone();
        base.cell = reindexed;

        let ctx = ResidualContext {
            base: &base,
            image,
            det,
            peaks,
            reference,
            model,
            max_res,
        };

        let start = [0.0, 0.0, base.profile_radius, image.lambda];
        let steps = [
            2.0e-4,
            2.0e-4,
            0.2 * base.profile_radius,
            1.0e-4 * image.lambda,
        ];
        let (params, res) = simplex_minimize(|p| residual(&ctx, p), start, steps, 120);

        if !res.is_finite() {
            continue;
        }
        match &best {
            Some((b, _, _)) if *b <= res => {}
            _ => {
                let [rx, ry, radius, lambda] = params;
                let mut refined = base.clone();
                refined.cell = refined
                    .cell
                    .rotated([1.0, 0.0, 0.0], rx)
                    .rotated([0.0, 1.0, 0.0], ry);
                refined.profile_radius = radius;
                best = Some((res, refined, lambda));
            }
        }
    }

    let (res, refined, lambda) = best.ok_or(RefineError::NonFinite)?;
    crystal.cell = refined.cell;
    crystal.profile_radius = refined.profile_radius;
    Ok(RefineResult {
        lambda,
        residual: res,
    })
}
