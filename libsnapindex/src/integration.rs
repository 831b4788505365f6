//! Reflection intensity measurement.
//!
//! Ring integration sums a signal disk around each predicted position after
//! subtracting a planar background fitted to a surrounding annulus. Profile
//! fitting runs a second pass which fits an empirical spot shape, shared by
//! the strong reflections of the crystal, to each signal region.

use super::config::IntMethod;
use super::constants::MIN_BACKGROUND_PIXELS;
use super::crystal::Crystal;
use super::geometry::Detector;
use super::image::Image;
use super::matrix::solve3;
use super::reflection::Reflection;

pub struct IntegrationParams {
    pub method: IntMethod,
    pub radii: [f64; 3],
    pub integrate_saturated: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IntegrationSummary {
    pub n_measured: usize,
    pub n_saturated: usize,
    pub n_edge_rejected: usize,
    pub n_bad_background: usize,
}

/// The fitted local background plane: value + gradients along fs and ss
#[derive(Debug, Clone, Copy)]
struct BackgroundPlane {
    p0: f64,
    pfs: f64,
    pss: f64,
    variance: f64,
    n_pixels: usize,
}

fn fit_background_plane(
    image: &Image,
    panel: usize,
    cfs: f64,
    css: f64,
    radii: &[f64; 3],
) -> Option<BackgroundPlane> {
    let [_, r_mid, r_out] = *radii;
    let pdata = &image.panels[panel];

    // Normal equations for v ~ p0 + pfs*dfs + pss*dss
    let mut ata = [[0.0f64; 3]; 3];
    let mut atb = [0.0f64; 3];
    let mut pixels: Vec<(f64, f64, f64)> = Vec::new();

    for iss in (css - r_out).floor() as i64..=(css + r_out).ceil() as i64 {
        for ifs in (cfs - r_out).floor() as i64..=(cfs + r_out).ceil() as i64 {
            let (ufs, uss) = (ifs as usize, iss as usize);
            if pdata.bad[[uss, ufs]] {
                continue;
            }
            let dfs = ifs as f64 + 0.5 - cfs;
            let dss = iss as f64 + 0.5 - css;
            let r = (dfs * dfs + dss * dss).sqrt();
            if r <= r_mid || r > r_out {
                continue;
            }
            let v = pdata.data[[uss, ufs]] as f64;
            let row = [1.0, dfs, dss];
            for i in 0..3 {
                for j in 0..3 {
                    ata[i][j] += row[i] * row[j];
                }
                atb[i] += row[i] * v;
            }
            pixels.push((dfs, dss, v));
        }
    }

    if pixels.len() < MIN_BACKGROUND_PIXELS {
        return None;
    }

    let sol = solve3(&ata, &atb)?;
    let mut ss_res = 0.0;
    for &(dfs, dss, v) in &pixels {
        let fit = sol[0] + sol[1] * dfs + sol[2] * dss;
        ss_res += (v - fit) * (v - fit);
    }
    let variance = ss_res / pixels.len() as f64;

    Some(BackgroundPlane {
        p0: sol[0],
        pfs: sol[1],
        pss: sol[2],
        variance,
        n_pixels: pixels.len(),
    })
}

/// Move the integration centre up to one pixel towards the signal centroid
fn recentre(image: &Image, panel: usize, cfs: f64, css: f64, r_inn: f64) -> (f64, f64) {
    let pdata = &image.panels[panel];
    let mut wsum = 0.0f64;
    let mut wfs = 0.0f64;
    let mut wss = 0.0f64;
    for iss in (css - r_inn).floor() as i64..=(css + r_inn).ceil() as i64 {
        for ifs in (cfs - r_inn).floor() as i64..=(cfs + r_inn).ceil() as i64 {
            if ifs < 0
                || iss < 0
                || ifs as usize >= pdata.data.ncols()
                || iss as usize >= pdata.data.nrows()
            {
                continue;
            }
            let (ufs, uss) = (ifs as usize, iss as usize);
            if pdata.bad[[uss, ufs]] {
                continue;
            }
            let dfs = ifs as f64 + 0.5 - cfs;
            let dss = iss as f64 + 0.5 - css;
            if dfs * dfs + dss * dss > r_inn * r_inn {
                continue;
            }
            let v = (pdata.data[[uss, ufs]] as f64).max(0.0);
            wsum += v;
            wfs += v * dfs;
            wss += v * dss;
        }
    }
    if wsum <= 0.0 {
        return (cfs, css);
    }
    let shift_fs = (wfs / wsum).clamp(-1.0, 1.0);
    let shift_ss = (wss / wsum).clamp(-1.0, 1.0);
    (cfs + shift_fs, css + shift_ss)
}

/// Integrate one reflection with the ring model. Sets status flags on
/// failure instead of guessing a value.
fn integrate_rings_one(
    image: &Image,
    det: &Detector,
    refl: &mut Reflection,
    params: &IntegrationParams,
) -> bool {
    let [r_inn, _, r_out] = params.radii;
    let geom = &det.panels[refl.panel];
    let pdata = &image.panels[refl.panel];

    let (mut cfs, mut css) = (refl.fs, refl.ss);
    if params.method.recentre() {
        let shifted = recentre(image, refl.panel, cfs, css, r_inn);
        cfs = shifted.0;
        css = shifted.1;
    }

    // The whole measurement box must stay on the panel; a straddling box is
    // rejected, never truncated
    if cfs - r_out < 0.0
        || css - r_out < 0.0
        || cfs + r_out >= geom.w as f64
        || css + r_out >= geom.h as f64
    {
        refl.status.edge_rejected = true;
        return false;
    }

    let Some(plane) = fit_background_plane(image, refl.panel, cfs, css, &params.radii) else {
        refl.status.bad_background = true;
        return false;
    };

    let mut sig_sum = 0.0f64;
    let mut sig_raw = 0.0f64;
    let mut sig_n = 0usize;
    let mut saturated = false;
    for iss in (css - r_inn).floor() as i64..=(css + r_inn).ceil() as i64 {
        for ifs in (cfs - r_inn).floor() as i64..=(cfs + r_inn).ceil() as i64 {
            let (ufs, uss) = (ifs as usize, iss as usize);
            if pdata.bad[[uss, ufs]] {
                continue;
            }
            let dfs = ifs as f64 + 0.5 - cfs;
            let dss = iss as f64 + 0.5 - css;
            if dfs * dfs + dss * dss > r_inn * r_inn {
                continue;
            }
            let v = pdata.data[[uss, ufs]] as f64;
            sig_sum += v - (plane.p0 + plane.pfs * dfs + plane.pss * dss);
            sig_raw += v.max(0.0);
            sig_n += 1;
            if pdata.data[[uss, ufs]] >= pdata.sat[[uss, ufs]] {
                saturated = true;
            }
        }
    }

    if sig_n == 0 {
        refl.status.bad_background = true;
        return false;
    }

    refl.status.saturated = saturated;
    if saturated && !params.integrate_saturated {
        return false;
    }

    // Poisson term plus the fitted background variance propagated into the
    // signal sum
    let n = sig_n as f64;
    let var = sig_raw + plane.variance * n * (1.0 + n / plane.n_pixels as f64);

    refl.intensity = sig_sum;
    refl.esd = var.max(0.0).sqrt();
    refl.status.measured = true;
    true
}

/// Empirical 2-D profile shared by the strong reflections of one crystal
struct SpotProfile {
    side: usize,
    /// Unit-sum profile weights
    weights: Vec<f64>,
}

fn build_profile(
    image: &Image,
    crystal: &Crystal,
    params: &IntegrationParams,
) -> Option<SpotProfile> {
    let r_inn = params.radii[0];
    let half = r_inn.ceil() as i64;
    let side = (2 * half + 1) as usize;
    let mut acc = vec![0.0f64; side * side];
    let mut n_used = 0usize;

    for refl in &crystal.reflections {
        if !refl.status.measured || refl.esd <= 0.0 || refl.intensity < 3.0 * refl.esd {
            continue;
        }
        let pdata = &image.panels[refl.panel];
        let plane = fit_background_plane(image, refl.panel, refl.fs, refl.ss, &params.radii)?;
        let mut local = vec![0.0f64; side * side];
        let mut total = 0.0f64;
        for dss in -half..=half {
            for dfs in -half..=half {
                let ifs = (refl.fs + dfs as f64).floor() as i64;
                let iss = (refl.ss + dss as f64).floor() as i64;
                if ifs < 0
                    || iss < 0
                    || ifs as usize >= pdata.data.ncols()
                    || iss as usize >= pdata.data.nrows()
                {
                    continue;
                }
                let v = pdata.data[[iss as usize, ifs as usize]] as f64
                    - (plane.p0 + plane.pfs * dfs as f64 + plane.pss * dss as f64);
                let idx = ((dss + half) * side as i64 + (dfs + half)) as usize;
                local[idx] = v.max(0.0);
                total += v.max(0.0);
            }
        }
        if total <= 0.0 {
            continue;
        }
        for (a, l) in acc.iter_mut().zip(local.iter()) {
            *a += l / total;
        }
        n_used += 1;
        if n_used >= 50 {
            break;
        }
    }

    if n_used < 3 {
        return None;
    }
    let total: f64 = acc.iter().sum();
    if total <= 0.0 {
        return None;
    }
    for a in acc.iter_mut() {
        *a /= total;
    }
    Some(SpotProfile {
        side,
        weights: acc,
    })
}

/// Second pass: fit the shared profile amplitude to each measured
/// reflection's signal region
fn profile_fit_pass(
    image: &Image,
    crystal: &mut Crystal,
    profile: &SpotProfile,
    params: &IntegrationParams,
) {
    let half = (profile.side / 2) as i64;
    for refl in crystal.reflections.iter_mut() {
        if !refl.status.measured {
            continue;
        }
        let pdata = &image.panels[refl.panel];
        let Some(plane) = fit_background_plane(image, refl.panel, refl.fs, refl.ss, &params.radii)
        else {
            continue;
        };
        let mut num = 0.0f64;
        let mut den = 0.0f64;
        for dss in -half..=half {
            for dfs in -half..=half {
                let ifs = (refl.fs + dfs as f64).floor() as i64;
                let iss = (refl.ss + dss as f64).floor() as i64;
                if ifs < 0
                    || iss < 0
                    || ifs as usize >= pdata.data.ncols()
                    || iss as usize >= pdata.data.nrows()
                {
                    continue;
                }
                let idx = ((dss + half) * profile.side as i64 + (dfs + half)) as usize;
                let w = profile.weights[idx];
                let v = pdata.data[[iss as usize, ifs as usize]] as f64
                    - (plane.p0 + plane.pfs * dfs as f64 + plane.pss * dss as f64);
                num += w * v;
                den += w * w;
            }
        }
        if den > 0.0 {
            // Amplitude of the unit-sum profile is the fitted total count
            refl.intensity = num / den;
        }
    }
}

/// Integrate every predicted reflection of every crystal. The image must
/// hold restored, unfiltered pixel data at this point.
pub fn integrate_all(
    image: &Image,
    det: &Detector,
    crystals: &mut [Crystal],
    params: &IntegrationParams,
) -> IntegrationSummary {
    let mut summary = IntegrationSummary::default();
    for crystal in crystals.iter_mut() {
        for refl in crystal.reflections.iter_mut() {
            let ok = integrate_rings_one(image, det, refl, params);
            if refl.status.edge_rejected {
                summary.n_edge_rejected += 1;
            }
            if refl.status.bad_background {
                summary.n_bad_background += 1;
            }
            if refl.status.saturated {
                summary.n_saturated += 1;
            }
            if ok {
                summary.n_measured += 1;
            }
        }
        if params.method.profile_fit() {
            if let Some(profile) = build_profile(image, crystal, params) {
                profile_fit_pass(image, crystal, &profile, params);
            } else {
                spdlog::debug!("Too few strong reflections for a spot profile; keeping ring sums");
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{LatticeType, UnitCell};
    use crate::config::IntMethod;
    use crate::geometry::single_panel;

    fn params() -> IntegrationParams {
        IntegrationParams {
            method: IntMethod::Rings,
            radii: [3.0, 4.0, 6.0],
            integrate_saturated: false,
        }
    }

    fn flat_image(det: &crate::geometry::Detector, level: f32) -> Image {
        let mut image = Image::new(det, 1.3e-10);
        for v in image.panels[0].data.iter_mut() {
            *v = level;
        }
        image
    }

    fn test_crystal(reflections: Vec<Reflection>) -> Crystal {
        let half_pi = std::f64::consts::FRAC_PI_2;
        let cell = UnitCell::from_parameters(50e-10, 50e-10, 50e-10, half_pi, half_pi, half_pi)
            .unwrap()
            .with_lattice(LatticeType::Cubic, 'P');
        let mut c = Crystal::new(cell, "test");
        c.reflections = reflections;
        c
    }

    fn refl_at(fs: f64, ss: f64) -> Reflection {
        let mut r = Reflection::new(1, 0, 0);
        r.fs = fs;
        r.ss = ss;
        r.panel = 0;
        r
    }

    #[test]
    fn integrates_injected_intensity_within_tolerance() {
        let det = single_panel(64, 64, 0.1, 100e-6);
        let mut image = flat_image(&det, 50.0);
        // Spread 900 counts over a 3x3 block on top of the background
        for dss in -1i64..=1 {
            for dfs in -1i64..=1 {
                image.panels[0].data[[(30 + dss) as usize, (40 + dfs) as usize]] += 100.0;
            }
        }
        let mut crystals = vec![test_crystal(vec![refl_at(40.5, 30.5)])];
        let summary = integrate_all(&image, &det, &mut crystals, &params());
        assert_eq!(summary.n_measured, 1);
        let r = &crystals[0].reflections[0];
        assert!(r.status.measured);
        assert!((r.intensity - 900.0).abs() < 9.0, "got {}", r.intensity);
        assert!(r.esd > 0.0);
    }

    #[test]
    fn background_gradient_is_subtracted() {
        let det = single_panel(64, 64, 0.1, 100e-6);
        let mut image = Image::new(&det, 1.3e-10);
        // Sloped background: 2 ADU per fs pixel
        for ((_ss, fs), v) in image.panels[0].data.indexed_iter_mut() {
            *v = 10.0 + 2.0 * fs as f32;
        }
        image.panels[0].data[[30, 40]] += 500.0;
        let mut crystals = vec![test_crystal(vec![refl_at(40.5, 30.5)])];
        integrate_all(&image, &det, &mut crystals, &params());
        let r = &crystals[0].reflections[0];
        assert!(r.status.measured);
        assert!((r.intensity - 500.0).abs() < 5.0, "got {}", r.intensity);
    }

    #[test]
    fn edge_straddling_box_is_rejected() {
        let det = single_panel(64, 64, 0.1, 100e-6);
        let image = flat_image(&det, 10.0);
        let mut crystals = vec![test_crystal(vec![refl_at(2.0, 30.0)])];
        let summary = integrate_all(&image, &det, &mut crystals, &params());
        assert_eq!(summary.n_measured, 0);
        assert_eq!(summary.n_edge_rejected, 1);
        assert!(crystals[0].reflections[0].status.edge_rejected);
        assert!(!crystals[0].reflections[0].status.measured);
    }

    #[test]
    fn saturated_reflection_respects_policy() {
        let det = single_panel(64, 64, 0.1, 100e-6);
        let mut image = flat_image(&det, 10.0);
        image.panels[0].sat.fill(1000.0);
        image.panels[0].data[[30, 40]] = 2000.0;
        let mut crystals = vec![test_crystal(vec![refl_at(40.5, 30.5)])];
        let summary = integrate_all(&image, &det, &mut crystals, &params());
        assert_eq!(summary.n_saturated, 1);
        assert_eq!(summary.n_measured, 0);
        assert!(crystals[0].reflections[0].status.saturated);
        assert!(!crystals[0].reflections[0].status.measured);

        let mut p2 = params();
        p2.integrate_saturated = true;
        let mut crystals2 = vec![test_crystal(vec![refl_at(40.5, 30.5)])];
        let summary2 = integrate_all(&image, &det, &mut crystals2, &p2);
        assert_eq!(summary2.n_measured, 1);
        assert!(crystals2[0].reflections[0].status.measured);
    }

    #[test]
    fn masked_background_fails_gracefully() {
        let det = single_panel(64, 64, 0.1, 100e-6);
        let mut image = flat_image(&det, 10.0);
        // Mask out nearly the whole background annulus
        for iss in 24..38 {
            for ifs in 34..48 {
                let dfs = ifs as f64 + 0.5 - 40.5;
                let dss = iss as f64 + 0.5 - 30.5;
                let r = (dfs * dfs + dss * dss).sqrt();
                if r > 4.0 {
                    image.panels[0].bad[[iss, ifs]] = true;
                }
            }
        }
        let mut crystals = vec![test_crystal(vec![refl_at(40.5, 30.5)])];
        let summary = integrate_all(&image, &det, &mut crystals, &params());
        assert_eq!(summary.n_bad_background, 1);
        assert!(!crystals[0].reflections[0].status.measured);
    }
}
