//! Gradient-threshold peak search (Zaefferer 2000).
//!
//! A pixel is a candidate when it is above the ADU threshold and its squared
//! intensity gradient is above the gradient threshold. Candidates walk to
//! the local maximum, are measured with the three-ring local model, and are
//! kept when the signal-to-noise ratio passes.

use super::geometry::Detector;
use super::image::Image;
use super::peaks::{measure_peak, Peak, PeakList};

pub struct ZaefParams {
    pub threshold: f64,
    pub min_squared_gradient: f64,
    pub min_snr: f64,
    pub radii: [f64; 3],
    pub use_saturated: bool,
}

/// Maximum walk steps towards a local maximum before a candidate is dropped
const MAX_WALK: usize = 10;

pub fn search_zaef(image: &mut Image, det: &Detector, params: &ZaefParams) -> PeakList {
    let mut found: PeakList = Vec::new();
    let mut n_saturated = 0usize;
    let r_out = params.radii[2].ceil() as usize + 1;

    for (panel_idx, panel) in image.panels.iter().enumerate() {
        let (h, w) = (panel.data.nrows(), panel.data.ncols());
        if h <= 2 * r_out || w <= 2 * r_out {
            continue;
        }
        for ss in r_out..h - r_out {
            for fs in r_out..w - r_out {
                if panel.bad[[ss, fs]] {
                    continue;
                }
                let v = panel.data[[ss, fs]] as f64;
                if v < params.threshold {
                    continue;
                }
                let dx = (panel.data[[ss, fs + 1]] - panel.data[[ss, fs]]) as f64;
                let dy = (panel.data[[ss + 1, fs]] - panel.data[[ss, fs]]) as f64;
                if dx * dx + dy * dy < params.min_squared_gradient {
                    continue;
                }

                // Walk uphill to the local maximum
                let (mut cfs, mut css) = (fs, ss);
                for _ in 0..MAX_WALK {
                    let mut best = panel.data[[css, cfs]];
                    let mut best_pos = (cfs, css);
                    for (nfs, nss) in neighbours(cfs, css, w, h) {
                        if !panel.bad[[nss, nfs]] && panel.data[[nss, nfs]] > best {
                            best = panel.data[[nss, nfs]];
                            best_pos = (nfs, nss);
                        }
                    }
                    if best_pos == (cfs, css) {
                        break;
                    }
                    (cfs, css) = best_pos;
                }

                let cand_fs = cfs as f64 + 0.5;
                let cand_ss = css as f64 + 0.5;

                // One peak per maximum
                if found.iter().any(|p: &Peak| {
                    p.panel == panel_idx
                        && (p.fs - cand_fs).abs() < 2.0 * params.radii[0]
                        && (p.ss - cand_ss).abs() < 2.0 * params.radii[0]
                }) {
                    continue;
                }

                let Some(m) = measure_peak(image, panel_idx, cand_fs, cand_ss, &params.radii)
                else {
                    continue;
                };
                if m.saturated {
                    n_saturated += 1;
                    if !params.use_saturated {
                        continue;
                    }
                }
                if m.snr < params.min_snr || m.intensity <= 0.0 {
                    continue;
                }
                let resolution = det.panels[panel_idx].resolution(
                    m.centroid_fs,
                    m.centroid_ss,
                    image.lambda,
                );
                found.push(Peak {
                    fs: m.centroid_fs,
                    ss: m.centroid_ss,
                    panel: panel_idx,
                    intensity: m.intensity,
                    background: m.background,
                    snr: m.snr,
                    resolution,
                });
            }
        }
    }

    image.n_saturated_peaks = n_saturated;
    found
}

fn neighbours(fs: usize, ss: usize, w: usize, h: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::with_capacity(8);
    for dss in -1i64..=1 {
        for dfs in -1i64..=1 {
            if dss == 0 && dfs == 0 {
                continue;
            }
            let nfs = fs as i64 + dfs;
            let nss = ss as i64 + dss;
            if nfs >= 0 && nss >= 0 && (nfs as usize) < w && (nss as usize) < h {
                out.push((nfs as usize, nss as usize));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::single_panel;

    fn params() -> ZaefParams {
        ZaefParams {
            threshold: 100.0,
            min_squared_gradient: 1000.0,
            min_snr: 5.0,
            radii: [2.0, 3.0, 5.0],
            use_saturated: true,
        }
    }

    fn paint_spot(image: &mut Image, fs: usize, ss: usize, peak: f32) {
        // A small pyramid so the gradient threshold fires on the flanks
        image.panels[0].data[[ss, fs]] = peak;
        for (dfs, dss) in [(1i64, 0i64), (-1, 0), (0, 1), (0, -1)] {
            let f = (fs as i64 + dfs) as usize;
            let s = (ss as i64 + dss) as usize;
            image.panels[0].data[[s, f]] = peak / 2.0;
        }
    }

    #[test]
    fn finds_an_isolated_spot() {
        let det = single_panel(64, 64, 0.1, 100e-6);
        let mut image = Image::new(&det, 1.3e-10);
        paint_spot(&mut image, 30, 22, 2000.0);
        let peaks = search_zaef(&mut image, &det, &params());
        assert_eq!(peaks.len(), 1);
        assert!((peaks[0].fs - 30.5).abs() < 1.0);
        assert!((peaks[0].ss - 22.5).abs() < 1.0);
        assert!(peaks[0].intensity > 1000.0);
    }

    #[test]
    fn flat_image_yields_nothing() {
        let det = single_panel(64, 64, 0.1, 100e-6);
        let mut image = Image::new(&det, 1.3e-10);
        for v in image.panels[0].data.iter_mut() {
            *v = 50.0;
        }
        assert!(search_zaef(&mut image, &det, &params()).is_empty());
    }

    #[test]
    fn two_spots_two_peaks() {
        let det = single_panel(64, 64, 0.1, 100e-6);
        let mut image = Image::new(&det, 1.3e-10);
        paint_spot(&mut image, 15, 15, 2000.0);
        paint_spot(&mut image, 45, 40, 3000.0);
        let peaks = search_zaef(&mut image, &det, &params());
        assert_eq!(peaks.len(), 2);
    }

    #[test]
    fn saturation_rejection_respects_flag() {
        let det = single_panel(64, 64, 0.1, 100e-6);
        let mut image = Image::new(&det, 1.3e-10);
        image.panels[0].sat.fill(1500.0);
        paint_spot(&mut image, 30, 30, 2000.0);
        let mut p = params();
        p.use_saturated = false;
        let peaks = search_zaef(&mut image, &det, &p);
        assert!(peaks.is_empty());
        assert_eq!(image.n_saturated_peaks, 1);
    }
}
