//! Local-background peak search.
//!
//! Each candidate must be the biggest pixel of its window, must beat its
//! direct neighbours by a margin, and must stand far enough above the
//! background estimated from the window border. The peak is then summed
//! from the window pixels above the peak-pixel threshold.

use super::geometry::Detector;
use super::image::Image;
use super::peaks::{Peak, PeakList};

pub struct Pf9Params {
    pub min_snr_biggest_pix: f64,
    pub min_snr_peak_pix: f64,
    pub min_snr: f64,
    /// Lower bound applied to the background spread estimate
    pub min_sig: f64,
    pub min_peak_over_neighbour: f64,
    /// Window radius; the border ring at this radius is the background
    pub local_bg_radius: usize,
    pub use_saturated: bool,
}

pub fn search_peakfinder9(image: &mut Image, det: &Detector, params: &Pf9Params) -> PeakList {
    let r = params.local_bg_radius.max(2);
    let mut found: PeakList = Vec::new();
    let mut n_saturated = 0usize;

    for (panel_idx, (panel, geom)) in image.panels.iter().zip(det.panels.iter()).enumerate() {
        let (h, w) = (panel.data.nrows(), panel.data.ncols());
        if h <= 2 * r || w <= 2 * r {
            continue;
        }
        for ss in r..h - r {
            'pixel: for fs in r..w - r {
                if panel.bad[[ss, fs]] {
                    continue;
                }
                let v = panel.data[[ss, fs]] as f64;

                // Biggest pixel of the window, and bigger than the direct
                // neighbours by the configured margin
                for dss in -(r as i64)..=r as i64 {
                    for dfs in -(r as i64)..=r as i64 {
                        if dss == 0 && dfs == 0 {
                            continue;
                        }
                        let nv =
                            panel.data[[(ss as i64 + dss) as usize, (fs as i64 + dfs) as usize]]
                                as f64;
                        if nv > v {
                            continue 'pixel;
                        }
                        if dss.abs() <= 1
                            && dfs.abs() <= 1
                            && v - nv < params.min_peak_over_neighbour
                        {
                            continue 'pixel;
                        }
                    }
                }

                // Background from the window border ring
                let mut bg: Vec<f64> = Vec::with_capacity(8 * r);
                for dss in -(r as i64)..=r as i64 {
                    for dfs in -(r as i64)..=r as i64 {
                        if dss.abs() != r as i64 && dfs.abs() != r as i64 {
                            continue;
                        }
                        let nss = (ss as i64 + dss) as usize;
                        let nfs = (fs as i64 + dfs) as usize;
                        if !panel.bad[[nss, nfs]] {
                            bg.push(panel.data[[nss, nfs]] as f64);
                        }
                    }
                }
                if bg.len() < 4 {
                    continue;
                }
                let mean = bg.iter().sum::<f64>() / bg.len() as f64;
                let var =
                    bg.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / bg.len() as f64;
                let sigma = var.sqrt().max(params.min_sig);

                if v - mean < params.min_snr_biggest_pix * sigma {
                    continue;
                }

                // Sum the peak pixels above the per-pixel threshold
                let pix_threshold = mean + params.min_snr_peak_pix * sigma;
                let mut total = 0.0f64;
                let mut n_pix = 0usize;
                let mut wfs = 0.0f64;
                let mut wss = 0.0f64;
                let mut saturated = false;
                for dss in -(r as i64)..=r as i64 {
                    for dfs in -(r as i64)..=r as i64 {
                        let nss = (ss as i64 + dss) as usize;
                        let nfs = (fs as i64 + dfs) as usize;
                        if panel.bad[[nss, nfs]] {
                            continue;
                        }
                        let nv = panel.data[[nss, nfs]] as f64;
                        if nv > pix_threshold {
                            let above = nv - mean;
                            total += above;
                            n_pix += 1;
                            wfs += above * (nfs as f64 + 0.5);
                            wss += above * (nss as f64 + 0.5);
                            if panel.data[[nss, nfs]] >= panel.sat[[nss, nfs]] {
                                saturated = true;
                            }
                        }
                    }
                }
                if n_pix == 0 || total <= 0.0 {
                    continue;
                }
                let snr = total / (sigma * (n_pix as f64).sqrt());
                if snr < params.min_snr {
                    continue;
                }
                if saturated {
                    n_saturated += 1;
                    if !params.use_saturated {
                        continue;
                    }
                }
                let cfs = wfs / total;
                let css = wss / total;
                found.push(Peak {
                    fs: cfs,
                    ss: css,
                    panel: panel_idx,
                    intensity: total,
                    background: mean,
                    snr,
                    resolution: geom.resolution(cfs, css, image.lambda),
                });
            }
        }
    }

    image.n_saturated_peaks = n_saturated;
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::single_panel;

    fn params() -> Pf9Params {
        Pf9Params {
            min_snr_biggest_pix: 7.0,
            min_snr_peak_pix: 6.0,
            min_snr: 5.0,
            min_sig: 1.0,
            min_peak_over_neighbour: -f64::INFINITY,
            local_bg_radius: 3,
            use_saturated: true,
        }
    }

    #[test]
    fn finds_local_maximum_above_background() {
        let det = single_panel(48, 48, 0.1, 100e-6);
        let mut image = Image::new(&det, 1.3e-10);
        for (idx, v) in image.panels[0].data.indexed_iter_mut() {
            *v = 20.0 + ((idx.0 * 3 + idx.1) % 4) as f32;
        }
        image.panels[0].data[[20, 30]] = 400.0;
        image.panels[0].data[[20, 31]] = 250.0;
        let peaks = search_peakfinder9(&mut image, &det, &params());
        assert_eq!(peaks.len(), 1);
        assert!((peaks[0].ss - 20.5).abs() < 1.0);
        assert!(peaks[0].fs > 30.0 && peaks[0].fs < 32.0);
    }

    #[test]
    fn plateau_is_not_a_peak() {
        let det = single_panel(48, 48, 0.1, 100e-6);
        let mut image = Image::new(&det, 1.3e-10);
        for v in image.panels[0].data.iter_mut() {
            *v = 300.0;
        }
        assert!(search_peakfinder9(&mut image, &det, &params()).is_empty());
    }

    #[test]
    fn weak_bump_fails_biggest_pixel_test() {
        let det = single_panel(48, 48, 0.1, 100e-6);
        let mut image = Image::new(&det, 1.3e-10);
        for (idx, v) in image.panels[0].data.indexed_iter_mut() {
            *v = 20.0 + ((idx.0 + idx.1) % 5) as f32;
        }
        image.panels[0].data[[24, 24]] = 26.0;
        assert!(search_peakfinder9(&mut image, &det, &params()).is_empty());
    }
}
