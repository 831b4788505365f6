//! Radial-background peak search.
//!
//! The detector is divided into one-pixel-wide annuli around the beam axis.
//! Each annulus gets a median and a spread estimate; pixels standing far
//! enough above their annulus background are clustered by 8-connectivity and
//! each acceptable cluster becomes one peak.

use super::geometry::Detector;
use super::image::Image;
use super::peaks::{Peak, PeakList};

pub struct Pf8Params {
    pub threshold: f64,
    pub min_snr: f64,
    pub min_pix_count: usize,
    pub max_pix_count: usize,
    /// Resolution band in pixel-radius units
    pub min_res: f64,
    pub max_res: f64,
    pub use_saturated: bool,
}

struct RadialStats {
    median: Vec<f64>,
    sigma: Vec<f64>,
}

fn radial_statistics(image: &Image, det: &Detector) -> RadialStats {
    let mut bins: Vec<Vec<f64>> = Vec::new();
    for (panel, geom) in image.panels.iter().zip(det.panels.iter()) {
        for ((ss, fs), v) in panel.data.indexed_iter() {
            if panel.bad[[ss, fs]] {
                continue;
            }
            let r = geom.pixel_radius(fs as f64 + 0.5, ss as f64 + 0.5) as usize;
            if r >= bins.len() {
                bins.resize_with(r + 1, Vec::new);
            }
            bins[r].push(*v as f64);
        }
    }

    let mut median = Vec::with_capacity(bins.len());
    let mut sigma = Vec::with_capacity(bins.len());
    for mut bin in bins {
        if bin.is_empty() {
            median.push(0.0);
            sigma.push(f64::INFINITY);
            continue;
        }
        let mid = bin.len() / 2;
        bin.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
        let med = bin[mid];
        // Spread from the median absolute deviation, so the peaks being
        // hunted do not inflate their own background estimate
        let mut devs: Vec<f64> = bin.iter().map(|v| (v - med).abs()).collect();
        devs.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
        let mad = devs[mid];
        median.push(med);
        sigma.push((1.4826 * mad).max(1e-9));
    }
    RadialStats { median, sigma }
}

pub fn search_peakfinder8(image: &mut Image, det: &Detector, params: &Pf8Params) -> PeakList {
    let stats = radial_statistics(image, det);
    let mut found: PeakList = Vec::new();
    let mut n_saturated = 0usize;

    for (panel_idx, (panel, geom)) in image.panels.iter().zip(det.panels.iter()).enumerate() {
        let (h, w) = (panel.data.nrows(), panel.data.ncols());
        let mut accepted = vec![false; h * w];
        for ((ss, fs), v) in panel.data.indexed_iter() {
            if panel.bad[[ss, fs]] {
                continue;
            }
            let v = *v as f64;
            if v < params.threshold {
                continue;
            }
            let r = geom.pixel_radius(fs as f64 + 0.5, ss as f64 + 0.5) as usize;
            if r >= stats.median.len() {
                continue;
            }
            if v - stats.median[r] > params.min_snr * stats.sigma[r] {
                accepted[ss * w + fs] = true;
            }
        }

        // 8-connectivity clustering over accepted pixels
        let mut visited = vec![false; h * w];
        for start in 0..h * w {
            if !accepted[start] || visited[start] {
                continue;
            }
            let mut stack = vec![start];
            visited[start] = true;
            let mut cluster: Vec<(usize, usize)> = Vec::new();
            while let Some(idx) = stack.pop() {
                let (css, cfs) = (idx / w, idx % w);
                cluster.push((cfs, css));
                for dss in -1i64..=1 {
                    for dfs in -1i64..=1 {
                        let nss = css as i64 + dss;
                        let nfs = cfs as i64 + dfs;
                        if nss < 0 || nfs < 0 || nss >= h as i64 || nfs >= w as i64 {
                            continue;
                        }
                        let nidx = nss as usize * w + nfs as usize;
                        if accepted[nidx] && !visited[nidx] {
                            visited[nidx] = true;
                            stack.push(nidx);
                        }
                    }
                }
            }

            if cluster.len() < params.min_pix_count || cluster.len() > params.max_pix_count {
                continue;
            }

            let mut total = 0.0f64;
            let mut wfs = 0.0f64;
            let mut wss = 0.0f64;
            let mut bg_sum = 0.0f64;
            let mut sigma_sum = 0.0f64;
            let mut saturated = false;
            for &(fs, ss) in &cluster {
                let r = geom.pixel_radius(fs as f64 + 0.5, ss as f64 + 0.5) as usize;
                let med = stats.median.get(r).copied().unwrap_or(0.0);
                let sig = stats.sigma.get(r).copied().unwrap_or(1e-9);
                let v = panel.data[[ss, fs]] as f64 - med;
                total += v;
                wfs += v * (fs as f64 + 0.5);
                wss += v * (ss as f64 + 0.5);
                bg_sum += med;
                sigma_sum += sig;
                if panel.data[[ss, fs]] >= panel.sat[[ss, fs]] {
                    saturated = true;
                }
            }
            if total <= 0.0 {
                continue;
            }
            let n = cluster.len() as f64;
            let snr = total / (sigma_sum / n * n.sqrt());
            if snr < params.min_snr {
                continue;
            }
            let cfs = wfs / total;
            let css = wss / total;
            let pixel_r = geom.pixel_radius(cfs, css);
            if pixel_r < params.min_res || pixel_r > params.max_res {
                continue;
            }
            if saturated {
                n_saturated += 1;
                if !params.use_saturated {
                    continue;
                }
            }
            found.push(Peak {
                fs: cfs,
                ss: css,
                panel: panel_idx,
                intensity: total,
                background: bg_sum / n,
                snr,
                resolution: geom.resolution(cfs, css, image.lambda),
            });
        }
    }

    image.n_saturated_peaks = n_saturated;
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::single_panel;

    fn params() -> Pf8Params {
        Pf8Params {
            threshold: 50.0,
            min_snr: 5.0,
            min_pix_count: 1,
            max_pix_count: 50,
            min_res: 0.0,
            max_res: 1e9,
            use_saturated: true,
        }
    }

    #[test]
    fn finds_cluster_above_radial_background() {
        let det = single_panel(64, 64, 0.1, 100e-6);
        let mut image = Image::new(&det, 1.3e-10);
        for (idx, v) in image.panels[0].data.indexed_iter_mut() {
            *v = 10.0 + ((idx.0 + idx.1) % 3) as f32;
        }
        for (fs, ss) in [(20usize, 24usize), (21, 24), (20, 25)] {
            image.panels[0].data[[ss, fs]] = 500.0;
        }
        let peaks = search_peakfinder8(&mut image, &det, &params());
        assert_eq!(peaks.len(), 1);
        assert!((peaks[0].fs - 20.8).abs() < 1.0);
        assert!((peaks[0].ss - 24.6).abs() < 1.0);
    }

    #[test]
    fn cluster_size_limits_apply() {
        let det = single_panel(64, 64, 0.1, 100e-6);
        let mut image = Image::new(&det, 1.3e-10);
        for v in image.panels[0].data.iter_mut() {
            *v = 10.0;
        }
        // A 3x3 blob of hot pixels
        for ss in 30..33 {
            for fs in 40..43 {
                image.panels[0].data[[ss, fs]] = 800.0;
            }
        }
        let mut p = params();
        p.max_pix_count = 4;
        assert!(search_peakfinder8(&mut image, &det, &p).is_empty());
        p.max_pix_count = 50;
        p.min_pix_count = 20;
        assert!(search_peakfinder8(&mut image, &det, &p).is_empty());
    }

    #[test]
    fn resolution_band_rejects_outside() {
        let det = single_panel(64, 64, 0.1, 100e-6);
        let mut image = Image::new(&det, 1.3e-10);
        for v in image.panels[0].data.iter_mut() {
            *v = 10.0;
        }
        image.panels[0].data[[32, 40]] = 900.0; // 8 px from centre
        let mut p = params();
        p.min_res = 20.0;
        assert!(search_peakfinder8(&mut image, &det, &p).is_empty());
        p.min_res = 0.0;
        p.max_res = 5.0;
        assert!(search_peakfinder8(&mut image, &det, &p).is_empty());
    }
}
