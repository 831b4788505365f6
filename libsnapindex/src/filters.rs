//! Pre-peak-search pixel filters.
//!
//! Filters mutate the working pixel data only. The pipeline snapshots the
//! raw data first and restores it before integration, so intensity
//! measurement never sees filtered values.

use ndarray::Array2;

use super::geometry::Detector;
use super::image::Image;

/// Replace every pixel with the median of the surrounding box of side
/// 2n + 1, clamped at the panel edges. n = 0 is a no-op.
pub fn median_filter(image: &mut Image, n: usize) {
    if n == 0 {
        return;
    }
    for panel in &mut image.panels {
        let (h, w) = (panel.data.nrows(), panel.data.ncols());
        let mut out = Array2::<f32>::zeros((h, w));
        let mut window = Vec::with_capacity((2 * n + 1) * (2 * n + 1));
        for ss in 0..h {
            for fs in 0..w {
                window.clear();
                let ss0 = ss.saturating_sub(n);
                let ss1 = (ss + n).min(h - 1);
                let fs0 = fs.saturating_sub(n);
                let fs1 = (fs + n).min(w - 1);
                for sj in ss0..=ss1 {
                    for fj in fs0..=fs1 {
                        window.push(panel.data[[sj, fj]]);
                    }
                }
                let mid = window.len() / 2;
                window.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
                out[[ss, fs]] = window[mid];
            }
        }
        panel.data = out;
    }
}

/// Zero every 3x3 block which contains any negative pixel
pub fn noise_filter(image: &mut Image) {
    for panel in &mut image.panels {
        let (h, w) = (panel.data.nrows(), panel.data.ncols());
        let negative: Vec<(usize, usize)> = panel
            .data
            .indexed_iter()
            .filter(|(_, v)| **v < 0.0)
            .map(|(idx, _)| idx)
            .collect();
        for (ss, fs) in negative {
            let ss0 = ss.saturating_sub(1);
            let ss1 = (ss + 1).min(h - 1);
            let fs0 = fs.saturating_sub(1);
            let fs1 = (fs + 1).min(w - 1);
            for sj in ss0..=ss1 {
                for fj in fs0..=fs1 {
                    panel.data[[sj, fj]] = 0.0;
                }
            }
        }
    }
}

/// Mark every pixel beyond the given 1/d cutoff (m^-1) as bad
pub fn mark_resolution_range_bad(image: &mut Image, det: &Detector, max_res: f64) {
    for (panel, geom) in image.panels.iter_mut().zip(det.panels.iter()) {
        let (h, w) = (panel.data.nrows(), panel.data.ncols());
        for ss in 0..h {
            for fs in 0..w {
                let r = geom.resolution(fs as f64 + 0.5, ss as f64 + 0.5, image.lambda);
                if r > max_res {
                    panel.bad[[ss, fs]] = true;
                }
            }
        }
    }
}
