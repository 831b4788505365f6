use super::geometry::Detector;
use super::image::Image;

/// One found Bragg peak, in panel-relative pixel coordinates
#[derive(Debug, Clone)]
pub struct Peak {
    pub fs: f64,
    pub ss: f64,
    pub panel: usize,
    pub intensity: f64,
    pub background: f64,
    pub snr: f64,
    /// 1/d, m^-1
    pub resolution: f64,
}

/// Peaks in detection order. Replaced wholesale when revalidation runs.
pub type PeakList = Vec<Peak>;

/// Result of measuring a candidate position with the three-ring local model
#[derive(Debug, Clone, Copy)]
pub struct PeakMeasurement {
    pub intensity: f64,
    pub background: f64,
    pub sigma: f64,
    pub snr: f64,
    pub centroid_fs: f64,
    pub centroid_ss: f64,
    pub saturated: bool,
}

/// Measure a candidate peak at (fs, ss) on `panel`: sum the signal disk of
/// radius `radii[0]`, estimate the local background from the annulus between
/// `radii[1]` and `radii[2]`, and form a signal-to-noise ratio.
///
/// Returns None when the measurement box leaves the panel or the background
/// annulus has too few usable pixels.
pub fn measure_peak(
    image: &Image,
    panel: usize,
    fs: f64,
    ss: f64,
    radii: &[f64; 3],
) -> Option<PeakMeasurement> {
    let [r_inn, r_mid, r_out] = *radii;
    let pdata = image.panels.get(panel)?;
    let (h, w) = (pdata.data.nrows(), pdata.data.ncols());

    let lo_fs = (fs - r_out).floor();
    let hi_fs = (fs + r_out).ceil();
    let lo_ss = (ss - r_out).floor();
    let hi_ss = (ss + r_out).ceil();
    if lo_fs < 0.0 || lo_ss < 0.0 || hi_fs >= w as f64 || hi_ss >= h as f64 {
        return None;
    }

    let mut sig_sum = 0.0f64;
    let mut sig_n = 0usize;
    let mut wsum_fs = 0.0f64;
    let mut wsum_ss = 0.0f64;
    let mut saturated = false;
    let mut bg: Vec<f64> = Vec::new();

    for iss in (lo_ss as usize)..=(hi_ss as usize) {
        for ifs in (lo_fs as usize)..=(hi_fs as usize) {
            if pdata.bad[[iss, ifs]] {
                continue;
            }
            let dfs = ifs as f64 + 0.5 - fs;
            let dss = iss as f64 + 0.5 - ss;
            let r = (dfs * dfs + dss * dss).sqrt();
            let v = pdata.data[[iss, ifs]] as f64;
            if r <= r_inn {
                sig_sum += v;
                sig_n += 1;
                wsum_fs += v * (ifs as f64 + 0.5);
                wsum_ss += v * (iss as f64 + 0.5);
                if pdata.data[[iss, ifs]] >= pdata.sat[[iss, ifs]] {
                    saturated = true;
                }
            } else if r > r_mid && r <= r_out {
                bg.push(v);
            }
        }
    }

    if sig_n == 0 || bg.len() < 3 {
        return None;
    }

    let bg_mean = bg.iter().sum::<f64>() / bg.len() as f64;
    let bg_var = bg.iter().map(|v| (v - bg_mean) * (v - bg_mean)).sum::<f64>()
        / bg.len() as f64;
    let bg_sigma = bg_var.sqrt();

    let intensity = sig_sum - bg_mean * sig_n as f64;
    let noise = bg_sigma * (sig_n as f64).sqrt();
    let snr = if noise > 0.0 {
        intensity / noise
    } else if intensity > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let (centroid_fs, centroid_ss) = if sig_sum > 0.0 {
        (wsum_fs / sig_sum, wsum_ss / sig_sum)
    } else {
        (fs, ss)
    };

    Some(PeakMeasurement {
        intensity,
        background: bg_mean,
        sigma: bg_sigma,
        snr,
        centroid_fs,
        centroid_ss,
        saturated,
    })
}

/// Re-measure every peak with the local model and drop those which fail the
/// SNR threshold or (when configured) contain saturated pixels. The list is
/// replaced wholesale; saturated rejections are counted on the image.
pub fn validate_peaks(
    image: &mut Image,
    det: &Detector,
    peaks: PeakList,
    radii: &[f64; 3],
    min_snr: f64,
    use_saturated: bool,
) -> PeakList {
    let mut out = Vec::with_capacity(peaks.len());
    let mut n_saturated = 0usize;
    for peak in peaks {
        let Some(m) = measure_peak(image, peak.panel, peak.fs, peak.ss, radii) else {
            continue;
        };
        if m.saturated {
            n_saturated += 1;
            if !use_saturated {
                continue;
            }
        }
        if m.snr < min_snr {
            continue;
        }
        let resolution =
            det.panels[peak.panel].resolution(peak.fs, peak.ss, image.lambda);
        out.push(Peak {
            fs: peak.fs,
            ss: peak.ss,
            panel: peak.panel,
            intensity: m.intensity,
            background: m.background,
            snr: m.snr,
            resolution,
        });
    }
    image.n_saturated_peaks = n_saturated;
    out
}

/// Highest 1/d among the peaks, m^-1
pub fn estimate_peak_resolution(peaks: &PeakList) -> Option<f64> {
    peaks
        .iter()
        .map(|p| p.resolution)
        .max_by(|a, b| a.total_cmp(b))
}
