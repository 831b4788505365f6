use fxhash::FxHashMap;
use ndarray::Array2;

use super::geometry::Detector;
use super::spectrum::Spectrum;

/// Pixel arrays for one panel. Arrays are indexed [ss][fs] (row = slow scan).
#[derive(Debug, Clone)]
pub struct PanelData {
    pub data: Array2<f32>,
    pub bad: Array2<bool>,
    /// Per-pixel saturation value in ADU
    pub sat: Array2<f32>,
}

/// One diffraction snapshot in memory: per-panel pixel arrays plus the beam
/// state and bookkeeping for the chunk that will eventually be written.
///
/// An Image is created by the loader at the start of the pipeline, owned
/// exclusively by one worker, and dropped when its chunk has been handed off.
#[derive(Debug, Clone)]
pub struct Image {
    pub panels: Vec<PanelData>,
    /// Wavelength, metres
    pub lambda: f64,
    pub spectrum: Spectrum,
    pub filename: String,
    pub event: Option<String>,
    /// Serial number assigned by the dispatcher at dequeue time
    pub serial: u64,
    pub metadata: FxHashMap<String, String>,
    pub hit: bool,
    /// Highest 1/d among found peaks, m^-1
    pub peak_resolution: Option<f64>,
    pub n_saturated_peaks: usize,
}

/// The pre-filter copy of the pixel data. Taken before any filter runs and
/// swapped back in before integration reads pixel values.
#[derive(Debug)]
pub struct Snapshot {
    data: Vec<Array2<f32>>,
}

impl Image {
    /// Allocate an empty image shaped like the detector, with saturation
    /// maps initialised from each panel's max_adu and bad maps from the
    /// geometry's bad regions.
    pub fn new(det: &Detector, lambda: f64) -> Self {
        let mut panels = Vec::with_capacity(det.panels.len());
        for p in &det.panels {
            let mut bad = Array2::from_elem((p.h, p.w), false);
            for region in det.bad_regions.iter().filter(|r| r.panel == p.name) {
                for ss in region.min_ss..=region.max_ss.min(p.h - 1) {
                    for fs in region.min_fs..=region.max_fs.min(p.w - 1) {
                        bad[[ss, fs]] = true;
                    }
                }
            }
            panels.push(PanelData {
                data: Array2::zeros((p.h, p.w)),
                bad,
                sat: Array2::from_elem((p.h, p.w), p.max_adu as f32),
            });
        }
        Image {
            panels,
            lambda,
            spectrum: Spectrum::monochromatic(lambda, det.beam.bandwidth),
            filename: String::new(),
            event: None,
            serial: 0,
            metadata: FxHashMap::default(),
            hit: false,
            peak_resolution: None,
            n_saturated_peaks: 0,
        }
    }

    /// Take a copy of the pixel data before the filters touch it
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            data: self.panels.iter().map(|p| p.data.clone()).collect(),
        }
    }

    /// Swap the pre-filter data back in. Integration must only ever see
    /// restored data.
    pub fn restore(&mut self, snapshot: Snapshot) {
        for (panel, data) in self.panels.iter_mut().zip(snapshot.data) {
            panel.data = data;
        }
    }

    /// Pixel value with mask check; None for bad or out-of-bounds pixels
    pub fn pixel(&self, panel: usize, fs: usize, ss: usize) -> Option<f32> {
        let p = self.panels.get(panel)?;
        if ss >= p.data.nrows() || fs >= p.data.ncols() || p.bad[[ss, fs]] {
            return None;
        }
        Some(p.data[[ss, fs]])
    }

    pub fn is_saturated(&self, panel: usize, fs: usize, ss: usize) -> bool {
        let p = &self.panels[panel];
        p.data[[ss, fs]] >= p.sat[[ss, fs]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{single_panel, BadRegion};

    #[test]
    fn snapshot_and_restore_revert_pixels() {
        let det = single_panel(8, 8, 0.1, 100e-6);
        let mut image = Image::new(&det, 1.3e-10);
        image.panels[0].data[[3, 4]] = 100.0;
        let snap = image.snapshot();
        image.panels[0].data[[3, 4]] = -5.0;
        image.restore(snap);
        assert_eq!(image.panels[0].data[[3, 4]], 100.0);
    }

    #[test]
    fn bad_regions_mask_pixels() {
        let mut det = single_panel(8, 8, 0.1, 100e-6);
        det.bad_regions.push(BadRegion {
            panel: String::from("q0"),
            min_fs: 1,
            max_fs: 2,
            min_ss: 1,
            max_ss: 2,
        });
        let image = Image::new(&det, 1.3e-10);
        assert!(image.pixel(0, 1, 1).is_none());
        assert!(image.pixel(0, 3, 3).is_some());
    }

    #[test]
    fn out_of_bounds_pixel_is_none() {
        let det = single_panel(4, 4, 0.1, 100e-6);
        let image = Image::new(&det, 1.3e-10);
        assert!(image.pixel(0, 4, 0).is_none());
        assert!(image.pixel(0, 0, 4).is_none());
        assert!(image.pixel(1, 0, 0).is_none());
    }
}
