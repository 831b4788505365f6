//! The indexing driver: cell matching, candidate validation, retry and
//! multi-lattice extraction around an ordered list of indexer backends.

use super::cell::UnitCell;
use super::cell_match::{cell_error_figure, match_cell, Tolerances};
use super::config::Config;
use super::crystal::Crystal;
use super::error::IndexerError;
use super::geometry::Detector;
use super::image::Image;
use super::peaks::PeakList;
use super::predict::PartialityModel;

/// The capability set every backend satisfies. Preparation is construction,
/// cleanup is Drop; external-process backends wrap their protocol behind
/// the same face.
pub trait Indexer: Send + Sync {
    fn name(&self) -> &str;

    /// Produce zero or more candidate cells for this image. An empty result
    /// is a normal miss; Err is reserved for backend faults (timeouts,
    /// crashed tools), which the driver treats as a miss and reports.
    fn index(
        &self,
        image: &Image,
        det: &Detector,
        peaks: &PeakList,
    ) -> Result<Vec<UnitCell>, IndexerError>;
}

/// Bounded retry rounds when no backend accepts
const MAX_RETRY_ROUNDS: usize = 4;
/// Bounded number of lattices the multi loop may extract
const MAX_CRYSTALS: usize = 8;
/// Pixel radius within which a prediction accounts for a peak
const PEAK_MATCH_RADIUS: f64 = 4.0;
/// Profile radius used for the driver's own trial predictions
const CHECK_PROFILE_RADIUS: f64 = 1.0e8;

pub struct IndexingDriver {
    backends: Vec<Box<dyn Indexer>>,
    reference: Option<UnitCell>,
    tolerances: Tolerances,
    check_cell_axes: bool,
    check_cell_combinations: bool,
    check_peaks: bool,
    min_peak_fraction: f64,
    retry: bool,
    multi: bool,
    max_res: f64,
}

/// Build the configured backend list. Unknown names are a fatal
/// configuration error; methods needing a cell without one configured too.
pub fn build_backends(
    config: &Config,
    reference: Option<&UnitCell>,
) -> Result<Vec<Box<dyn Indexer>>, IndexerError> {
    let mut backends: Vec<Box<dyn Indexer>> = Vec::new();
    for name in &config.indexing_methods {
        match name.as_str() {
            "vecsearch" => {
                let cell = reference
                    .cloned()
                    .ok_or_else(|| IndexerError::NeedsCell(name.clone()))?;
                backends.push(Box::new(super::vecsearch::VecSearch::new(
                    cell,
                    config.length_tolerances(),
                    config.angle_tolerances(),
                )));
            }
            "file" => {
                let path = config
                    .solutions_path
                    .as_ref()
                    .ok_or_else(|| IndexerError::UnknownMethod(String::from(
                        "indexing method 'file' needs solutions_path",
                    )))?;
                backends.push(Box::new(super::inject::FileIndexer::from_file(path)?));
            }
            other => {
                let ext = config
                    .external_commands
                    .iter()
                    .find(|c| c.name == other)
                    .ok_or_else(|| IndexerError::UnknownMethod(other.to_string()))?;
                backends.push(Box::new(super::external::ExternalIndexer::new(
                    ext.clone(),
                    config.temp_dir.clone(),
                    config.backend_timeout_secs,
                )));
            }
        }
    }
    Ok(backends)
}

impl IndexingDriver {
    pub fn new(
        config: &Config,
        reference: Option<UnitCell>,
        max_res: f64,
    ) -> Result<Self, IndexerError> {
        let backends = build_backends(config, reference.as_ref())?;
        Ok(IndexingDriver {
            backends,
            reference,
            tolerances: Tolerances::new(config.length_tolerances(), config.angle_tolerances()),
            check_cell_axes: config.check_cell_axes,
            check_cell_combinations: config.check_cell_combinations,
            check_peaks: config.check_peaks,
            min_peak_fraction: config.min_peak_fraction,
            retry: config.retry,
            multi: config.multi,
            max_res,
        })
    }

    pub fn n_backends(&self) -> usize {
        self.backends.len()
    }

    /// Fraction of peaks with a predicted reflection within the match
    /// radius for this candidate cell
    fn peak_fraction(
        &self,
        cell: &UnitCell,
        image: &Image,
        det: &Detector,
        peaks: &PeakList,
    ) -> f64 {
        let mut trial = Crystal::new(cell.clone(), "check");
        trial.profile_radius = CHECK_PROFILE_RADIUS;
        if predict_unity(image, det, &mut trial, self.max_res).is_err() {
            return 0.0;
        }
        if peaks.is_empty() {
            return 0.0;
        }
        let matched = peaks
            .iter()
            .filter(|p| {
                trial.reflections.iter().any(|r| {
                    r.panel == p.panel
                        && ((r.fs - p.fs).powi(2) + (r.ss - p.ss).powi(2)).sqrt()
                            <= PEAK_MATCH_RADIUS
                })
            })
            .count();
        matched as f64 / peaks.len() as f64
    }

    /// Validate one candidate: cell check then peak check. Returns the
    /// (possibly axis-permuted) cell and its figure of merit.
    fn validate_candidate(
        &self,
        candidate: &UnitCell,
        image: &Image,
        det: &Detector,
        peaks: &PeakList,
    ) -> Option<(UnitCell, f64)> {
        let check_cell = self.check_cell_axes || self.check_cell_combinations;
        let (cell, fom) = match (&self.reference, check_cell) {
            (Some(reference), true) => {
                let matched = match_cell(
                    candidate,
                    reference,
                    &self.tolerances,
                    self.check_cell_combinations,
                )?;
                let fom = cell_error_figure(&matched, reference, &self.tolerances)?;
                (matched, fom)
            }
            _ => (candidate.clone(), 0.0),
        };

        if !cell.is_sensible() || !cell.is_right_handed() {
            return None;
        }

        if self.check_peaks {
            let fraction = self.peak_fraction(&cell, image, det, peaks);
            if fraction < self.min_peak_fraction {
                spdlog::debug!(
                    "Candidate rejected by peak check ({:.0}% < {:.0}%)",
                    fraction * 100.0,
                    self.min_peak_fraction * 100.0
                );
                return None;
            }
        }

        Some((cell, fom))
    }

    /// One pass over the backend list. The first backend with a candidate
    /// surviving validation wins; among its candidates the smallest cell
    /// error figure is preferred.
    fn single_pass(&self, image: &Image, det: &Detector, peaks: &PeakList) -> Option<Crystal> {
        for backend in &self.backends {
            let candidates = match backend.index(image, det, peaks) {
                Ok(c) => c,
                Err(e) => {
                    spdlog::warn!("Indexer {} failed on this image: {e}", backend.name());
                    continue;
                }
            };
            if candidates.is_empty() {
                continue;
            }

            let mut best: Option<(f64, UnitCell)> = None;
            for cand in &candidates {
                if let Some((cell, fom)) = self.validate_candidate(cand, image, det, peaks) {
                    match &best {
                        Some((b, _)) if *b <= fom => {}
                        _ => best = Some((fom, cell)),
                    }
                }
            }
            if let Some((_, cell)) = best {
                return Some(Crystal::new(cell, backend.name()));
            }
        }
        None
    }

    /// Remove the peaks accounted for by a crystal's predictions
    fn remove_explained(
        &self,
        crystal: &Crystal,
        image: &Image,
        det: &Detector,
        peaks: PeakList,
    ) -> PeakList {
        let mut trial = crystal.clone();
        trial.profile_radius = CHECK_PROFILE_RADIUS;
        if predict_unity(image, det, &mut trial, self.max_res).is_err() {
            return peaks;
        }
        peaks
            .into_iter()
            .filter(|p| {
                !trial.reflections.iter().any(|r| {
                    r.panel == p.panel
                        && ((r.fs - p.fs).powi(2) + (r.ss - p.ss).powi(2)).sqrt()
                            <= PEAK_MATCH_RADIUS
                })
            })
            .collect()
    }

    /// Run the full single-pass / retry / multi-lattice loop for one image
    pub fn index_image(&self, image: &Image, det: &Detector, peaks: &PeakList) -> Vec<Crystal> {
        let mut working = peaks.clone();
        let mut crystals: Vec<Crystal> = Vec::new();
        let mut retry_round = 0usize;

        loop {
            match self.single_pass(image, det, &working) {
                Some(crystal) => {
                    spdlog::debug!(
                        "Accepted lattice {} from {}",
                        crystals.len(),
                        crystal.indexed_by
                    );
                    let accepted = crystal;
                    working = self.remove_explained(&accepted, image, det, working);
                    crystals.push(accepted);
                    retry_round = 0;
                    if !self.multi || crystals.len() >= MAX_CRYSTALS || working.len() < 5 {
                        break;
                    }
                }
                None => {
                    // Retry with the weakest peaks deleted, a bounded number
                    // of times, only while nothing has been accepted yet
                    if crystals.is_empty()
                        && self.retry
                        && retry_round < MAX_RETRY_ROUNDS
                        && working.len() > 8
                    {
                        let cut = (working.len() / 10).max(1);
                        working.sort_by(|a, b| b.snr.total_cmp(&a.snr));
                        working.truncate(working.len() - cut);
                        retry_round += 1;
                        continue;
                    }
                    break;
                }
            }
        }

        crystals
    }
}

/// Sharp-sphere trial prediction used by the driver's own checks
fn predict_unity(
    image: &Image,
    det: &Detector,
    crystal: &mut Crystal,
    max_res: f64,
) -> Result<(), super::error::PredictionError> {
    super::predict::predict_reflections(crystal, image, det, PartialityModel::Unity, max_res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::LatticeType;
    use crate::geometry::single_panel;
    use crate::peaks::Peak;

    fn cubic_cell() -> UnitCell {
        let half_pi = std::f64::consts::FRAC_PI_2;
        UnitCell::from_parameters(50e-10, 50e-10, 50e-10, half_pi, half_pi, half_pi)
            .unwrap()
            .with_lattice(LatticeType::Cubic, 'P')
    }

    fn synthetic_peaks(
        cell: &UnitCell,
        image: &Image,
        det: &Detector,
    ) -> PeakList {
        let mut crystal = Crystal::new(cell.clone(), "truth");
        crystal.profile_radius = 2.5e7;
        crate::predict::predict_reflections(
            &mut crystal,
            image,
            det,
            PartialityModel::XSphere,
            2.2e9,
        )
        .unwrap();
        crystal
            .reflections
            .iter()
            .enumerate()
            .map(|(i, r)| Peak {
                fs: r.fs,
                ss: r.ss,
                panel: r.panel,
                intensity: 5000.0 - i as f64,
                background: 10.0,
                snr: 30.0,
                resolution: 0.0,
            })
            .collect()
    }

    fn driver_config() -> Config {
        let mut config = Config::default();
        config.indexing_methods = vec![String::from("vecsearch")];
        config.check_peaks = true;
        config.min_peak_fraction = 0.5;
        config
    }

    #[test]
    fn driver_indexes_single_lattice() {
        let det = single_panel(512, 512, 0.08, 110e-6);
        let image = Image::new(&det, 1.3e-10);
        let truth = cubic_cell().rotated([0.2, 0.7, 0.3], 0.5);
        let peaks = synthetic_peaks(&truth, &image, &det);

        let driver = IndexingDriver::new(&driver_config(), Some(cubic_cell()), 2.2e9).unwrap();
        let crystals = driver.index_image(&image, &det, &peaks);
        assert_eq!(crystals.len(), 1);
        let (a, b, c, ..) = crystals[0].cell.parameters();
        for len in [a, b, c] {
            assert!((len - 50e-10).abs() / 50e-10 < 0.05);
        }
        assert_eq!(crystals[0].indexed_by, "vecsearch");
    }

    #[test]
    fn multi_extracts_two_lattices() {
        let det = single_panel(512, 512, 0.08, 110e-6);
        let image = Image::new(&det, 1.3e-10);
        let lat1 = cubic_cell().rotated([0.2, 0.7, 0.3], 0.5);
        let lat2 = cubic_cell().rotated([0.0, 0.0, 1.0], 30f64.to_radians());
        let mut peaks = synthetic_peaks(&lat1, &image, &det);
        peaks.extend(synthetic_peaks(&lat2, &image, &det));

        let mut config = driver_config();
        config.multi = true;
        // Each lattice only explains about half the list
        config.min_peak_fraction = 0.3;
        let driver = IndexingDriver::new(&config, Some(cubic_cell()), 2.2e9).unwrap();
        let crystals = driver.index_image(&image, &det, &peaks);
        assert_eq!(crystals.len(), 2, "expected both lattices");

        // The union of the two solutions should explain nearly every peak
        let mut remaining = peaks.clone();
        for c in &crystals {
            remaining = driver.remove_explained(c, &image, &det, remaining);
        }
        let covered = 1.0 - remaining.len() as f64 / peaks.len() as f64;
        assert!(covered >= 0.95, "only {:.0}% covered", covered * 100.0);
    }

    #[test]
    fn no_backends_accepting_yields_no_crystals() {
        let det = single_panel(256, 256, 0.08, 110e-6);
        let image = Image::new(&det, 1.3e-10);
        // Random scatter peaks: not a lattice
        let peaks: PeakList = (0..40)
            .map(|i| Peak {
                fs: 20.0 + (i * 37 % 200) as f64,
                ss: 15.0 + (i * 53 % 210) as f64,
                panel: 0,
                intensity: 100.0,
                background: 5.0,
                snr: 8.0,
                resolution: 0.0,
            })
            .collect();
        let driver = IndexingDriver::new(&driver_config(), Some(cubic_cell()), 2.2e9).unwrap();
        let crystals = driver.index_image(&image, &det, &peaks);
        assert!(crystals.is_empty());
    }

    #[test]
    fn unknown_method_is_a_setup_error() {
        let mut config = driver_config();
        config.indexing_methods = vec![String::from("nonesuch")];
        assert!(IndexingDriver::new(&config, Some(cubic_cell()), 2e9).is_err());
    }

    #[test]
    fn vecsearch_without_cell_is_a_setup_error() {
        let config = driver_config();
        assert!(IndexingDriver::new(&config, None, 2e9).is_err());
    }
}
