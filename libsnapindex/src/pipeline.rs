//! The per-image pipeline: acquire, filter, peak-search, index, refine,
//! integrate, and format the chunk. One processor instance lives on each
//! worker; the dispatcher owns dispatch order and the output sink.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::config::{Config, PeakMethod};
use super::crystal::Crystal;
use super::error::{PeakSearchError, ProcessError};
use super::filters;
use super::geometry::Detector;
use super::hdf5_reader;
use super::image::Image;
use super::indexing::IndexingDriver;
use super::integration::{integrate_all, IntegrationParams};
use super::payload::parse_payload;
use super::peak_search::{search_zaef, ZaefParams};
use super::peakfinder8::{search_peakfinder8, Pf8Params};
use super::peakfinder9::{search_peakfinder9, Pf9Params};
use super::peaks::{estimate_peak_resolution, validate_peaks, Peak, PeakList};
use super::predict::{largest_q, predict_reflections, PartialityModel};
use super::refine::{refine_prediction, refine_radius};
use super::source::ImageJob;
use super::spectrum::Spectrum;
use super::stream::format_chunk;
use super::time_accounts::{Stage, TimeAccounts};
use super::worker_status::{SharedState, WorkerHealth};

/// What one processed job hands back to the dispatcher. `chunk` is None
/// when the configuration suppresses the record (non-hit with
/// stream_nonhits off).
pub struct ProcessOutcome {
    pub chunk: Option<String>,
    pub hit: bool,
    pub n_crystals: usize,
}

/// The dispatcher's seam: one processor per worker seat. Implementations
/// must poll the terminate flag at stage boundaries and return rather than
/// write partial output.
pub trait ImageProcessor: Send {
    fn process(&mut self, job: ImageJob, serial: u64) -> Result<ProcessOutcome, ProcessError>;

    /// Called once when the worker drains cleanly
    fn finish(&mut self) {}
}

pub struct PipelineProcessor {
    config: Arc<Config>,
    det: Arc<Detector>,
    driver: Arc<IndexingDriver>,
    shared: Arc<SharedState>,
    health: Arc<WorkerHealth>,
    worker_id: usize,
    taccs: TimeAccounts,
}

impl PipelineProcessor {
    pub fn new(
        config: Arc<Config>,
        det: Arc<Detector>,
        driver: Arc<IndexingDriver>,
        shared: Arc<SharedState>,
        health: Arc<WorkerHealth>,
        worker_id: usize,
    ) -> Self {
        Self {
            config,
            det,
            driver,
            shared,
            health,
            worker_id,
            taccs: TimeAccounts::new(),
        }
    }

    fn stage(&mut self, stage: Stage) -> Result<(), ProcessError> {
        if self.shared.should_terminate() {
            return Err(ProcessError::Cancelled);
        }
        self.taccs.set(stage);
        self.health.set_task(stage.label());
        Ok(())
    }

    /// Bounded wait for a file to appear: n retries at one-second spacing,
    /// -1 waits forever, 0 misses immediately.
    fn wait_for_file(&self, path: &Path) -> Result<(), ProcessError> {
        let mut budget = self.config.wait_for_file;
        let mut said_waiting = false;
        while !path.exists() {
            if budget == 0 {
                return Err(ProcessError::FileWaitExpired(path.to_path_buf()));
            }
            if self.shared.should_terminate() {
                return Err(ProcessError::Cancelled);
            }
            if !said_waiting {
                spdlog::info!("Waiting for {:?}", path);
                said_waiting = true;
            }
            std::thread::sleep(Duration::from_secs(1));
            self.health.ping();
            if budget > 0 {
                budget -= 1;
            }
        }
        Ok(())
    }

    fn load_file_job(
        &mut self,
        filename: &Path,
        event: &Option<String>,
        serial: u64,
    ) -> Result<(Image, Option<hdf5::File>), ProcessError> {
        self.stage(Stage::WaitFile)?;
        self.wait_for_file(filename)?;

        self.stage(Stage::LoadImage)?;
        let file = hdf5_reader::open_image_file(filename)?;
        let event_index: Option<usize> = event.as_ref().and_then(|e| e.parse().ok());

        let photon_ev = match (&self.det.beam.photon_energy_from, self.det.beam.photon_energy_ev)
        {
            (Some(key), _) => hdf5_reader::read_metadata_value(&file, key, event_index)?,
            (None, Some(ev)) => ev,
            (None, None) => {
                return Err(ProcessError::LoadError(
                    super::error::ImageFileError::MissingMetadata(String::from(
                        "photon energy",
                    )),
                ))
            }
        };
        let lambda = super::constants::ev_to_m(photon_ev);

        let mut image = Image::new(&self.det, lambda);
        image.filename = filename.to_string_lossy().into_owned();
        image.event = event.clone();
        image.serial = serial;
        if let Some(bw) = self.config.fix_bandwidth {
            image.spectrum = Spectrum::monochromatic(lambda, bw);
        }
        hdf5_reader::read_image_data(&file, &mut image, &self.det, event_index)?;

        for key in &self.config.copy_fields {
            match hdf5_reader::read_metadata_value(&file, key, event_index) {
                Ok(v) => {
                    image.metadata.insert(key.clone(), format!("{v}"));
                }
                Err(_) => {
                    spdlog::warn!("Copy field {key} not found in {:?}", filename);
                }
            }
        }

        Ok((image, Some(file)))
    }

    fn load_payload_job(
        &mut self,
        bytes: &[u8],
        serial: u64,
    ) -> Result<(Image, PeakList), ProcessError> {
        self.stage(Stage::LoadImage)?;
        let payload = parse_payload(bytes)?;
        spdlog::debug!(
            "Worker {} unpacked payload of {}",
            self.worker_id,
            human_bytes::human_bytes(bytes.len() as f64)
        );
        if payload.panels.len() != self.det.panels.len() {
            return Err(ProcessError::PayloadError(
                super::error::PayloadError::PanelCountMismatch {
                    want: self.det.panels.len(),
                    got: payload.panels.len(),
                },
            ));
        }

        let lambda = super::constants::ev_to_m(payload.photon_energy_ev);
        let mut image = Image::new(&self.det, lambda);
        image.filename = String::from("(payload)");
        image.event = Some(payload.event.clone());
        image.serial = serial;
        if let Some(bw) = self.config.fix_bandwidth {
            image.spectrum = Spectrum::monochromatic(lambda, bw);
        }
        for (panel, data) in image.panels.iter_mut().zip(payload.panels.iter()) {
            if panel.data.dim() != data.dim() {
                return Err(ProcessError::PayloadError(
                    super::error::PayloadError::PanelCountMismatch {
                        want: panel.data.len(),
                        got: data.len(),
                    },
                ));
            }
            panel.data.assign(data);
        }
        for (k, v) in &payload.metadata {
            image.metadata.insert(k.clone(), v.clone());
        }

        let shift = if self.config.half_pixel_shift { 0.5 } else { 0.0 };
        let peaks = payload
            .peaks
            .iter()
            .filter_map(|p| {
                let geom = self.det.panels.get(p.panel)?;
                let (fs, ss) = (p.fs + shift, p.ss + shift);
                if !geom.contains(fs, ss) {
                    return None;
                }
                Some(Peak {
                    fs,
                    ss,
                    panel: p.panel,
                    intensity: p.intensity,
                    background: 0.0,
                    snr: 0.0,
                    resolution: geom.resolution(fs, ss, lambda),
                })
            })
            .collect();

        Ok((image, peaks))
    }

    fn find_peaks(
        &mut self,
        image: &mut Image,
        file: Option<&hdf5::File>,
        payload_peaks: Option<PeakList>,
    ) -> Result<PeakList, ProcessError> {
        let config = Arc::clone(&self.config);
        let det = Arc::clone(&self.det);
        let mut prepared = true;
        let peaks = match config.peak_method {
            PeakMethod::Zaef => {
                prepared = false;
                search_zaef(
                    image,
                    &det,
                    &ZaefParams {
                        threshold: config.threshold,
                        min_squared_gradient: config.min_squared_gradient,
                        min_snr: config.min_snr,
                        radii: config.peak_radii,
                        use_saturated: config.use_saturated,
                    },
                )
            }
            PeakMethod::Peakfinder8 => {
                prepared = false;
                search_peakfinder8(
                    image,
                    &det,
                    &Pf8Params {
                        threshold: config.threshold,
                        min_snr: config.min_snr,
                        min_pix_count: config.min_pix_count,
                        max_pix_count: config.max_pix_count,
                        min_res: config.min_res,
                        max_res: config.max_res,
                        use_saturated: config.use_saturated,
                    },
                )
            }
            PeakMethod::Peakfinder9 => {
                prepared = false;
                search_peakfinder9(
                    image,
                    &det,
                    &Pf9Params {
                        min_snr_biggest_pix: config.min_snr_biggest_pix,
                        min_snr_peak_pix: config.min_snr_peak_pix,
                        min_snr: config.min_snr,
                        min_sig: config.min_sig,
                        min_peak_over_neighbour: config.min_peak_over_neighbour,
                        local_bg_radius: config.local_bg_radius,
                        use_saturated: config.use_saturated,
                    },
                )
            }
            PeakMethod::Hdf5 => {
                let file = file.ok_or(PeakSearchError::NeedsFile("hdf5"))?;
                hdf5_reader::read_peak_table(
                    file,
                    &config.peak_table_path,
                    &det,
                    image.lambda,
                    config.half_pixel_shift,
                )
                .map_err(PeakSearchError::TableError)?
            }
            PeakMethod::Cxi => {
                let file = file.ok_or(PeakSearchError::NeedsFile("cxi"))?;
                let event = image
                    .event
                    .as_ref()
                    .and_then(|e| e.parse().ok())
                    .unwrap_or(0);
                hdf5_reader::read_peak_table_cxi(
                    file,
                    &config.peak_table_path,
                    event,
                    &det,
                    image.lambda,
                    config.half_pixel_shift,
                )
                .map_err(PeakSearchError::TableError)?
            }
            PeakMethod::Payload => payload_peaks.ok_or(PeakSearchError::NoPayload)?,
        };

        // Prepared lists get revalidated against the pixel data unless the
        // user turned that off
        let peaks = if prepared && config.revalidate {
            validate_peaks(
                image,
                &det,
                peaks,
                &config.peak_radii,
                config.min_snr,
                config.use_saturated,
            )
        } else {
            peaks
        };

        Ok(peaks)
    }

    /// The 1/d limit to predict and integrate to
    fn prediction_limit(&self, image: &Image) -> f64 {
        let detector_limit = largest_q(&self.det, image.lambda);
        if !self.config.push_res.is_finite() {
            return detector_limit;
        }
        match image.peak_resolution {
            // push_res is configured in nm^-1 beyond the peak resolution
            Some(res) => (res + self.config.push_res * 1e9).min(detector_limit),
            None => detector_limit,
        }
    }
}

impl ImageProcessor for PipelineProcessor {
    fn process(&mut self, job: ImageJob, serial: u64) -> Result<ProcessOutcome, ProcessError> {
        // Acquire
        let (mut image, file, payload_peaks) = match &job {
            ImageJob::File { filename, event } => {
                let (image, file) = self.load_file_job(filename, event, serial)?;
                (image, file, None)
            }
            ImageJob::Payload(bytes) => {
                let (image, peaks) = self.load_payload_job(bytes, serial)?;
                (image, None, Some(peaks))
            }
        };

        // Snapshot before the filters; integration must see raw pixels
        self.stage(Stage::Filter)?;
        let snapshot = image.snapshot();
        if self.config.median_filter > 0 {
            filters::median_filter(&mut image, self.config.median_filter);
        }
        if self.config.noise_filter {
            filters::noise_filter(&mut image);
        }

        self.stage(Stage::ResolutionMask)?;
        if let Some(highres_angstrom) = self.config.highres {
            let cutoff = 1e10 / highres_angstrom;
            filters::mark_resolution_range_bad(&mut image, &self.det, cutoff);
        }

        self.stage(Stage::PeakSearch)?;
        let peaks = self.find_peaks(&mut image, file.as_ref(), payload_peaks)?;
        image.peak_resolution = estimate_peak_resolution(&peaks);
        spdlog::debug!(
            "Worker {}: serial {} has {} peaks",
            self.worker_id,
            serial,
            peaks.len()
        );

        let mut crystals: Vec<Crystal> = Vec::new();
        if peaks.len() >= self.config.min_peaks {
            image.hit = true;

            self.stage(Stage::Indexing)?;
            crystals = self.driver.index_image(&image, &self.det, &peaks);
        }

        // Restore the pre-filter data before anything reads intensities
        image.restore(snapshot);

        if !crystals.is_empty() {
            self.stage(Stage::PredictionParams)?;
            let max_res = self.prediction_limit(&image);
            for crystal in crystals.iter_mut() {
                match self.config.fix_profile_radius {
                    Some(r) => {
                        crystal.profile_radius = r;
                        crystal.mosaicity = 0.0;
                    }
                    None => {
                        if refine_radius(
                            crystal,
                            &image,
                            &self.det,
                            &peaks,
                            PartialityModel::Unity,
                            max_res,
                        )
                        .is_err()
                        {
                            spdlog::warn!("Radius determination failed on serial {serial}");
                        }
                    }
                }

                if self.config.refine {
                    match refine_prediction(
                        crystal,
                        &image,
                        &self.det,
                        &peaks,
                        None,
                        PartialityModel::XSphere,
                        max_res,
                    ) {
                        Ok(result) => {
                            image.lambda = result.lambda;
                            image.spectrum = Spectrum::monochromatic(
                                result.lambda,
                                self.det.beam.bandwidth,
                            );
                        }
                        Err(e) => {
                            spdlog::debug!("Prediction refinement skipped: {e}");
                        }
                    }
                }

                if let Err(e) = predict_reflections(
                    crystal,
                    &image,
                    &self.det,
                    PartialityModel::XSphere,
                    max_res,
                ) {
                    spdlog::warn!("Prediction failed on serial {serial}: {e}");
                    crystal.user_flag =
                        Some(super::crystal::RejectReason::PredictionFailed);
                }
            }

            self.stage(Stage::Integration)?;
            let summary = integrate_all(
                &image,
                &self.det,
                &mut crystals,
                &IntegrationParams {
                    method: self.config.int_method,
                    radii: self.config.int_radii,
                    integrate_saturated: self.config.integrate_saturated,
                },
            );
            let n_implausible: usize =
                crystals.iter().map(|c| c.n_implausible_reflections()).sum();
            if n_implausible > 0 {
                spdlog::info!(
                    "{} implausibly negative reflections in {} (serial {})",
                    n_implausible,
                    image.filename,
                    serial
                );
            }
            spdlog::debug!(
                "Worker {}: serial {} integrated {} reflections ({} saturated)",
                self.worker_id,
                serial,
                summary.n_measured,
                summary.n_saturated
            );
        }

        self.stage(Stage::StreamWrite)?;
        let good_crystals = crystals.iter().filter(|c| c.is_good()).count();
        let chunk = if image.hit || self.config.stream_nonhits {
            Some(format_chunk(
                &image,
                self.config.stream_peaks.then_some(&peaks),
                &crystals,
                &self.det,
                self.config.stream_refls,
            ))
        } else {
            None
        };

        self.taccs.set(Stage::Finalise);
        self.shared.record_image(image.hit, good_crystals);
        self.taccs.stop();

        Ok(ProcessOutcome {
            chunk,
            hit: image.hit,
            n_crystals: good_crystals,
        })
    }

    fn finish(&mut self) {
        self.taccs.stop();
        spdlog::debug!(
            "Worker {} time budget: {}",
            self.worker_id,
            self.taccs.report()
        );
    }
}
