use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::constants::*;
use super::error::ConfigError;

/// Peak search method selector. See the modules of the same names for the
/// algorithms themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeakMethod {
    /// Gradient search (Zaefferer 2000)
    Zaef,
    /// Radial-background annulus search
    Peakfinder8,
    /// Local-background window search
    Peakfinder9,
    /// Precomputed table in the image file
    Hdf5,
    /// Precomputed table, CXI event-indexed layout
    Cxi,
    /// Peak table carried inside the in-memory payload
    Payload,
}

/// Reflection integration method selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntMethod {
    Rings,
    RingsCen,
    Prof2d,
    Prof2dCen,
}

impl IntMethod {
    pub fn recentre(&self) -> bool {
        matches!(self, IntMethod::RingsCen | IntMethod::Prof2dCen)
    }

    pub fn profile_fit(&self) -> bool {
        matches!(self, IntMethod::Prof2d | IntMethod::Prof2dCen)
    }
}

/// Structure representing the full processing configuration. Contains pathing,
/// peak search, indexing and integration parameters.
/// Configs are serializable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub geometry_path: PathBuf,
    pub cell_path: Option<PathBuf>,
    pub input_list_path: Option<PathBuf>,
    pub output_stream_path: PathBuf,
    pub temp_dir: PathBuf,
    pub n_workers: usize,

    // Peak search
    pub peak_method: PeakMethod,
    pub threshold: f64,
    pub min_squared_gradient: f64,
    pub min_snr: f64,
    pub min_pix_count: usize,
    pub max_pix_count: usize,
    pub local_bg_radius: usize,
    pub min_res: f64,
    pub max_res: f64,
    pub min_snr_biggest_pix: f64,
    pub min_snr_peak_pix: f64,
    pub min_sig: f64,
    pub min_peak_over_neighbour: f64,
    pub peak_table_path: String,
    pub half_pixel_shift: bool,
    pub revalidate: bool,
    pub use_saturated: bool,
    pub min_peaks: usize,
    pub peak_radii: [f64; 3],

    // Filters
    pub median_filter: usize,
    pub noise_filter: bool,
    pub highres: Option<f64>,

    // Indexing
    pub indexing_methods: Vec<String>,
    pub tolerances: [f64; 6],
    pub check_cell_axes: bool,
    pub check_cell_combinations: bool,
    pub check_peaks: bool,
    pub min_peak_fraction: f64,
    pub retry: bool,
    pub multi: bool,
    pub refine: bool,
    pub backend_timeout_secs: u64,
    pub solutions_path: Option<PathBuf>,
    pub external_commands: Vec<ExternalCommand>,

    // Prediction and integration
    pub fix_profile_radius: Option<f64>,
    pub fix_bandwidth: Option<f64>,
    pub push_res: f64,
    pub int_method: IntMethod,
    pub int_radii: [f64; 3],
    pub integrate_saturated: bool,
    pub overpredict: bool,

    // Stream contents
    pub stream_peaks: bool,
    pub stream_refls: bool,
    pub stream_nonhits: bool,
    pub copy_fields: Vec<String>,

    // Dispatcher
    pub wait_for_file: i64,
    pub stall_timeout_secs: u64,
    pub reorder_buffer: usize,
}

/// An external indexer registration: a backend name to be listed in
/// `indexing_methods`, plus the command line to run for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalCommand {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
}

impl Default for Config {
    /// Generate a new Config object with the standard defaults. Paths are
    /// empty and must be filled in before use.
    fn default() -> Self {
        Self {
            geometry_path: PathBuf::new(),
            cell_path: None,
            input_list_path: None,
            output_stream_path: PathBuf::from("snapindex.stream"),
            temp_dir: std::env::temp_dir(),
            n_workers: 1,

            peak_method: PeakMethod::Zaef,
            threshold: DEFAULT_THRESHOLD,
            min_squared_gradient: DEFAULT_MIN_SQUARED_GRADIENT,
            min_snr: DEFAULT_MIN_SNR,
            min_pix_count: 2,
            max_pix_count: 200,
            local_bg_radius: 3,
            min_res: 0.0,
            max_res: 1200.0,
            min_snr_biggest_pix: 7.0,
            min_snr_peak_pix: 6.0,
            min_sig: 11.0,
            min_peak_over_neighbour: -f64::INFINITY,
            peak_table_path: String::from("/processing/hitfinder/peakinfo"),
            half_pixel_shift: true,
            revalidate: true,
            use_saturated: true,
            min_peaks: 0,
            peak_radii: DEFAULT_PEAK_RADII,

            median_filter: 0,
            noise_filter: false,
            highres: None,

            indexing_methods: vec![String::from("vecsearch")],
            tolerances: DEFAULT_TOLERANCES,
            check_cell_axes: true,
            check_cell_combinations: false,
            check_peaks: true,
            min_peak_fraction: 0.5,
            retry: true,
            multi: false,
            refine: true,
            backend_timeout_secs: DEFAULT_BACKEND_TIMEOUT,
            solutions_path: None,
            external_commands: Vec::new(),

            fix_profile_radius: None,
            fix_bandwidth: None,
            push_res: f64::INFINITY,
            int_method: IntMethod::Rings,
            int_radii: DEFAULT_INT_RADII,
            integrate_saturated: false,
            overpredict: false,

            stream_peaks: true,
            stream_refls: true,
            stream_nonhits: true,
            copy_fields: Vec::new(),

            wait_for_file: 0,
            stall_timeout_secs: DEFAULT_STALL_TIMEOUT,
            reorder_buffer: DEFAULT_REORDER_BUFFER,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file.
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Check the fields which have to be consistent before dispatch starts.
    /// Violations here are fatal per the error handling policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_workers < 1 {
            return Err(ConfigError::Invalid(String::from(
                "n_workers must be at least 1",
            )));
        }
        if self.geometry_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(String::from(
                "geometry_path is required",
            )));
        }
        let [inn, mid, out] = self.int_radii;
        if !(inn > 0.0 && inn < mid && mid < out) {
            return Err(ConfigError::Invalid(format!(
                "integration radii must satisfy 0 < inn < mid < out, got {inn},{mid},{out}"
            )));
        }
        let [pinn, pmid, pout] = self.peak_radii;
        if !(pinn > 0.0 && pinn < pmid && pmid < pout) {
            return Err(ConfigError::Invalid(format!(
                "peak radii must satisfy 0 < inn < mid < out, got {pinn},{pmid},{pout}"
            )));
        }
        if self.tolerances.iter().any(|t| *t < 0.0) {
            return Err(ConfigError::Invalid(String::from(
                "tolerances must be non-negative",
            )));
        }
        if self.indexing_methods.is_empty() && self.min_peaks > 0 {
            spdlog::warn!("No indexing methods configured; images will be peak-searched only");
        }
        if self.reorder_buffer == 0 {
            return Err(ConfigError::Invalid(String::from(
                "reorder_buffer must be at least 1",
            )));
        }
        Ok(())
    }

    /// Fractional length tolerances (a, b, c), converted from percent
    pub fn length_tolerances(&self) -> [f64; 3] {
        [
            self.tolerances[0] / 100.0,
            self.tolerances[1] / 100.0,
            self.tolerances[2] / 100.0,
        ]
    }

    /// Absolute angle tolerances in radians
    pub fn angle_tolerances(&self) -> [f64; 3] {
        [
            self.tolerances[3].to_radians(),
            self.tolerances[4].to_radians(),
            self.tolerances[5].to_radians(),
        ]
    }
}
