use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::GeometryError;
use super::matrix::{solve3, Mat3, Vec3};

/// One rigid detector panel. Positions are described by an affine mapping
/// from (fs, ss) pixel indices to the lab frame: the fs and ss basis vectors
/// give the lab-space step per pixel, `corner` is the lab position of pixel
/// (0, 0) in pixel units, `clen` is the camera length along the beam and
/// `res` converts pixels to metres (pixels per metre).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Panel {
    pub name: String,
    pub w: usize,
    pub h: usize,
    pub fs: [f64; 3],
    pub ss: [f64; 3],
    pub corner: [f64; 2],
    pub clen: f64,
    #[serde(default)]
    pub clen_from: Option<String>,
    pub res: f64,
    #[serde(default = "default_adu_per_photon")]
    pub adu_per_photon: f64,
    #[serde(default = "default_max_adu")]
    pub max_adu: f64,
    #[serde(default)]
    pub data_path: Option<String>,
    #[serde(default)]
    pub mask_path: Option<String>,
}

fn default_adu_per_photon() -> f64 {
    1.0
}

fn default_max_adu() -> f64 {
    f64::INFINITY
}

/// A rectangle of pixels to mark bad on one panel, inclusive bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadRegion {
    pub panel: String,
    pub min_fs: usize,
    pub max_fs: usize,
    pub min_ss: usize,
    pub max_ss: usize,
}

/// Beam parameters: either a fixed photon energy or the name of a per-image
/// metadata field carrying it, plus the fractional bandwidth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beam {
    #[serde(default)]
    pub photon_energy_ev: Option<f64>,
    #[serde(default)]
    pub photon_energy_from: Option<String>,
    #[serde(default = "default_bandwidth")]
    pub bandwidth: f64,
}

fn default_bandwidth() -> f64 {
    1.0e-8
}

/// The immutable detector description: an ordered set of panels plus beam
/// parameters. Built once at startup and shared read-only with all workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detector {
    pub panels: Vec<Panel>,
    pub beam: Beam,
    #[serde(default)]
    pub bad_regions: Vec<BadRegion>,
}

impl Panel {
    /// Lab-frame position of a pixel centre, metres
    pub fn lab_position(&self, fs: f64, ss: f64) -> Vec3 {
        [
            (self.corner[0] + fs * self.fs[0] + ss * self.ss[0]) / self.res,
            (self.corner[1] + fs * self.fs[1] + ss * self.ss[1]) / self.res,
            self.clen + (fs * self.fs[2] + ss * self.ss[2]) / self.res,
        ]
    }

    /// Scattering vector of a pixel for wavenumber k = 1/lambda (m^-1)
    pub fn q_vector(&self, fs: f64, ss: f64, k: f64) -> Vec3 {
        let [x, y, z] = self.lab_position(fs, ss);
        let norm = 1.0 / (x * x + y * y + z * z).sqrt();
        [k * x * norm, k * y * norm, k * (z * norm - 1.0)]
    }

    /// 1/d of a pixel (modulus of the scattering vector), m^-1
    pub fn resolution(&self, fs: f64, ss: f64, lambda: f64) -> f64 {
        let q = self.q_vector(fs, ss, 1.0 / lambda);
        super::matrix::modulus(&q)
    }

    /// Radius of a pixel from the beam axis, in pixel units
    pub fn pixel_radius(&self, fs: f64, ss: f64) -> f64 {
        let [x, y, _] = self.lab_position(fs, ss);
        (x * x + y * y).sqrt() * self.res
    }

    pub fn contains(&self, fs: f64, ss: f64) -> bool {
        fs >= 0.0 && fs < self.w as f64 && ss >= 0.0 && ss < self.h as f64
    }

    /// Project a reciprocal-space point onto this panel given the predicted
    /// wavenumber. Returns the (fs, ss) even when it lies outside the panel
    /// rectangle; callers check `contains` when that matters.
    pub fn project(&self, xl: f64, yl: f64, zl: f64, k: f64) -> Option<(f64, f64)> {
        let tta = (xl * xl + yl * yl).sqrt().atan2(k + zl);
        let phi = yl.atan2(xl);

        let t: Vec3 = [tta.sin() * phi.cos(), tta.sin() * phi.sin(), tta.cos()];
        let m: Mat3 = [
            [self.corner[0], self.fs[0], self.ss[0]],
            [self.corner[1], self.fs[1], self.ss[1]],
            [self.clen * self.res, self.fs[2], self.ss[2]],
        ];
        let v = solve3(&m, &t)?;
        let one_over_mu = v[0];
        if one_over_mu == 0.0 || !one_over_mu.is_finite() {
            return None;
        }
        Some((v[1] / one_over_mu, v[2] / one_over_mu))
    }
}

impl Detector {
    /// Read a detector description from a YAML file and validate it
    pub fn from_file(path: &Path) -> Result<Self, GeometryError> {
        if !path.exists() {
            return Err(GeometryError::BadFilePath(path.to_path_buf()));
        }
        let yaml_str = std::fs::read_to_string(path)?;
        let det = serde_yaml::from_str::<Self>(&yaml_str)?;
        det.validate()?;
        Ok(det)
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.panels.is_empty() {
            return Err(GeometryError::NoPanels);
        }
        for p in &self.panels {
            if p.w == 0 || p.h == 0 {
                return Err(GeometryError::EmptyPanel(p.name.clone()));
            }
            let fs_len = super::matrix::modulus(&p.fs);
            let ss_len = super::matrix::modulus(&p.ss);
            if fs_len == 0.0 || ss_len == 0.0 {
                return Err(GeometryError::DegenerateBasis(p.name.clone()));
            }
        }
        Ok(())
    }

    pub fn panel_index(&self, name: &str) -> Option<usize> {
        self.panels.iter().position(|p| p.name == name)
    }

    /// Find the panel on which a reciprocal-space point lands, if any.
    /// Returns (panel index, fs, ss).
    pub fn locate_peak(&self, xl: f64, yl: f64, zl: f64, k: f64) -> Option<(usize, f64, f64)> {
        for (pi, p) in self.panels.iter().enumerate() {
            if let Some((fs, ss)) = p.project(xl, yl, zl, k) {
                if p.contains(fs, ss) {
                    return Some((pi, fs, ss));
                }
            }
        }
        None
    }

    /// Short description for the stream header
    pub fn digest(&self) -> String {
        format!("{} panel(s)", self.panels.len())
    }
}

/// Build a simple single-panel detector, useful for synthetic data.
/// The panel is centred on the beam with fs along lab x and ss along lab y.
pub fn single_panel(w: usize, h: usize, clen: f64, pixel_size: f64) -> Detector {
    let res = 1.0 / pixel_size;
    Detector {
        panels: vec![Panel {
            name: String::from("q0"),
            w,
            h,
            fs: [1.0, 0.0, 0.0],
            ss: [0.0, 1.0, 0.0],
            corner: [-(w as f64) / 2.0, -(h as f64) / 2.0],
            clen,
            clen_from: None,
            res,
            adu_per_photon: 1.0,
            max_adu: f64::INFINITY,
            data_path: None,
            mask_path: None,
        }],
        beam: Beam {
            photon_energy_ev: Some(9300.0),
            photon_energy_from: None,
            bandwidth: 1.0e-8,
        },
        bad_regions: Vec::new(),
    }
}
