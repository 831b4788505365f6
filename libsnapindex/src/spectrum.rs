use serde::{Deserialize, Serialize};

/// One Gaussian component of the incident spectrum, in k = 1/lambda space
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpectrumGaussian {
    /// Centre wavenumber, m^-1
    pub kcen: f64,
    /// Standard deviation, m^-1
    pub sigma: f64,
    /// Relative weight
    pub area: f64,
}

/// The incident spectrum as a weighted sum of Gaussians in k.
///
/// A monochromatic beam is a single narrow Gaussian; pink-beam data carries
/// several components. Components are kept sorted by descending weight so
/// truncated evaluation sees the dominant ones first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spectrum {
    gaussians: Vec<SpectrumGaussian>,
}

impl Spectrum {
    pub fn new(mut gaussians: Vec<SpectrumGaussian>) -> Self {
        gaussians.sort_by(|a, b| b.area.total_cmp(&a.area));
        Self { gaussians }
    }

    /// A single-Gaussian spectrum from a wavelength and fractional bandwidth
    pub fn monochromatic(lambda: f64, bandwidth: f64) -> Self {
        let kcen = 1.0 / lambda;
        Self {
            gaussians: vec![SpectrumGaussian {
                kcen,
                sigma: kcen * bandwidth,
                area: 1.0,
            }],
        }
    }

    pub fn gaussians(&self) -> &[SpectrumGaussian] {
        &self.gaussians
    }

    pub fn is_empty(&self) -> bool {
        self.gaussians.is_empty()
    }

    /// Weighted mean wavenumber, m^-1
    pub fn mean_k(&self) -> f64 {
        let wsum: f64 = self.gaussians.iter().map(|g| g.area).sum();
        if wsum == 0.0 {
            return 0.0;
        }
        self.gaussians.iter().map(|g| g.area * g.kcen).sum::<f64>() / wsum
    }
}
