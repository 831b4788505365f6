/// Diagnostic flags set during prediction and integration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReflectionStatus {
    /// A signal pixel was at or above the panel saturation value
    pub saturated: bool,
    /// The integration box would have left the panel
    pub edge_rejected: bool,
    /// Too few valid background pixels for the plane fit
    pub bad_background: bool,
    /// Intensity and esd are filled in
    pub measured: bool,
}

/// One predicted (and possibly measured) reflection. A reflection is owned
/// by exactly one reflection list, hence one crystal.
#[derive(Debug, Clone)]
pub struct Reflection {
    pub h: i32,
    pub k: i32,
    pub l: i32,
    /// Predicted detector position
    pub fs: f64,
    pub ss: f64,
    pub panel: usize,
    /// Signed distance from the Ewald sphere, m^-1
    pub excitation_error: f64,
    /// Predicted wavenumber at half-integration, m^-1
    pub kpred: f64,
    pub lorentz: f64,
    /// In [0, 1]
    pub partiality: f64,
    pub intensity: f64,
    pub esd: f64,
    pub redundancy: u32,
    /// Symmetry-reduced equivalent indices
    pub symmetric: (i32, i32, i32),
    pub status: ReflectionStatus,
}

impl Reflection {
    pub fn new(h: i32, k: i32, l: i32) -> Self {
        Reflection {
            h,
            k,
            l,
            fs: -1.0,
            ss: -1.0,
            panel: 0,
            excitation_error: 0.0,
            kpred: 0.0,
            lorentz: 1.0,
            partiality: 1.0,
            intensity: 0.0,
            esd: 0.0,
            redundancy: 1,
            symmetric: (h, k, l),
            status: ReflectionStatus::default(),
        }
    }

    /// Implausibly negative: measured well below zero relative to its error
    pub fn is_implausible(&self) -> bool {
        self.status.measured && self.esd > 0.0 && self.intensity < -5.0 * self.esd
    }
}

/// Reflections in prediction order, owned by one crystal
pub type RefList = Vec<Reflection>;
