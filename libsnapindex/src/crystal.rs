use super::cell::UnitCell;
use super::constants::INITIAL_PROFILE_RADIUS;
use super::reflection::RefList;

/// Why a crystal was marked unusable after indexing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    PredictionFailed,
    RefinementFailed,
    NonFiniteCell,
}

/// One indexing solution on an image: the oriented cell plus everything
/// integration attaches to it. An image may own zero or more crystals.
#[derive(Debug, Clone)]
pub struct Crystal {
    pub cell: UnitCell,
    /// Reflection profile radius, m^-1
    pub profile_radius: f64,
    /// Angular mosaic spread, radians
    pub mosaicity: f64,
    /// Overall scale factor
    pub osf: f64,
    pub bfactor: f64,
    pub reflections: RefList,
    /// Name of the backend which produced this solution
    pub indexed_by: String,
    pub user_flag: Option<RejectReason>,
}

impl Crystal {
    pub fn new(cell: UnitCell, indexed_by: &str) -> Self {
        Crystal {
            cell,
            profile_radius: INITIAL_PROFILE_RADIUS,
            mosaicity: 0.0,
            osf: 1.0,
            bfactor: 0.0,
            reflections: Vec::new(),
            indexed_by: indexed_by.to_string(),
            user_flag: None,
        }
    }

    pub fn is_good(&self) -> bool {
        self.user_flag.is_none()
    }

    pub fn n_implausible_reflections(&self) -> usize {
        self.reflections.iter().filter(|r| r.is_implausible()).count()
    }
}
