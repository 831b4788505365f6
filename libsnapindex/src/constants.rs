//! Physical constants and the default processing parameters.

/// Planck constant times speed of light, in eV m. Used to convert between
/// photon energy and wavelength.
pub const HC_EV_M: f64 = 1.986_445_857e-25 / 1.602_176_634e-19;

/// Convert a photon energy in eV to a wavelength in metres.
pub fn ev_to_m(ev: f64) -> f64 {
    HC_EV_M / ev
}

/// Convert a wavelength in metres to a photon energy in eV.
pub fn m_to_ev(m: f64) -> f64 {
    HC_EV_M / m
}

/// Default ADU threshold for the gradient peak search
pub const DEFAULT_THRESHOLD: f64 = 800.0;
/// Default minimum squared gradient for the gradient peak search
pub const DEFAULT_MIN_SQUARED_GRADIENT: f64 = 100_000.0;
/// Default minimum signal-to-noise ratio for accepted peaks
pub const DEFAULT_MIN_SNR: f64 = 5.0;

/// Default peak-measurement radii (pixels): signal, gap, background
pub const DEFAULT_PEAK_RADII: [f64; 3] = [4.0, 5.0, 7.0];
/// Default integration radii (pixels): signal, gap, background
pub const DEFAULT_INT_RADII: [f64; 3] = [4.0, 5.0, 7.0];

/// Default cell-comparison tolerances: a, b, c as percent, angles in degrees
pub const DEFAULT_TOLERANCES: [f64; 6] = [5.0, 5.0, 5.0, 1.5, 1.5, 1.5];

/// Starting profile radius before refinement, in reciprocal metres
pub const INITIAL_PROFILE_RADIUS: f64 = 2.0e7;

/// Largest profile radius the prediction refinement will accept (m^-1)
pub const MAX_PROFILE_RADIUS: f64 = 5.0e9;

/// Largest total reorientation the prediction refinement will accept (radians)
pub const MAX_REFINE_ROTATION: f64 = 5.0 * std::f64::consts::PI / 180.0;

/// Miller index magnitude above which prediction gives up on the cell
pub const MAX_MILLER_INDEX: i32 = 511;

/// Minimum number of background pixels for a valid ring integration
pub const MIN_BACKGROUND_PIXELS: usize = 10;

/// Default per-worker stall timeout, seconds
pub const DEFAULT_STALL_TIMEOUT: u64 = 60;

/// Default bound on the dispatcher's reorder buffer, in chunks
pub const DEFAULT_REORDER_BUFFER: usize = 64;

/// Default wall-clock budget for one external indexer invocation, seconds
pub const DEFAULT_BACKEND_TIMEOUT: u64 = 30;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_wavelength_round_trip() {
        let ev = 9300.0;
        let lambda = ev_to_m(ev);
        assert!((m_to_ev(lambda) - ev).abs() < 1e-6);
        // 9.3 keV is about 1.33 Angstrom
        assert!((lambda - 1.333e-10).abs() < 0.01e-10);
    }
}
