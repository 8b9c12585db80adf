//! Multiple-scattering width in the small-angle approximation (Highland formula).
use crate::constants::{HIGHLAND_LOG_COEFF, HIGHLAND_SCALE_GEV};

/// RMS projected scattering angle `θ0` (rad) of a particle crossing `x_over_x0` radiation
/// lengths, for `β = 1`.
///
/// ```text
/// θ0 = 13.6 MeV / p · |z| · sqrt(x/X0) · (1 + 0.038 · ln(x/X0 · z²))
/// ```
///
/// Arguments
/// -----------------
/// * `x_over_x0`: material traversed, already corrected for the track inclination.
/// * `momentum_gev`: particle momentum (GeV/c), must be positive.
/// * `charge`: particle charge in units of the elementary charge.
///
/// Return
/// ----------
/// * `θ0`, or `0.0` when there is no material. The logarithmic correction is clamped so
///   that the width never becomes negative for extremely thin layers.
pub fn highland_theta0(x_over_x0: f64, momentum_gev: f64, charge: f64) -> f64 {
    if x_over_x0 <= 0.0 || momentum_gev <= 0.0 {
        return 0.0;
    }
    let z2 = charge * charge;
    let log_term = (1.0 + HIGHLAND_LOG_COEFF * (x_over_x0 * z2).ln()).max(0.0);
    HIGHLAND_SCALE_GEV / momentum_gev * charge.abs() * x_over_x0.sqrt() * log_term
}
