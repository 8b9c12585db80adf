//! Global derivatives of a 2D hit residual with respect to the sensor alignment parameters.
//!
//! The residual is `r = m − prediction` and the alignment parameters are the sensor
//! displacement (`dx, dy, dz`) and small-angle rotation (`α, β, γ`) with respect to the
//! nominal geometry. For a track crossing the sensor at local position `(x, y)` (relative to
//! the sensor centre) with slopes `(tx, ty)`, a plane displaced by `Δz = dz + α·y − β·x`
//! moves the crossing point by `(tx, ty)·Δz`, and the in-plane rotation `γ` moves the hit
//! by `γ·(−y, x)`:
//!
//! | dof     | ∂r_x    | ∂r_y    |
//! |---------|---------|---------|
//! | ShiftX  | −1      | 0       |
//! | ShiftY  | 0       | −1      |
//! | ShiftZ  | tx      | ty      |
//! | RotX    | y·tx    | y·ty    |
//! | RotY    | −x·tx   | −x·ty   |
//! | RotZ    | y       | −x      |
use nalgebra::Vector2;

use crate::alignment::Dof;

/// Derivative of the `(x, y)` residual with respect to one alignment parameter.
///
/// Arguments
/// -----------------
/// * `dof`: the alignment degree of freedom.
/// * `local`: track crossing point relative to the sensor centre (mm).
/// * `slopes`: track slopes `(dx/dz, dy/dz)` at the sensor.
///
/// Return
/// ----------
/// * `(∂r_x/∂p, ∂r_y/∂p)`.
pub fn residual_derivative(dof: Dof, local: &Vector2<f64>, slopes: &Vector2<f64>) -> Vector2<f64> {
    let (x, y) = (local.x, local.y);
    match dof {
        Dof::ShiftX => Vector2::new(-1.0, 0.0),
        Dof::ShiftY => Vector2::new(0.0, -1.0),
        Dof::ShiftZ => *slopes,
        Dof::RotX => slopes * y,
        Dof::RotY => slopes * -x,
        Dof::RotZ => Vector2::new(y, -x),
    }
}
