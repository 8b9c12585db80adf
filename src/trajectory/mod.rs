//! # Broken-line trajectory model
//!
//! A [`Trajectory`] is the sequence of interaction points of one track with the telescope,
//! strictly ordered by path length. Each [`TrajectoryPoint`] may carry
//!
//! * a [`Measurement`]: the hit position and its covariance in the plane,
//! * a [`Scatterer`]: the variance of the kink angle caused by the plane material,
//!
//! or both. Between two consecutive points the particle moves on a straight line, or on a
//! parabola when a magnetic field bends it (see [`Bending`]).
//!
//! The path length is measured along the beam axis from the first point, so that offsets
//! are transverse positions `(x, y)` and slopes are `dx/dz`, `dy/dz`.
//!
//! Trajectories are built by [`assembler::TrajectoryAssembler`] and consumed by the
//! broken-line fit in [`crate::fit`].
use nalgebra::{Matrix2, Vector2};

use crate::constants::{Millimeter, SensorId};

pub mod assembler;
pub mod scattering;

/// Position measurement attached to a trajectory point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Hit position `(x, y)` in the telescope frame (mm)
    pub position: Vector2<f64>,
    /// Covariance of the position (mm²)
    pub covariance: Matrix2<f64>,
    /// `false` for hits on planes excluded from the fit: they only get residuals.
    pub active: bool,
}

/// Multiple scattering at a trajectory point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scatterer {
    /// Variance of the kink angle in x and y (rad²)
    pub variance: Vector2<f64>,
}

/// Deflection of a charged track by a magnetic field.
///
/// The fitted curvature `κ` (mm⁻¹) bends the trajectory in the transverse `direction`:
/// between points `a` and `b`, `u(s) = linear(s) + ½ κ (s − s_a)(s − s_b) · direction`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bending {
    /// Unit vector of the bending direction in the transverse plane
    pub direction: Vector2<f64>,
    /// Curvature expected from the beam momentum (mm⁻¹)
    pub nominal_curvature: f64,
}

/// One interaction point of the trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryPoint {
    pub sensor_id: SensorId,
    /// Path length from the first point (mm)
    pub path_length: Millimeter,
    /// Distance to the previous point (`0.0` for the first one)
    pub step: Millimeter,
    /// Transverse position of the sensor centre, origin of the local frame
    pub origin: Vector2<f64>,
    pub measurement: Option<Measurement>,
    pub scatterer: Option<Scatterer>,
}

impl TrajectoryPoint {
    pub fn is_measured(&self) -> bool {
        self.measurement.is_some_and(|m| m.active)
    }
}

/// Ordered trajectory of one track.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub points: Vec<TrajectoryPoint>,
    pub bending: Option<Bending>,
    /// Slope estimate used for the material path correction
    pub direction: Vector2<f64>,
    /// Hits on excluded planes outside the span of the active measurements, not part of
    /// the trajectory
    pub dropped_hits: usize,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Number of points with an active measurement.
    pub fn measured_points(&self) -> usize {
        self.points.iter().filter(|p| p.is_measured()).count()
    }

    /// Indices of the points whose offsets are fit parameters: the first and last points
    /// and every point with a scatterer.
    pub fn offset_points(&self) -> Vec<usize> {
        let last = self.points.len().saturating_sub(1);
        self.points
            .iter()
            .enumerate()
            .filter(|(i, p)| *i == 0 || *i == last || p.scatterer.is_some())
            .map(|(i, _)| i)
            .collect()
    }
}

/// Covariance of a diagonal 2D measurement.
pub fn diagonal_covariance(sigma_x: f64, sigma_y: f64) -> Matrix2<f64> {
    Matrix2::new(sigma_x * sigma_x, 0.0, 0.0, sigma_y * sigma_y)
}
