//! # Telescope plane layout
//!
//! Ordered description of the detector planes traversed by the beam. The layout is the
//! collaborator that tells the track model *where* the sensors are and *how much material*
//! they put in the way of the particle.
//!
//! ## Conventions
//!
//! * The beam travels along `+z`; planes are sorted by increasing `z` of their centre.
//! * Every plane is perpendicular to the beam axis in the nominal geometry. Alignment
//!   constants (small shifts and rotations) are carried per plane in [`AlignmentConstants`]
//!   and applied to hits through [`Plane::correct_hit`].
//! * Material is given as thickness over radiation length (`x/X0`).
//!
//! ## Public API
//!
//! * [`Plane`] – One sensor: identifier, centre, material, alignment constants.
//! * [`PlaneLayout`] – Provider trait consumed by the trajectory assembler and the
//!   alignment registry.
//! * [`TelescopeLayout`] – Concrete, validated layout with `O(1)` lookup by sensor id.
//! * [`update`] – Geometry-update sinks receiving the solved alignment corrections.
use ahash::RandomState;
use nalgebra::Vector3;
use std::collections::HashMap;

use crate::{
    align_errors::AlignError,
    constants::{Millimeter, RadiationLengths, SensorId},
};

pub mod update;

/// Alignment constants of one sensor: displacement and small-angle rotation with respect
/// to the nominal geometry.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AlignmentConstants {
    /// Shift along x, y, z (mm)
    pub shift: Vector3<f64>,
    /// Rotation angles around x, y, z (rad)
    pub rotation: Vector3<f64>,
}

/// A single detector plane of the telescope.
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    pub sensor_id: SensorId,
    /// Centre of the sensor in the telescope frame (mm)
    pub position: Vector3<Millimeter>,
    /// Material budget of the plane (x/X0)
    pub radiation_length: RadiationLengths,
    pub alignment: AlignmentConstants,
}

impl Plane {
    pub fn new(sensor_id: SensorId, position: Vector3<Millimeter>, radiation_length: f64) -> Self {
        Plane {
            sensor_id,
            position,
            radiation_length,
            alignment: AlignmentConstants::default(),
        }
    }

    /// Position of the plane along the beam axis.
    pub fn z(&self) -> Millimeter {
        self.position.z
    }

    /// Centre of the plane after alignment.
    pub fn centre(&self) -> Vector3<Millimeter> {
        self.position + self.alignment.shift
    }

    /// Unit normal of the plane after alignment: the beam axis tilted by the small-angle
    /// rotation.
    pub fn normal(&self) -> Vector3<f64> {
        let z = Vector3::z();
        (z + self.alignment.rotation.cross(&z)).normalize()
    }

    /// Whether the plane scatters the beam.
    pub fn has_material(&self) -> bool {
        self.radiation_length > 0.0
    }

    /// Apply the current alignment constants to a hit reported in the nominal frame.
    ///
    /// The hit is expressed relative to the plane centre, rotated by the small-angle
    /// rotation `ω` (`rel + ω × rel`) and shifted.
    ///
    /// Arguments
    /// -----------------
    /// * `hit`: hit position in the nominal telescope frame (mm).
    ///
    /// Return
    /// ----------
    /// * The corrected hit position in the telescope frame.
    pub fn correct_hit(&self, hit: &Vector3<f64>) -> Vector3<f64> {
        let rel = hit - self.position;
        self.position + self.alignment.shift + rel + self.alignment.rotation.cross(&rel)
    }
}

/// Provider of the ordered plane layout.
///
/// Implementations must return the planes sorted along the beam direction.
pub trait PlaneLayout {
    fn planes(&self) -> &[Plane];

    fn plane(&self, sensor_id: SensorId) -> Option<&Plane> {
        self.planes().iter().find(|p| p.sensor_id == sensor_id)
    }

    /// Sensor identifiers in beam order.
    fn sensor_ids(&self) -> Vec<SensorId> {
        self.planes().iter().map(|p| p.sensor_id).collect()
    }

    /// Index of a sensor in beam order.
    fn index_of(&self, sensor_id: SensorId) -> Option<usize> {
        self.planes().iter().position(|p| p.sensor_id == sensor_id)
    }
}

/// Validated telescope layout.
#[derive(Debug, Clone)]
pub struct TelescopeLayout {
    planes: Vec<Plane>,
    index: HashMap<SensorId, usize, RandomState>,
}

impl TelescopeLayout {
    /// Build a layout from an unordered list of planes.
    ///
    /// Planes are sorted by the `z` coordinate of their centre.
    ///
    /// Arguments
    /// -----------------
    /// * `planes`: the telescope planes, in any order.
    ///
    /// Return
    /// ----------
    /// * The layout, or [`AlignError::InvalidConfiguration`] when a sensor id is duplicated,
    ///   a coordinate is not finite, a material budget is negative, or two planes share
    ///   the same `z`.
    pub fn new(mut planes: Vec<Plane>) -> Result<Self, AlignError> {
        for p in &planes {
            if !p.position.iter().all(|c| c.is_finite()) {
                return Err(AlignError::InvalidConfiguration(format!(
                    "plane {} has a non-finite position",
                    p.sensor_id
                )));
            }
            if !(p.radiation_length >= 0.0) {
                return Err(AlignError::InvalidConfiguration(format!(
                    "plane {} has a negative material budget",
                    p.sensor_id
                )));
            }
        }

        planes.sort_by(|a, b| a.z().total_cmp(&b.z()));

        if planes.windows(2).any(|w| w[1].z() - w[0].z() <= 0.0) {
            return Err(AlignError::InvalidConfiguration(
                "two planes share the same z position".into(),
            ));
        }

        let mut index = HashMap::with_hasher(RandomState::new());
        for (i, p) in planes.iter().enumerate() {
            if index.insert(p.sensor_id, i).is_some() {
                return Err(AlignError::InvalidConfiguration(format!(
                    "duplicated sensor id {}",
                    p.sensor_id
                )));
            }
        }

        Ok(TelescopeLayout { planes, index })
    }

    pub fn len(&self) -> usize {
        self.planes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }

    pub(crate) fn plane_mut(&mut self, sensor_id: SensorId) -> Option<&mut Plane> {
        let i = *self.index.get(&sensor_id)?;
        self.planes.get_mut(i)
    }
}

impl PlaneLayout for TelescopeLayout {
    fn planes(&self) -> &[Plane] {
        &self.planes
    }

    fn plane(&self, sensor_id: SensorId) -> Option<&Plane> {
        self.index.get(&sensor_id).map(|&i| &self.planes[i])
    }

    fn index_of(&self, sensor_id: SensorId) -> Option<usize> {
        self.index.get(&sensor_id).copied()
    }
}
