//! # Hits and track candidates
//!
//! A [`Hit`] is a cleaned, clustered position measurement on one sensor, already
//! transformed into the telescope frame, with its 2×2 covariance in the plane.
//! A [`TrackCandidate`] is an ordered list of hits with at most one hit per plane.
//!
//! Candidates are produced either by an upstream pattern recognition or by the
//! simple road search in [`finder`].
use nalgebra::{Matrix2, Vector2, Vector3};
use smallvec::SmallVec;

use crate::{constants::SensorId, geometry::PlaneLayout};

pub mod finder;

/// Position measurement on a single sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub sensor_id: SensorId,
    /// Position in the telescope frame (mm)
    pub position: Vector3<f64>,
    /// Covariance of the (x, y) position in the plane (mm²)
    pub covariance: Matrix2<f64>,
}

impl Hit {
    pub fn new(sensor_id: SensorId, position: Vector3<f64>, covariance: Matrix2<f64>) -> Self {
        Hit {
            sensor_id,
            position,
            covariance,
        }
    }

    /// Hit with uncorrelated resolutions `sigma_x`, `sigma_y` (mm).
    pub fn with_resolution(
        sensor_id: SensorId,
        position: Vector3<f64>,
        sigma_x: f64,
        sigma_y: f64,
    ) -> Self {
        Hit::new(
            sensor_id,
            position,
            Matrix2::new(sigma_x * sigma_x, 0.0, 0.0, sigma_y * sigma_y),
        )
    }

    pub fn xy(&self) -> Vector2<f64> {
        self.position.xy()
    }
}

/// Ordered hit list of one track, inline-allocated for typical telescope sizes.
pub type Hits = SmallVec<[Hit; 8]>;

/// A track candidate: hits ordered along the beam, one per traversed plane.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrackCandidate {
    hits: Hits,
}

impl TrackCandidate {
    /// Build a candidate from hits ordered along the beam.
    ///
    /// The order is taken as given; use [`TrackCandidate::sorted`] when the hits come
    /// in arbitrary order.
    pub fn new(hits: impl IntoIterator<Item = Hit>) -> Self {
        TrackCandidate {
            hits: hits.into_iter().collect(),
        }
    }

    /// Build a candidate and order its hits by the plane order of `layout`.
    ///
    /// Hits on sensors unknown to the layout are dropped, as are extra hits on a
    /// plane that already holds one.
    pub fn sorted(hits: impl IntoIterator<Item = Hit>, layout: &impl PlaneLayout) -> Self {
        let mut indexed: Vec<(usize, Hit)> = hits
            .into_iter()
            .filter_map(|h| layout.index_of(h.sensor_id).map(|i| (i, h)))
            .collect();
        indexed.sort_by_key(|(i, _)| *i);
        indexed.dedup_by_key(|(i, _)| *i);
        TrackCandidate::new(indexed.into_iter().map(|(_, h)| h))
    }

    pub fn hits(&self) -> &[Hit] {
        &self.hits
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn hit_on(&self, sensor_id: SensorId) -> Option<&Hit> {
        self.hits.iter().find(|h| h.sensor_id == sensor_id)
    }
}
