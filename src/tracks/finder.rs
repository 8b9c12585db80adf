//! # Road search for track candidates
//!
//! Simple combinatorial pattern recognition for straight beam tracks. For each pair of
//! hits on the first and last populated *active* planes (planes not excluded from the
//! fit), a straight line is drawn and the closest hit within a road on every
//! intermediate active plane is attached. Candidates with enough planes are kept.
//!
//! The search is quadratic in the number of hits on the anchor planes, which is fine for
//! the occupancies of a beam telescope; [`FinderConfig::max_candidates`] caps the
//! output of pathological events.
use std::collections::HashSet;

use ahash::RandomState;
use nalgebra::Vector2;

use crate::{
    align_errors::AlignError,
    constants::{Millimeter, SensorId},
    geometry::PlaneLayout,
    tracks::{Hit, TrackCandidate},
};

/// Configuration of the road search.
#[derive(Debug, Clone, PartialEq)]
pub struct FinderConfig {
    /// Maximum transverse distance between a hit and the anchor line (mm)
    pub road_cut: Millimeter,
    /// Minimum number of planes with a hit on a candidate
    pub min_planes: usize,
    /// Maximum number of candidates per event
    pub max_candidates: usize,
    /// Once a hit is used by a candidate it is not reused by another one
    pub exclusive_hits: bool,
    /// Sensors that do not take part in the search
    pub excluded_sensors: Vec<SensorId>,
}

impl Default for FinderConfig {
    fn default() -> Self {
        FinderConfig {
            road_cut: 0.5,
            min_planes: 3,
            max_candidates: 100,
            exclusive_hits: true,
            excluded_sensors: Vec::new(),
        }
    }
}

impl FinderConfig {
    pub fn builder() -> FinderConfigBuilder {
        FinderConfigBuilder::new()
    }
}

/// Builder for [`FinderConfig`], with validation.
#[derive(Debug, Clone, Default)]
pub struct FinderConfigBuilder {
    config: FinderConfig,
}

impl FinderConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: FinderConfig::default(),
        }
    }

    pub fn road_cut(mut self, v: Millimeter) -> Self {
        self.config.road_cut = v;
        self
    }
    pub fn min_planes(mut self, v: usize) -> Self {
        self.config.min_planes = v;
        self
    }
    pub fn max_candidates(mut self, v: usize) -> Self {
        self.config.max_candidates = v;
        self
    }
    pub fn exclusive_hits(mut self, v: bool) -> Self {
        self.config.exclusive_hits = v;
        self
    }
    pub fn excluded_sensors(mut self, v: Vec<SensorId>) -> Self {
        self.config.excluded_sensors = v;
        self
    }

    pub fn build(self) -> Result<FinderConfig, AlignError> {
        let c = &self.config;
        if !(c.road_cut > 0.0 && c.road_cut.is_finite()) {
            return Err(AlignError::InvalidConfiguration(
                "road_cut must be positive and finite".into(),
            ));
        }
        if c.min_planes < 2 {
            return Err(AlignError::InvalidConfiguration(
                "min_planes must be >= 2".into(),
            ));
        }
        if c.max_candidates == 0 {
            return Err(AlignError::InvalidConfiguration(
                "max_candidates must be > 0".into(),
            ));
        }
        Ok(self.config)
    }
}

/// Road-search pattern recognition.
#[derive(Debug, Clone)]
pub struct CandidateFinder {
    config: FinderConfig,
}

impl CandidateFinder {
    pub fn new(config: FinderConfig) -> Self {
        CandidateFinder { config }
    }

    pub fn config(&self) -> &FinderConfig {
        &self.config
    }

    /// Search track candidates among the hits of one event.
    ///
    /// Arguments
    /// -----------------
    /// * `hits`: all hits of the event, in any order.
    /// * `layout`: the plane layout, used for plane ordering and `z` positions.
    ///
    /// Return
    /// ----------
    /// * The candidates found, each ordered along the beam. At most
    ///   `max_candidates` are returned.
    pub fn find(&self, hits: &[Hit], layout: &impl PlaneLayout) -> Vec<TrackCandidate> {
        let active: Vec<(SensorId, f64)> = layout
            .planes()
            .iter()
            .filter(|p| !self.config.excluded_sensors.contains(&p.sensor_id))
            .map(|p| (p.sensor_id, p.z()))
            .collect();

        let per_plane: Vec<Vec<usize>> = active
            .iter()
            .map(|(id, _)| {
                hits.iter()
                    .enumerate()
                    .filter(|(_, h)| h.sensor_id == *id)
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect();

        let populated: Vec<usize> = (0..active.len())
            .filter(|&k| !per_plane[k].is_empty())
            .collect();
        let (Some(&first), Some(&last)) = (populated.first(), populated.last()) else {
            return Vec::new();
        };
        if first == last {
            return Vec::new();
        }

        let mut used: HashSet<usize, RandomState> = HashSet::with_hasher(RandomState::new());
        let mut candidates = Vec::new();

        'anchors: for &i0 in &per_plane[first] {
            for &i1 in &per_plane[last] {
                if candidates.len() >= self.config.max_candidates {
                    break 'anchors;
                }
                if self.config.exclusive_hits && (used.contains(&i0) || used.contains(&i1)) {
                    continue;
                }

                let (h0, h1) = (&hits[i0], &hits[i1]);
                let dz = h1.position.z - h0.position.z;
                if dz.abs() < f64::EPSILON {
                    continue;
                }
                let slope = (h1.xy() - h0.xy()) / dz;

                let mut members = vec![i0];
                for k in (first + 1)..last {
                    let z = active[k].1;
                    let expected: Vector2<f64> = h0.xy() + slope * (z - h0.position.z);
                    let best = per_plane[k]
                        .iter()
                        .filter(|i| !(self.config.exclusive_hits && used.contains(*i)))
                        .map(|&i| (i, (hits[i].xy() - expected).norm()))
                        .filter(|(_, d)| *d <= self.config.road_cut)
                        .min_by(|a, b| a.1.total_cmp(&b.1));
                    if let Some((i, _)) = best {
                        members.push(i);
                    }
                }
                members.push(i1);

                if members.len() < self.config.min_planes {
                    continue;
                }

                if self.config.exclusive_hits {
                    used.extend(members.iter().copied());
                }
                candidates.push(TrackCandidate::new(members.into_iter().map(|i| hits[i])));
            }
        }

        tracing::debug!(
            hits = hits.len(),
            candidates = candidates.len(),
            "road search done"
        );
        candidates
    }
}
