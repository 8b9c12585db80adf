#![allow(dead_code)]

use std::collections::HashMap;

use camino::Utf8PathBuf;
use nalgebra::{Vector2, Vector3};
use rand::{rngs::StdRng, Rng};
use rand_distr::{Distribution, Normal};
use telalign::{
    constants::SensorId,
    geometry::{Plane, PlaneLayout, TelescopeLayout},
    tracks::{Hit, TrackCandidate},
    trajectory::scattering::highland_theta0,
};

/// Distance between consecutive planes (mm)
pub const SPACING: f64 = 150.0;

/// Hit resolution in x and y (mm)
pub const RESOLUTION: f64 = 0.004;

pub const MOMENTUM_GEV: f64 = 4.0;

/// Evenly spaced telescope of `n` planes numbered from 0, each with `x_over_x0` of
/// material.
pub fn telescope(n: usize, x_over_x0: f64) -> TelescopeLayout {
    TelescopeLayout::new(
        (0..n as SensorId)
            .map(|i| Plane::new(i, Vector3::new(0.0, 0.0, SPACING * i as f64), x_over_x0))
            .collect(),
    )
    .unwrap()
}

/// Generator of straight beam tracks with multiple scattering and Gaussian hit smearing.
pub struct TrackGun {
    pub layout: TelescopeLayout,
    /// True displacement of a sensor: its hits appear shifted by the opposite amount
    pub misalignment: HashMap<SensorId, Vector2<f64>>,
    pub resolution: f64,
    pub scattering: bool,
    pub beam_spread: f64,
    pub slope_spread: f64,
}

impl TrackGun {
    pub fn new(layout: TelescopeLayout) -> Self {
        TrackGun {
            layout,
            misalignment: HashMap::new(),
            resolution: RESOLUTION,
            scattering: true,
            beam_spread: 2.0,
            slope_spread: 1e-4,
        }
    }

    pub fn with_misalignment(mut self, sensor_id: SensorId, shift: Vector2<f64>) -> Self {
        self.misalignment.insert(sensor_id, shift);
        self
    }

    pub fn without_scattering(mut self) -> Self {
        self.scattering = false;
        self
    }

    /// One candidate with a hit on every plane.
    pub fn shoot(&self, rng: &mut StdRng) -> TrackCandidate {
        let planes = self.layout.planes();
        let beam = Normal::new(0.0, self.beam_spread).unwrap();
        let slopes = Normal::new(0.0, self.slope_spread).unwrap();
        let smear = Normal::new(0.0, self.resolution).unwrap();

        let mut position = Vector2::new(beam.sample(rng), beam.sample(rng));
        let mut slope = Vector2::new(slopes.sample(rng), slopes.sample(rng));
        let mut z = planes[0].z();
        let last = planes.len() - 1;

        let hits = planes.iter().enumerate().map(|(i, plane)| {
            position += slope * (plane.z() - z);
            z = plane.z();

            let shift = self
                .misalignment
                .get(&plane.sensor_id)
                .copied()
                .unwrap_or_else(Vector2::zeros);
            let measured = position - shift + Vector2::new(smear.sample(rng), smear.sample(rng));

            if self.scattering && i != 0 && i != last && plane.has_material() {
                let theta0 = highland_theta0(plane.radiation_length, MOMENTUM_GEV, -1.0);
                let kink = Normal::new(0.0, theta0).unwrap();
                slope += Vector2::new(kink.sample(rng), kink.sample(rng));
            }

            Hit::with_resolution(
                plane.sensor_id,
                Vector3::new(measured.x, measured.y, plane.z()),
                self.resolution,
                self.resolution,
            )
        });
        TrackCandidate::new(hits.collect::<Vec<_>>())
    }

    pub fn shoot_many(&self, n: usize, rng: &mut StdRng) -> Vec<TrackCandidate> {
        (0..n).map(|_| self.shoot(rng)).collect()
    }
}

/// A uniformly drawn value, used to vary event sizes.
pub fn uniform(rng: &mut StdRng, lo: usize, hi: usize) -> usize {
    rng.random_range(lo..hi)
}

/// Temporary working directory as a UTF-8 path.
pub fn workdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, path)
}

/// Route `tracing` output to the test harness.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
