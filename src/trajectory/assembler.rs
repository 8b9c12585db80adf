//! # Trajectory assembly
//!
//! Turns a [`TrackCandidate`] into a broken-line [`Trajectory`]:
//!
//! 1. Hits are placed on their planes and corrected with the current alignment constants.
//!    Hits on excluded planes are kept as *inactive* measurements: they do not constrain
//!    the fit but receive unbiased residuals.
//! 2. The trajectory spans the planes between the first and the last active measurement.
//!    Intermediate planes without a hit are included when
//!    [`AssemblerConfig::scatter_at_unmeasured`] is set and they carry material. Hits on
//!    excluded planes outside that span are counted in [`Trajectory::dropped_hits`].
//! 3. Every inner plane with material gets a [`Scatterer`] whose variance follows the
//!    Highland formula, with the material path corrected for the track inclination
//!    estimated from the outermost active hits. Layers too thin for the formula to give a
//!    positive width get no scatterer.
//! 4. Path lengths are taken where the straight track estimate crosses each plane in its
//!    aligned position (shifted centre, tilted normal).
//! 5. With a transverse magnetic field, the trajectory carries a [`Bending`] model and the
//!    fit adds a curvature parameter.
use nalgebra::{Vector2, Vector3};

use crate::{
    align_errors::AlignError,
    constants::{SensorId, CURVATURE_PER_TESLA_GEV_MM, EPS},
    geometry::{Plane, PlaneLayout},
    tracks::{Hit, TrackCandidate},
    trajectory::{
        scattering::highland_theta0, Bending, Measurement, Scatterer, Trajectory,
        TrajectoryPoint,
    },
};

/// Configuration of the trajectory assembler.
#[derive(Debug, Clone, PartialEq)]
pub struct AssemblerConfig {
    /// Sensors whose hits do not constrain the fit
    pub excluded_sensors: Vec<SensorId>,
    /// Add scatterers on planes crossed without a hit
    pub scatter_at_unmeasured: bool,
    /// Beam momentum (GeV/c)
    pub beam_momentum_gev: f64,
    /// Particle charge in units of the elementary charge
    pub particle_charge: f64,
    /// Magnetic field (T); `None` or a field parallel to the beam means straight tracks
    pub magnetic_field_tesla: Option<Vector3<f64>>,
    /// Minimum number of active measurements for a trajectory to be fitted
    pub min_measured_planes: usize,
    /// Beam direction, used to measure path lengths
    pub beam_direction: Vector3<f64>,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        AssemblerConfig {
            excluded_sensors: Vec::new(),
            scatter_at_unmeasured: true,
            beam_momentum_gev: 4.0,
            particle_charge: -1.0,
            magnetic_field_tesla: None,
            min_measured_planes: 2,
            beam_direction: Vector3::z(),
        }
    }
}

impl AssemblerConfig {
    pub fn builder() -> AssemblerConfigBuilder {
        AssemblerConfigBuilder::new()
    }

    pub fn is_excluded(&self, sensor_id: SensorId) -> bool {
        self.excluded_sensors.contains(&sensor_id)
    }
}

/// Builder for [`AssemblerConfig`], with validation.
#[derive(Debug, Clone, Default)]
pub struct AssemblerConfigBuilder {
    config: AssemblerConfig,
}

impl AssemblerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AssemblerConfig::default(),
        }
    }

    pub fn excluded_sensors(mut self, v: Vec<SensorId>) -> Self {
        self.config.excluded_sensors = v;
        self
    }
    pub fn scatter_at_unmeasured(mut self, v: bool) -> Self {
        self.config.scatter_at_unmeasured = v;
        self
    }
    pub fn beam_momentum_gev(mut self, v: f64) -> Self {
        self.config.beam_momentum_gev = v;
        self
    }
    pub fn particle_charge(mut self, v: f64) -> Self {
        self.config.particle_charge = v;
        self
    }
    pub fn magnetic_field_tesla(mut self, v: Vector3<f64>) -> Self {
        self.config.magnetic_field_tesla = Some(v);
        self
    }
    pub fn min_measured_planes(mut self, v: usize) -> Self {
        self.config.min_measured_planes = v;
        self
    }
    pub fn beam_direction(mut self, v: Vector3<f64>) -> Self {
        self.config.beam_direction = v;
        self
    }

    /// Validate and return the configuration. The beam direction is normalized.
    pub fn build(mut self) -> Result<AssemblerConfig, AlignError> {
        let c = &self.config;
        if !(c.beam_momentum_gev > 0.0 && c.beam_momentum_gev.is_finite()) {
            return Err(AlignError::InvalidConfiguration(
                "beam_momentum_gev must be positive and finite".into(),
            ));
        }
        if !c.particle_charge.is_finite() || c.particle_charge == 0.0 {
            return Err(AlignError::InvalidConfiguration(
                "particle_charge must be non-zero".into(),
            ));
        }
        if c.min_measured_planes < 2 {
            return Err(AlignError::InvalidConfiguration(
                "min_measured_planes must be >= 2".into(),
            ));
        }
        if c
            .magnetic_field_tesla
            .is_some_and(|b| b.iter().any(|v| !v.is_finite()))
        {
            return Err(AlignError::InvalidConfiguration(
                "magnetic field must be finite".into(),
            ));
        }
        let norm = c.beam_direction.norm();
        if !(norm > EPS && c.beam_direction.z > 0.0) {
            return Err(AlignError::InvalidConfiguration(
                "beam_direction must point downstream (+z)".into(),
            ));
        }
        self.config.beam_direction /= norm;
        Ok(self.config)
    }
}

/// Builds broken-line trajectories from track candidates.
#[derive(Debug, Clone)]
pub struct TrajectoryAssembler {
    config: AssemblerConfig,
}

impl TrajectoryAssembler {
    pub fn new(config: AssemblerConfig) -> Self {
        TrajectoryAssembler { config }
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// Bending model for the configured field, `None` without a transverse component.
    ///
    /// The Lorentz force on a particle moving along `+z` points along `ẑ × B`, so the
    /// bending direction is `(−B_y, B_x)` scaled by the sign of the charge.
    pub fn bending(&self) -> Option<Bending> {
        let b = self.config.magnetic_field_tesla?;
        let transverse = Vector2::new(-b.y, b.x);
        let b_perp = transverse.norm();
        if b_perp < EPS {
            return None;
        }
        Some(Bending {
            direction: transverse / b_perp,
            nominal_curvature: CURVATURE_PER_TESLA_GEV_MM * self.config.particle_charge * b_perp
                / self.config.beam_momentum_gev,
        })
    }

    /// Assemble the trajectory of one track candidate.
    ///
    /// Arguments
    /// -----------------
    /// * `candidate`: hits of the track; their order is not relied upon.
    /// * `layout`: the telescope planes.
    ///
    /// Return
    /// ----------
    /// * The trajectory, ordered by path length.
    /// * [`AlignError::UnknownSensor`] when a hit lies on a sensor missing from the layout.
    /// * [`AlignError::DegenerateTrajectory`] with fewer than `min_measured_planes` active
    ///   measurements.
    pub fn assemble(
        &self,
        candidate: &TrackCandidate,
        layout: &impl PlaneLayout,
    ) -> Result<Trajectory, AlignError> {
        let planes = layout.planes();
        let mut hit_of_plane: Vec<Option<&Hit>> = vec![None; planes.len()];
        for hit in candidate.hits() {
            let i = layout
                .index_of(hit.sensor_id)
                .ok_or(AlignError::UnknownSensor(hit.sensor_id))?;
            hit_of_plane[i].get_or_insert(hit);
        }

        let active: Vec<usize> = hit_of_plane
            .iter()
            .enumerate()
            .filter(|(i, h)| h.is_some() && !self.config.is_excluded(planes[*i].sensor_id))
            .map(|(i, _)| i)
            .collect();
        if active.len() < self.config.min_measured_planes {
            return Err(AlignError::DegenerateTrajectory {
                measured: active.len(),
                required: self.config.min_measured_planes,
            });
        }
        let (first, last) = (active[0], active[active.len() - 1]);

        let corrected = |i: usize| -> Option<Vector3<f64>> {
            hit_of_plane[i].map(|h| planes[i].correct_hit(&h.position))
        };

        // direction estimate from the outermost active hits
        let (Some(start), Some(end)) = (corrected(first), corrected(last)) else {
            return Err(AlignError::DegenerateTrajectory {
                measured: active.len(),
                required: self.config.min_measured_planes,
            });
        };
        let dz = end.z - start.z;
        let direction = if dz.abs() > EPS {
            (end - start).xy() / dz
        } else {
            Vector2::zeros()
        };
        let cos_theta = 1.0 / (1.0 + direction.norm_squared()).sqrt();
        let track = Vector3::new(direction.x, direction.y, 1.0);

        let beam = self.config.beam_direction;
        let entry = crossing(&planes[first], &start, &track);
        let mut points: Vec<TrajectoryPoint> = Vec::with_capacity(last - first + 1);

        for i in first..=last {
            let plane = &planes[i];
            let measurement = hit_of_plane[i].zip(corrected(i)).map(|(hit, pos)| Measurement {
                position: pos.xy(),
                covariance: hit.covariance,
                active: !self.config.is_excluded(plane.sensor_id),
            });

            let inner = i != first && i != last;
            let scatterer = (inner && plane.has_material())
                .then(|| {
                    highland_theta0(
                        plane.radiation_length / cos_theta,
                        self.config.beam_momentum_gev,
                        self.config.particle_charge,
                    )
                })
                .filter(|&theta0| theta0 > 0.0)
                .map(|theta0| Scatterer {
                    variance: Vector2::repeat(theta0 * theta0),
                });
            if measurement.is_none() && !(self.config.scatter_at_unmeasured && scatterer.is_some())
            {
                continue;
            }

            let path_length = (crossing(plane, &start, &track) - entry).dot(&beam);
            let step = points
                .last()
                .map_or(0.0, |p: &TrajectoryPoint| path_length - p.path_length);
            points.push(TrajectoryPoint {
                sensor_id: plane.sensor_id,
                path_length,
                step,
                origin: plane.centre().xy(),
                measurement,
                scatterer,
            });
        }

        // hits on excluded planes beyond the outermost active measurements
        let dropped_hits = hit_of_plane
            .iter()
            .enumerate()
            .filter(|&(i, h)| h.is_some() && (i < first || i > last))
            .count();
        if dropped_hits > 0 {
            tracing::debug!(dropped_hits, "hits outside the active span ignored");
        }

        tracing::trace!(
            points = points.len(),
            measured = active.len(),
            "trajectory assembled"
        );

        Ok(Trajectory {
            points,
            bending: self.bending(),
            direction,
            dropped_hits,
        })
    }
}

/// Point where the straight line through `start` with slopes `track` (dz = 1) crosses the
/// aligned plane.
fn crossing(plane: &Plane, start: &Vector3<f64>, track: &Vector3<f64>) -> Vector3<f64> {
    let normal = plane.normal();
    let along = normal.dot(track);
    let centre = plane.centre();
    let t = if along.abs() > EPS {
        normal.dot(&(centre - start)) / along
    } else {
        centre.z - start.z
    };
    start + track * t
}

#[cfg(test)]
mod assembler_test {
    use super::*;
    use crate::{
        alignment::registry::NoAlignment,
        fit::BrokenLineFitter,
        geometry::{
            update::{GeometryUpdateSink, SensorCorrection},
            TelescopeLayout,
        },
    };
    use approx::assert_relative_eq;

    fn layout() -> TelescopeLayout {
        TelescopeLayout::new(
            (0..6)
                .map(|i| Plane::new(i, Vector3::new(0.0, 0.0, 150.0 * i as f64), 5.3e-4))
                .collect(),
        )
        .unwrap()
    }

    fn hit(id: SensorId, x: f64) -> Hit {
        Hit::with_resolution(id, Vector3::new(x, 0.0, 150.0 * id as f64), 0.004, 0.004)
    }

    #[test]
    fn test_assemble_straight_track() {
        let assembler = TrajectoryAssembler::new(AssemblerConfig::default());
        let candidate = TrackCandidate::new((0..6).map(|i| hit(i, 0.01 * i as f64)));
        let traj = assembler.assemble(&candidate, &layout()).unwrap();

        assert_eq!(traj.len(), 6);
        assert_eq!(traj.measured_points(), 6);
        assert!(traj.bending.is_none());
        assert!(traj.points[0].scatterer.is_none());
        assert!(traj.points[5].scatterer.is_none());
        assert!(traj.points[1..5].iter().all(|p| p.scatterer.is_some()));
        assert_eq!(traj.points[3].path_length, 450.0);
        assert_eq!(traj.points[3].step, 150.0);
        assert_eq!(traj.offset_points(), vec![0, 1, 2, 3, 4, 5]);
        assert!((traj.direction.x - 0.01 / 150.0).abs() < 1e-12);
    }

    #[test]
    fn test_excluded_plane_keeps_scatterer() {
        let config = AssemblerConfig::builder()
            .excluded_sensors(vec![2])
            .build()
            .unwrap();
        let candidate = TrackCandidate::new((0..6).map(|i| hit(i, 0.0)));
        let traj = TrajectoryAssembler::new(config)
            .assemble(&candidate, &layout())
            .unwrap();

        assert_eq!(traj.measured_points(), 5);
        assert_eq!(traj.dropped_hits, 0);
        let p2 = &traj.points[2];
        assert!(!p2.is_measured());
        assert!(p2.measurement.is_some());
        assert!(p2.scatterer.is_some());
    }

    #[test]
    fn test_path_length_follows_aligned_planes() {
        let assembler = TrajectoryAssembler::new(AssemblerConfig::default());
        let candidate = TrackCandidate::new((0..6).map(|i| hit(i, 1.5 * i as f64)));
        let mut layout = layout();
        let before = assembler.assemble(&candidate, &layout).unwrap();
        assert_eq!(before.points[2].path_length, 300.0);

        let mut shifted = SensorCorrection::zero(2);
        shifted.shift.z = 5.0;
        layout.apply(&[shifted]).unwrap();
        let after = assembler.assemble(&candidate, &layout).unwrap();
        assert_relative_eq!(after.points[2].path_length, 305.0, epsilon = 1e-12);
        assert_relative_eq!(after.points[2].step, 155.0, epsilon = 1e-12);
        assert_relative_eq!(after.points[3].step, 145.0, epsilon = 1e-12);

        // back to z = 300, tilted around y: the track (slope 0.01 in x) meets it earlier
        let mut tilted = SensorCorrection::zero(2);
        tilted.shift.z = -5.0;
        tilted.rotation.y = 0.01;
        layout.apply(&[tilted]).unwrap();
        let tilted = assembler.assemble(&candidate, &layout).unwrap();
        assert_relative_eq!(
            tilted.points[2].path_length,
            300.0 / (1.0 + 1e-4),
            epsilon = 1e-9
        );
        assert_eq!(tilted.points[5].path_length, 750.0);
    }

    #[test]
    fn test_vanishing_scattering_width() {
        let config = AssemblerConfig::default();
        let x_over_x0 = 1e-13;
        assert_eq!(
            highland_theta0(x_over_x0, config.beam_momentum_gev, config.particle_charge),
            0.0
        );
        let thin = TelescopeLayout::new(
            (0..4)
                .map(|i| Plane::new(i, Vector3::new(0.0, 0.0, 150.0 * i as f64), x_over_x0))
                .collect(),
        )
        .unwrap();
        let candidate = TrackCandidate::new([hit(0, 0.0), hit(1, 0.001), hit(3, 0.0)]);
        let traj = TrajectoryAssembler::new(config)
            .assemble(&candidate, &thin)
            .unwrap();

        // plane 2 has neither a hit nor a usable scatterer
        assert_eq!(traj.len(), 3);
        assert!(traj.points.iter().all(|p| p.scatterer.is_none()));
        let outcome = BrokenLineFitter::default().fit(&traj, &NoAlignment).unwrap();
        assert_eq!(outcome.ndf, 2);
    }

    #[test]
    fn test_hits_outside_active_span_are_counted() {
        let config = AssemblerConfig::builder()
            .excluded_sensors(vec![0, 5])
            .build()
            .unwrap();
        let candidate = TrackCandidate::new((0..6).map(|i| hit(i, 0.0)));
        let traj = TrajectoryAssembler::new(config)
            .assemble(&candidate, &layout())
            .unwrap();
        assert_eq!(traj.len(), 4);
        assert_eq!(traj.points[0].sensor_id, 1);
        assert_eq!(traj.points[0].path_length, 0.0);
        assert_eq!(traj.dropped_hits, 2);
    }

    #[test]
    fn test_unmeasured_planes() {
        let candidate = TrackCandidate::new([hit(0, 0.0), hit(3, 0.0), hit(5, 0.0)]);
        let with = TrajectoryAssembler::new(AssemblerConfig::default())
            .assemble(&candidate, &layout())
            .unwrap();
        assert_eq!(with.len(), 6);

        let config = AssemblerConfig::builder()
            .scatter_at_unmeasured(false)
            .build()
            .unwrap();
        let without = TrajectoryAssembler::new(config)
            .assemble(&candidate, &layout())
            .unwrap();
        assert_eq!(without.len(), 3);
    }

    #[test]
    fn test_degenerate_and_unknown() {
        let assembler = TrajectoryAssembler::new(AssemblerConfig::default());
        let err = assembler
            .assemble(&TrackCandidate::new([hit(1, 0.0)]), &layout())
            .unwrap_err();
        assert_eq!(
            err,
            AlignError::DegenerateTrajectory {
                measured: 1,
                required: 2
            }
        );

        let err = assembler
            .assemble(&TrackCandidate::new([hit(0, 0.0), hit(42, 0.0)]), &layout())
            .unwrap_err();
        assert_eq!(err, AlignError::UnknownSensor(42));
    }

    #[test]
    fn test_bending_direction() {
        let config = AssemblerConfig::builder()
            .magnetic_field_tesla(Vector3::new(0.0, 1.0, 0.0))
            .beam_momentum_gev(1.0)
            .particle_charge(1.0)
            .build()
            .unwrap();
        let bending = TrajectoryAssembler::new(config).bending().unwrap();
        assert!((bending.direction - Vector2::new(-1.0, 0.0)).norm() < 1e-12);
        assert!((bending.nominal_curvature - 0.299_792_458e-3).abs() < 1e-15);

        let along_beam = AssemblerConfig::builder()
            .magnetic_field_tesla(Vector3::new(0.0, 0.0, 2.0))
            .build()
            .unwrap();
        assert!(TrajectoryAssembler::new(along_beam).bending().is_none());
    }

    #[test]
    fn test_builder_validation() {
        assert!(AssemblerConfig::builder().min_measured_planes(1).build().is_err());
        assert!(AssemblerConfig::builder().beam_momentum_gev(0.0).build().is_err());
        assert!(AssemblerConfig::builder()
            .beam_direction(Vector3::new(0.0, 0.0, -1.0))
            .build()
            .is_err());
    }
}
