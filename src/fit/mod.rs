//! # Broken-line track fit
//!
//! Linear least-squares fit of a [`Trajectory`](crate::trajectory::Trajectory) under the
//! broken-line model: the track is described by transverse offsets at its *offset points*
//! (first, last and every scatterer) and, in a magnetic field, one curvature.
//!
//! The fit minimizes
//!
//! ```text
//! χ² = Σ_meas w · (m − f(p))² / σ²  +  Σ_kinks kink(p)² / θ0²
//! ```
//!
//! through the bordered band normal equations of [`band`], and optionally repeats the fit
//! with M-estimator down-weights (see [`outlier`]).
//!
//! The [`FitOutcome`] exposes everything downstream needs: χ² and ndf for the quality
//! gate, one [`FitRow`] per constraint with its local and global derivatives for the
//! record stream, and one [`PointResult`] per trajectory point for the residuals.
use nalgebra::{Matrix2, Vector2};
use smallvec::SmallVec;

use crate::{
    align_errors::AlignError,
    constants::{Label, SensorId},
};

pub mod band;
pub mod broken_line;
pub mod outlier;

pub use broken_line::BrokenLineFitter;
pub use outlier::OutlierPolicy;

/// Sparse derivative vector over the local fit parameters, 0-based.
pub type LocalDerivatives = SmallVec<[(usize, f64); 8]>;

/// Sparse derivative vector over the alignment labels.
pub type GlobalDerivatives = SmallVec<[(Label, f64); 6]>;

/// Configuration of the broken-line fit.
#[derive(Debug, Clone, PartialEq)]
pub struct FitterConfig {
    pub outlier_policy: OutlierPolicy,
    /// Maximum number of fits, including the first unweighted one
    pub max_iterations: usize,
    /// Largest weight change accepted as converged
    pub weight_tolerance: f64,
    /// Relative size below which a pivot counts as lost
    pub singularity_threshold: f64,
}

impl Default for FitterConfig {
    fn default() -> Self {
        FitterConfig {
            outlier_policy: OutlierPolicy::None,
            max_iterations: 5,
            weight_tolerance: 1e-3,
            singularity_threshold: 1e-12,
        }
    }
}

impl FitterConfig {
    pub fn builder() -> FitterConfigBuilder {
        FitterConfigBuilder::new()
    }
}

/// Builder for [`FitterConfig`], with validation.
#[derive(Debug, Clone, Default)]
pub struct FitterConfigBuilder {
    config: FitterConfig,
}

impl FitterConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: FitterConfig::default(),
        }
    }

    pub fn outlier_policy(mut self, v: OutlierPolicy) -> Self {
        self.config.outlier_policy = v;
        self
    }
    pub fn max_iterations(mut self, v: usize) -> Self {
        self.config.max_iterations = v;
        self
    }
    pub fn weight_tolerance(mut self, v: f64) -> Self {
        self.config.weight_tolerance = v;
        self
    }
    pub fn singularity_threshold(mut self, v: f64) -> Self {
        self.config.singularity_threshold = v;
        self
    }

    pub fn build(self) -> Result<FitterConfig, AlignError> {
        let c = &self.config;
        c.outlier_policy.validate()?;
        if c.max_iterations == 0 {
            return Err(AlignError::InvalidConfiguration(
                "max_iterations must be >= 1".into(),
            ));
        }
        if !(c.weight_tolerance > 0.0 && c.weight_tolerance.is_finite()) {
            return Err(AlignError::InvalidConfiguration(
                "weight_tolerance must be > 0".into(),
            ));
        }
        if !(c.singularity_threshold >= 0.0 && c.singularity_threshold < 1.0) {
            return Err(AlignError::InvalidConfiguration(
                "singularity_threshold must be in [0, 1)".into(),
            ));
        }
        Ok(self.config)
    }
}

/// What a constraint row measures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RowKind {
    /// Projection of a measurement on one eigen-direction of its covariance
    Measurement { point: usize, direction: Vector2<f64> },
    /// Kink angle at a scatterer, along axis `0` (x) or `1` (y)
    Kink { point: usize, axis: usize },
}

/// One constraint of the fit, with its fitted residual.
#[derive(Debug, Clone, PartialEq)]
pub struct FitRow {
    pub kind: RowKind,
    pub sensor_id: SensorId,
    /// Measured value (`0.0` for kinks)
    pub value: f64,
    /// Measurement error (θ0 for kinks)
    pub sigma: f64,
    /// Derivatives of the prediction with respect to the local fit parameters
    pub local_derivatives: LocalDerivatives,
    /// Derivatives of the residual with respect to the alignment parameters
    pub global_derivatives: GlobalDerivatives,
    /// Measured minus fitted value
    pub residual: f64,
    /// Error of the residual, `sqrt(σ² − σ²_fit)`
    pub residual_sigma: f64,
    pub down_weight: f64,
}

impl FitRow {
    pub fn is_measurement(&self) -> bool {
        matches!(self.kind, RowKind::Measurement { .. })
    }

    /// Residual normalized to the measurement error.
    pub fn normalized_residual(&self) -> f64 {
        self.residual / self.sigma
    }

    /// Residual normalized to its own error, `0.0` when that error vanishes.
    pub fn pull(&self) -> f64 {
        if self.residual_sigma > 0.0 {
            self.residual / self.residual_sigma
        } else {
            0.0
        }
    }
}

/// Fitted state of the track at one trajectory point.
#[derive(Debug, Clone, PartialEq)]
pub struct PointResult {
    pub sensor_id: SensorId,
    pub path_length: f64,
    /// Fitted transverse position (mm)
    pub position: Vector2<f64>,
    /// Fitted slopes `(dx/dz, dy/dz)`
    pub slopes: Vector2<f64>,
    /// Hit minus fitted position, for points with a hit
    pub residual: Option<Vector2<f64>>,
    /// Covariance of the residual. For inactive hits the residual is unbiased and its
    /// covariance is the sum of the hit and track covariances.
    pub residual_covariance: Option<Matrix2<f64>>,
    /// Residual with respect to a fit that leaves this hit out. Equal to `residual` for
    /// inactive hits; `None` when the hit alone fixes the fitted position.
    pub unbiased_residual: Option<Vector2<f64>>,
    /// Whether the hit took part in the fit
    pub active: bool,
}

/// Result of a broken-line fit.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOutcome {
    pub chi2: f64,
    pub ndf: usize,
    /// Sum of `1 − w` over the measurement rows
    pub lost_weight: f64,
    /// Number of fits performed
    pub iterations: usize,
    /// Fitted curvature (mm⁻¹) when the track bends
    pub curvature: Option<f64>,
    pub rows: Vec<FitRow>,
    pub points: Vec<PointResult>,
}

impl FitOutcome {
    /// χ²/ndf, or `0.0` for a fit without degrees of freedom.
    pub fn chi2_per_ndf(&self) -> f64 {
        if self.ndf == 0 {
            0.0
        } else {
            self.chi2 / self.ndf as f64
        }
    }

    /// Residuals of the points with an active hit, keyed by sensor.
    pub fn measured_residuals(&self) -> impl Iterator<Item = (SensorId, Vector2<f64>)> + '_ {
        self.points
            .iter()
            .filter(|p| p.active)
            .filter_map(|p| p.residual.map(|r| (p.sensor_id, r)))
    }

    /// Unbiased residuals of the points with an active hit, keyed by sensor.
    ///
    /// A sensor displaced by `δ` shows an unbiased residual of `−δ` on average, whereas
    /// its plain residual is shrunk by the leverage of the hit in the fit.
    pub fn unbiased_residuals(&self) -> impl Iterator<Item = (SensorId, Vector2<f64>)> + '_ {
        self.points
            .iter()
            .filter(|p| p.active)
            .filter_map(|p| p.unbiased_residual.map(|r| (p.sensor_id, r)))
    }
}
