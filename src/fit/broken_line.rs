//! # Broken-line fitter
//!
//! ## Parameters
//!
//! The local parameters are, in this order:
//!
//! 1. the curvature `κ` (only when the trajectory bends),
//! 2. the offsets `(u_x, u_y)` of every offset point, in trajectory order.
//!
//! A point between the offset points `a` and `b` is interpolated:
//!
//! ```text
//! u(s) = (1 − t) · u_a + t · u_b + ½ κ (s − s_a)(s − s_b) · n,     t = (s − s_a) / (s_b − s_a)
//! ```
//!
//! with `n` the bending direction.
//!
//! ## Constraints
//!
//! * A measurement is split along the eigen-directions `e` of its covariance; each direction
//!   gives the row `e · m = e · u(s)` with variance equal to the eigenvalue. Directions with
//!   infinite variance carry no information and are skipped.
//! * An inner offset point `k` with a scatterer gives two kink rows
//!   `0 = (u_{k+1} − u_k)/Δ₊ − (u_k − u_{k−1})/Δ₋ − ½ κ (Δ₊ + Δ₋) · n` with variance θ0².
//!
//! Offsets couple only with their neighbours, so the normal matrix is a band of width at
//! most 5 bordered by the curvature.
use itertools::{Itertools, MinMaxResult};
use nalgebra::{DVector, Matrix2, SymmetricEigen, Vector2};

use crate::{
    align_errors::AlignError,
    alignment::{derivatives::residual_derivative, registry::AlignmentLookup},
    constants::{SensorId, EPS},
    fit::{
        band::{BandSolution, BorderedBandMatrix},
        FitOutcome, FitRow, FitterConfig, GlobalDerivatives, LocalDerivatives, PointResult,
        RowKind,
    },
    trajectory::{Bending, Trajectory},
};

/// Relative determinant of the residual covariance below which a hit is taken to fix the
/// fitted position alone
const LEVERAGE_LIMIT: f64 = 1e-8;

/// Position of a trajectory point in terms of its enclosing offset points.
#[derive(Debug, Clone, Copy)]
struct Interpolation {
    lo: usize,
    hi: usize,
    w_lo: f64,
    w_hi: f64,
    /// ½ (s − s_lo)(s − s_hi)
    curvature: f64,
}

/// Parametrization of one trajectory.
struct Model<'a> {
    trajectory: &'a Trajectory,
    offset_s: Vec<f64>,
    interpolation: Vec<Interpolation>,
    bending: Option<Bending>,
    n_border: usize,
}

/// Add `value` at `index`, merging with an existing entry.
fn accumulate(a: &mut LocalDerivatives, index: usize, value: f64) {
    if value == 0.0 {
        return;
    }
    match a.iter_mut().find(|(i, _)| *i == index) {
        Some(entry) => entry.1 += value,
        None => a.push((index, value)),
    }
}

fn evaluate(a: &[(usize, f64)], parameters: &DVector<f64>) -> f64 {
    a.iter().map(|&(i, v)| v * parameters[i]).sum()
}

impl<'a> Model<'a> {
    fn new(trajectory: &'a Trajectory) -> Result<Self, AlignError> {
        let offset_points = trajectory.offset_points();
        if offset_points.len() < 2 {
            return Err(AlignError::SingularFit(
                "a trajectory needs at least two points".into(),
            ));
        }
        let offset_s: Vec<f64> = offset_points
            .iter()
            .map(|&i| trajectory.points[i].path_length)
            .collect();
        if offset_s.windows(2).any(|w| w[1] - w[0] <= EPS) {
            return Err(AlignError::SingularFit(
                "trajectory points are not ordered by path length".into(),
            ));
        }

        let mut rank = 0;
        let mut interpolation = Vec::with_capacity(trajectory.len());
        for (i, point) in trajectory.points.iter().enumerate() {
            if offset_points.get(rank) == Some(&i) {
                interpolation.push(Interpolation {
                    lo: rank,
                    hi: rank,
                    w_lo: 1.0,
                    w_hi: 0.0,
                    curvature: 0.0,
                });
                rank += 1;
            } else {
                let (lo, hi) = (rank - 1, rank);
                let (s_lo, s_hi) = (offset_s[lo], offset_s[hi]);
                let s = point.path_length;
                if !(s > s_lo && s < s_hi) {
                    return Err(AlignError::SingularFit(
                        "trajectory points are not ordered by path length".into(),
                    ));
                }
                let t = (s - s_lo) / (s_hi - s_lo);
                interpolation.push(Interpolation {
                    lo,
                    hi,
                    w_lo: 1.0 - t,
                    w_hi: t,
                    curvature: 0.5 * (s - s_lo) * (s - s_hi),
                });
            }
        }

        Ok(Model {
            trajectory,
            offset_s,
            interpolation,
            bending: trajectory.bending,
            n_border: usize::from(trajectory.bending.is_some()),
        })
    }

    fn n_params(&self) -> usize {
        self.n_border + 2 * self.offset_s.len()
    }

    fn offset_index(&self, rank: usize, axis: usize) -> usize {
        self.n_border + 2 * rank + axis
    }

    /// Rank of an offset point that can carry a kink.
    fn inner_rank(&self, point: usize) -> Option<usize> {
        let ip = self.interpolation[point];
        (ip.lo == ip.hi && ip.lo > 0 && ip.lo + 1 < self.offset_s.len()).then_some(ip.lo)
    }

    fn position_coefficients(&self, point: usize, axis: usize) -> LocalDerivatives {
        let ip = self.interpolation[point];
        let mut a = LocalDerivatives::new();
        accumulate(&mut a, self.offset_index(ip.lo, axis), ip.w_lo);
        accumulate(&mut a, self.offset_index(ip.hi, axis), ip.w_hi);
        if let Some(bending) = self.bending {
            accumulate(&mut a, 0, ip.curvature * bending.direction[axis]);
        }
        a
    }

    fn kink_coefficients(&self, rank: usize, axis: usize) -> LocalDerivatives {
        let s = &self.offset_s;
        let (dm, dp) = (s[rank] - s[rank - 1], s[rank + 1] - s[rank]);
        let mut a = LocalDerivatives::new();
        accumulate(&mut a, self.offset_index(rank - 1, axis), 1.0 / dm);
        accumulate(&mut a, self.offset_index(rank, axis), -1.0 / dp - 1.0 / dm);
        accumulate(&mut a, self.offset_index(rank + 1, axis), 1.0 / dp);
        if let Some(bending) = self.bending {
            accumulate(&mut a, 0, -0.5 * (dp + dm) * bending.direction[axis]);
        }
        a
    }

    fn offset(&self, rank: usize, p: &DVector<f64>) -> Vector2<f64> {
        Vector2::new(p[self.offset_index(rank, 0)], p[self.offset_index(rank, 1)])
    }

    fn position(&self, point: usize, p: &DVector<f64>) -> Vector2<f64> {
        Vector2::new(
            evaluate(&self.position_coefficients(point, 0), p),
            evaluate(&self.position_coefficients(point, 1), p),
        )
    }

    /// Slope of the segment between two offset points, at path length `s`.
    fn segment_slope(&self, a: usize, b: usize, s: f64, p: &DVector<f64>) -> Vector2<f64> {
        let (s_a, s_b) = (self.offset_s[a], self.offset_s[b]);
        let linear = (self.offset(b, p) - self.offset(a, p)) / (s_b - s_a);
        match self.bending {
            Some(bending) => linear + bending.direction * (0.5 * p[0] * (2.0 * s - s_a - s_b)),
            None => linear,
        }
    }

    /// Fitted slopes at a point; at an offset point the incoming and outgoing slopes are
    /// averaged.
    fn slopes(&self, point: usize, p: &DVector<f64>) -> Vector2<f64> {
        let ip = self.interpolation[point];
        let s = self.trajectory.points[point].path_length;
        if ip.lo != ip.hi {
            return self.segment_slope(ip.lo, ip.hi, s, p);
        }
        let last = self.offset_s.len() - 1;
        let segments: Vec<Vector2<f64>> = [
            (ip.lo > 0).then(|| self.segment_slope(ip.lo - 1, ip.lo, s, p)),
            (ip.lo < last).then(|| self.segment_slope(ip.lo, ip.lo + 1, s, p)),
        ]
        .into_iter()
        .flatten()
        .collect();
        segments.iter().sum::<Vector2<f64>>() / segments.len() as f64
    }

    /// 2×2 covariance of the fitted position at a point.
    fn position_covariance(&self, point: usize, solution: &BandSolution) -> Matrix2<f64> {
        let ax = self.position_coefficients(point, 0);
        let ay = self.position_coefficients(point, 1);
        let xy = solution.covariance_of(&ax, &ay);
        Matrix2::new(
            solution.covariance_of(&ax, &ax),
            xy,
            xy,
            solution.covariance_of(&ay, &ay),
        )
    }
}

/// Linear constraint on the local parameters.
#[derive(Debug, Clone)]
struct Constraint {
    kind: RowKind,
    sensor_id: SensorId,
    value: f64,
    variance: f64,
    coefficients: LocalDerivatives,
}

impl Constraint {
    fn is_kink(&self) -> bool {
        matches!(self.kind, RowKind::Kink { .. })
    }
}

/// Independent directions of a 2D measurement with their variances.
fn measurement_directions(covariance: &Matrix2<f64>) -> [(Vector2<f64>, f64); 2] {
    if covariance[(0, 1)] == 0.0 && covariance[(1, 0)] == 0.0 {
        return [
            (Vector2::x(), covariance[(0, 0)]),
            (Vector2::y(), covariance[(1, 1)]),
        ];
    }
    let eigen = SymmetricEigen::new(*covariance);
    [0, 1].map(|k| (eigen.eigenvectors.column(k).into_owned(), eigen.eigenvalues[k]))
}

/// Global derivatives of one measurement row.
fn global_derivatives(
    lookup: &impl AlignmentLookup,
    sensor_id: SensorId,
    local: &Vector2<f64>,
    slopes: &Vector2<f64>,
    direction: &Vector2<f64>,
) -> GlobalDerivatives {
    lookup
        .dofs()
        .iter()
        .filter_map(|dof| {
            let label = lookup.label(sensor_id, dof)?;
            let d = residual_derivative(dof, local, slopes).dot(direction);
            (d != 0.0).then_some((label, d))
        })
        .collect()
}

/// Broken-line fit of trajectories, with optional outlier down-weighting.
#[derive(Debug, Clone, Default)]
pub struct BrokenLineFitter {
    config: FitterConfig,
}

impl BrokenLineFitter {
    pub fn new(config: FitterConfig) -> Self {
        BrokenLineFitter { config }
    }

    pub fn config(&self) -> &FitterConfig {
        &self.config
    }

    /// Fit one trajectory.
    ///
    /// Arguments
    /// -----------------
    /// * `trajectory`: the assembled trajectory.
    /// * `lookup`: resolves the alignment labels of the measured sensors; measurement rows
    ///   get one global derivative per resolved, non-zero `(sensor, dof)` pair.
    ///
    /// Return
    /// ----------
    /// * The [`FitOutcome`] of the last iteration.
    /// * [`AlignError::SingularFit`] when the constraints do not determine the parameters.
    ///
    /// See also
    /// ------------
    /// * [`crate::trajectory::assembler::TrajectoryAssembler::assemble`] – Builds the input.
    /// * [`crate::fit::outlier::OutlierPolicy`] – Down-weighting functions.
    pub fn fit(
        &self,
        trajectory: &Trajectory,
        lookup: &impl AlignmentLookup,
    ) -> Result<FitOutcome, AlignError> {
        let model = Model::new(trajectory)?;
        let constraints = self.constraints(&model)?;
        let width = constraints
            .iter()
            .map(|c| {
                match c
                    .coefficients
                    .iter()
                    .map(|(i, _)| *i)
                    .filter(|&i| i >= model.n_border)
                    .minmax()
                {
                    MinMaxResult::MinMax(lo, hi) => hi - lo,
                    _ => 0,
                }
            })
            .max()
            .unwrap_or(0)
            .max(3);

        let policy = self.config.outlier_policy;
        let mut weights = vec![1.0; constraints.len()];
        let mut iterations = 0;
        let solution = loop {
            iterations += 1;
            let solution = self.solve(&model, &constraints, &weights, width)?;
            if policy.is_none() || iterations >= self.config.max_iterations {
                break solution;
            }

            let mut change = 0.0_f64;
            let next: Vec<f64> = constraints
                .iter()
                .zip(&weights)
                .map(|(c, &w)| {
                    if c.is_kink() {
                        return 1.0;
                    }
                    let residual = c.value - evaluate(&c.coefficients, &solution.parameters);
                    let updated = policy.weight(residual / c.variance.sqrt());
                    change = change.max((updated - w).abs());
                    updated
                })
                .collect();
            if change < self.config.weight_tolerance {
                break solution;
            }
            weights = next;
        };

        Ok(self.outcome(&model, &constraints, &weights, &solution, iterations, lookup))
    }

    fn constraints(&self, model: &Model<'_>) -> Result<Vec<Constraint>, AlignError> {
        let mut constraints = Vec::new();
        for (i, point) in model.trajectory.points.iter().enumerate() {
            if let Some(m) = point.measurement.filter(|m| m.active) {
                for (direction, variance) in measurement_directions(&m.covariance) {
                    if variance == f64::INFINITY {
                        continue;
                    }
                    if !(variance > 0.0) {
                        return Err(AlignError::SingularFit(format!(
                            "measurement on sensor {} has a non-positive variance",
                            point.sensor_id
                        )));
                    }
                    let mut coefficients = LocalDerivatives::new();
                    for axis in 0..2 {
                        for (index, a) in model.position_coefficients(i, axis) {
                            accumulate(&mut coefficients, index, direction[axis] * a);
                        }
                    }
                    constraints.push(Constraint {
                        kind: RowKind::Measurement {
                            point: i,
                            direction,
                        },
                        sensor_id: point.sensor_id,
                        value: direction.dot(&m.position),
                        variance,
                        coefficients,
                    });
                }
            }

            if let (Some(scatterer), Some(rank)) = (point.scatterer, model.inner_rank(i)) {
                for axis in 0..2 {
                    let variance = scatterer.variance[axis];
                    if !(variance > 0.0 && variance.is_finite()) {
                        return Err(AlignError::SingularFit(format!(
                            "scatterer on sensor {} has no kink variance",
                            point.sensor_id
                        )));
                    }
                    constraints.push(Constraint {
                        kind: RowKind::Kink { point: i, axis },
                        sensor_id: point.sensor_id,
                        value: 0.0,
                        variance,
                        coefficients: model.kink_coefficients(rank, axis),
                    });
                }
            }
        }
        Ok(constraints)
    }

    fn solve(
        &self,
        model: &Model<'_>,
        constraints: &[Constraint],
        weights: &[f64],
        width: usize,
    ) -> Result<BandSolution, AlignError> {
        let n_params = model.n_params();
        let used = weights.iter().filter(|&&w| w > 0.0).count();
        if used < n_params {
            return Err(AlignError::SingularFit(format!(
                "{used} constraints for {n_params} parameters"
            )));
        }

        let mut matrix = BorderedBandMatrix::new(model.n_border, n_params - model.n_border, width);
        let mut rhs = DVector::zeros(n_params);
        for (c, &w) in constraints.iter().zip(weights) {
            if w <= 0.0 {
                continue;
            }
            let scale = w / c.variance;
            matrix.add_outer(&c.coefficients, scale);
            for &(i, a) in &c.coefficients {
                rhs[i] += scale * a * c.value;
            }
        }
        matrix.solve_and_invert(&rhs, self.config.singularity_threshold)
    }

    fn outcome(
        &self,
        model: &Model<'_>,
        constraints: &[Constraint],
        weights: &[f64],
        solution: &BandSolution,
        iterations: usize,
        lookup: &impl AlignmentLookup,
    ) -> FitOutcome {
        let p = &solution.parameters;

        // measurement covariance seen by the fit, down-weighting included
        let mut effective: Vec<Option<(Matrix2<f64>, usize)>> =
            vec![Some((Matrix2::zeros(), 0)); model.trajectory.points.len()];
        for (c, &w) in constraints.iter().zip(weights) {
            if let RowKind::Measurement { point, direction } = c.kind {
                effective[point] = effective[point].filter(|_| w > 0.0).map(|(v, rows)| {
                    (v + direction * direction.transpose() * (c.variance / w), rows + 1)
                });
            }
        }

        let points: Vec<PointResult> = model
            .trajectory
            .points
            .iter()
            .enumerate()
            .map(|(i, point)| {
                let position = model.position(i, p);
                let slopes = model.slopes(i, p);
                let (residual, residual_covariance, unbiased_residual) = match point.measurement {
                    Some(m) => {
                        let fit_cov = model.position_covariance(i, solution);
                        let residual = m.position - position;
                        if m.active {
                            let unbiased = effective[i].and_then(|(v, rows)| {
                                unbiased_residual(&v, rows, &fit_cov, &residual)
                            });
                            (Some(residual), Some(m.covariance - fit_cov), unbiased)
                        } else {
                            (Some(residual), Some(m.covariance + fit_cov), Some(residual))
                        }
                    }
                    None => (None, None, None),
                };
                PointResult {
                    sensor_id: point.sensor_id,
                    path_length: point.path_length,
                    position,
                    slopes,
                    residual,
                    residual_covariance,
                    unbiased_residual,
                    active: point.is_measured(),
                }
            })
            .collect();

        let mut chi2 = 0.0;
        let mut lost_weight = 0.0;
        let rows: Vec<FitRow> = constraints
            .iter()
            .zip(weights)
            .map(|(c, &w)| {
                let residual = c.value - evaluate(&c.coefficients, p);
                let fit_variance = solution.covariance_of(&c.coefficients, &c.coefficients);
                chi2 += w * residual * residual / c.variance;

                let global_derivatives = match c.kind {
                    RowKind::Measurement { point, direction } => {
                        lost_weight += 1.0 - w;
                        let state = &points[point];
                        let local = state.position - model.trajectory.points[point].origin;
                        global_derivatives(lookup, c.sensor_id, &local, &state.slopes, &direction)
                    }
                    RowKind::Kink { .. } => GlobalDerivatives::new(),
                };

                FitRow {
                    kind: c.kind,
                    sensor_id: c.sensor_id,
                    value: c.value,
                    sigma: c.variance.sqrt(),
                    local_derivatives: c.coefficients.clone(),
                    global_derivatives,
                    residual,
                    residual_sigma: (c.variance - fit_variance).max(0.0).sqrt(),
                    down_weight: w,
                }
            })
            .collect();

        let used = weights.iter().filter(|&&w| w > 0.0).count();
        let ndf = used - model.n_params();

        tracing::trace!(chi2, ndf, iterations, "broken-line fit");

        FitOutcome {
            chi2,
            ndf,
            lost_weight,
            iterations,
            curvature: model.bending.map(|_| p[0]),
            rows,
            points,
        }
    }
}

/// Residual of a hit as if it had been left out of the fit, `V (V − C)⁻¹ r`, with `V` the
/// effective hit covariance and `C` the covariance of the fitted position.
///
/// `None` for hits constrained in a single direction and for hits that alone determine the
/// fitted position (leverage close to one).
fn unbiased_residual(
    effective: &Matrix2<f64>,
    rows: usize,
    fit_cov: &Matrix2<f64>,
    residual: &Vector2<f64>,
) -> Option<Vector2<f64>> {
    if rows < 2 {
        return None;
    }
    let biased = effective - fit_cov;
    if !(biased.determinant() > LEVERAGE_LIMIT * effective.determinant()) {
        return None;
    }
    biased.try_inverse().map(|inverse| effective * inverse * residual)
}
