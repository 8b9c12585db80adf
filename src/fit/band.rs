//! # Bordered band matrix
//!
//! Symmetric positive-definite matrix made of a small dense *border* and a large *band*:
//!
//! ```text
//!     | C   B |      C : n_border × n_border (dense)
//! A = |       |      B : n_border × n_band   (dense)
//!     | Bᵀ  N |      N : n_band × n_band, non-zero only for |i − j| ≤ width
//! ```
//!
//! The broken-line normal equations have this shape: the offsets of neighbouring points
//! couple only locally (band), while a curvature parameter couples to every point (border).
//!
//! ## Algorithm
//!
//! * The band is decomposed in place with a root-free Cholesky (`N = L D Lᵀ`). Storage is
//!   `band[(k, i)] = N(i + k, i)`; after decomposition `band[(0, i)] = 1 / D_i` and
//!   `band[(k, i)] = L(i + k, i)`.
//! * The border is eliminated through its Schur complement `S = C − B N⁻¹ Bᵀ`, inverted
//!   densely.
//! * Only the band part of `N⁻¹` is computed, which is all the residual errors need.
//!
//! Complexity is `O(n · width²)` for the band plus `O(n · n_border²)` for the border.
use nalgebra::{Cholesky, DMatrix, DVector};

use crate::align_errors::AlignError;

/// Symmetric matrix with a dense border and a band part.
#[derive(Debug, Clone)]
pub struct BorderedBandMatrix {
    n_border: usize,
    width: usize,
    border: DMatrix<f64>,
    mixed: DMatrix<f64>,
    band: DMatrix<f64>,
}

impl BorderedBandMatrix {
    /// Zero matrix of size `n_border + n_band` with the given band width.
    pub fn new(n_border: usize, n_band: usize, width: usize) -> Self {
        BorderedBandMatrix {
            n_border,
            width,
            border: DMatrix::zeros(n_border, n_border),
            mixed: DMatrix::zeros(n_border, n_band),
            band: DMatrix::zeros(width + 1, n_band),
        }
    }

    pub fn size(&self) -> usize {
        self.n_border + self.band.ncols()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Element `(i, j)` of the full matrix.
    pub fn get(&self, i: usize, j: usize) -> f64 {
        let nb = self.n_border;
        match (i < nb, j < nb) {
            (true, true) => self.border[(i, j)],
            (true, false) => self.mixed[(i, j - nb)],
            (false, true) => self.mixed[(j, i - nb)],
            (false, false) => {
                let (lo, d) = ((i.min(j)) - nb, i.abs_diff(j));
                if d > self.width {
                    0.0
                } else {
                    self.band[(d, lo)]
                }
            }
        }
    }

    fn add(&mut self, i: usize, j: usize, value: f64) {
        let nb = self.n_border;
        match (i < nb, j < nb) {
            (true, true) => {
                self.border[(i, j)] += value;
                if i != j {
                    self.border[(j, i)] += value;
                }
            }
            (true, false) => self.mixed[(i, j - nb)] += value,
            (false, true) => self.mixed[(j, i - nb)] += value,
            (false, false) => {
                let d = i.abs_diff(j);
                debug_assert!(d <= self.width, "element outside of the band");
                self.band[(d, i.min(j) - nb)] += value;
            }
        }
    }

    /// Add `weight · a aᵀ` for a sparse vector `a` given as `(index, value)` pairs with
    /// distinct indices.
    pub fn add_outer(&mut self, a: &[(usize, f64)], weight: f64) {
        for (p, &(i, ai)) in a.iter().enumerate() {
            for &(j, aj) in &a[..=p] {
                self.add(i, j, weight * ai * aj);
            }
        }
    }

    /// Solve `A x = rhs` and compute the covariance blocks needed for residual errors.
    ///
    /// Arguments
    /// -----------------
    /// * `rhs`: right-hand side of length [`BorderedBandMatrix::size`].
    /// * `singularity_threshold`: a band pivot smaller than this fraction of the original
    ///   diagonal element is considered lost to round-off.
    ///
    /// Return
    /// ----------
    /// * A [`BandSolution`], or [`AlignError::SingularFit`] when the matrix is singular or
    ///   not positive definite.
    pub fn solve_and_invert(
        mut self,
        rhs: &DVector<f64>,
        singularity_threshold: f64,
    ) -> Result<BandSolution, AlignError> {
        let nb = self.n_border;
        let n_band = self.band.ncols();

        decompose_band(&mut self.band, self.width, singularity_threshold)?;
        let band_inverse = band_of_inverse(&self.band, self.width);

        let rhs_border = rhs.rows(0, nb).into_owned();
        let rhs_band = rhs.rows(nb, n_band).into_owned();
        let y = solve_band(&self.band, self.width, &rhs_band);

        if nb == 0 {
            return Ok(BandSolution {
                parameters: y,
                n_border: 0,
                width: self.width,
                border_cov: DMatrix::zeros(0, 0),
                mixed_cov: DMatrix::zeros(0, n_band),
                band_cov: band_inverse,
            });
        }

        // X = N⁻¹ Bᵀ, one column per border parameter
        let mut x = DMatrix::zeros(n_band, nb);
        for a in 0..nb {
            let column = self.mixed.row(a).transpose();
            x.set_column(a, &solve_band(&self.band, self.width, &column));
        }

        let schur = &self.border - &self.mixed * &x;
        let s_inv = Cholesky::new(schur)
            .ok_or_else(|| AlignError::SingularFit("border not positive definite".into()))?
            .inverse();

        let border_params = &s_inv * (rhs_border - &self.mixed * &y);
        let band_params = y - &x * &border_params;

        // N⁻¹ + X S⁻¹ Xᵀ, restricted to the band
        let xs = &x * &s_inv;
        let mut band_cov = band_inverse;
        for i in 0..n_band {
            for k in 0..=self.width.min(n_band - i - 1) {
                band_cov[(k, i)] += xs.row(i + k).dot(&x.row(i));
            }
        }

        let mut parameters = DVector::zeros(nb + n_band);
        parameters.rows_mut(0, nb).copy_from(&border_params);
        parameters.rows_mut(nb, n_band).copy_from(&band_params);

        Ok(BandSolution {
            parameters,
            n_border: nb,
            width: self.width,
            mixed_cov: -(xs.transpose()),
            border_cov: s_inv,
            band_cov,
        })
    }
}

/// Solution of a bordered band system with the reachable part of its covariance.
#[derive(Debug, Clone)]
pub struct BandSolution {
    pub parameters: DVector<f64>,
    n_border: usize,
    width: usize,
    border_cov: DMatrix<f64>,
    mixed_cov: DMatrix<f64>,
    band_cov: DMatrix<f64>,
}

impl BandSolution {
    /// Element `(i, j)` of the inverse matrix.
    ///
    /// Band elements further than the band width apart are not computed and read as `0.0`.
    pub fn covariance(&self, i: usize, j: usize) -> f64 {
        let nb = self.n_border;
        match (i < nb, j < nb) {
            (true, true) => self.border_cov[(i, j)],
            (true, false) => self.mixed_cov[(i, j - nb)],
            (false, true) => self.mixed_cov[(j, i - nb)],
            (false, false) => {
                let d = i.abs_diff(j);
                if d > self.width {
                    0.0
                } else {
                    self.band_cov[(d, i.min(j) - nb)]
                }
            }
        }
    }

    /// `aᵀ Cov b` for sparse vectors.
    pub fn covariance_of(&self, a: &[(usize, f64)], b: &[(usize, f64)]) -> f64 {
        a.iter()
            .flat_map(|&(i, ai)| b.iter().map(move |&(j, bj)| (i, j, ai * bj)))
            .map(|(i, j, w)| w * self.covariance(i, j))
            .sum()
    }
}

/// Root-free Cholesky decomposition of a band matrix, in place.
fn decompose_band(
    band: &mut DMatrix<f64>,
    width: usize,
    singularity_threshold: f64,
) -> Result<(), AlignError> {
    let n = band.ncols();
    let original: Vec<f64> = (0..n).map(|i| band[(0, i)]).collect();

    for i in 0..n {
        let pivot = band[(0, i)];
        let aux = 16.0 * original[i].abs();
        if original[i] == 0.0 || pivot + aux == aux || pivot.abs() <= singularity_threshold * aux
        {
            return Err(AlignError::SingularFit(format!(
                "pivot {i} lost to round-off"
            )));
        }
        if pivot < 0.0 {
            return Err(AlignError::SingularFit(format!(
                "matrix not positive definite at pivot {i}"
            )));
        }
        band[(0, i)] = 1.0 / pivot;

        let reach = width.min(n - i - 1);
        for j in 1..=reach {
            let rxw = band[(j, i)] * band[(0, i)];
            for k in 0..=(reach - j) {
                band[(k, i + j)] -= band[(k + j, i)] * rxw;
            }
            band[(j, i)] = rxw;
        }
    }
    Ok(())
}

/// Forward and backward substitution with a decomposed band matrix.
fn solve_band(band: &DMatrix<f64>, width: usize, rhs: &DVector<f64>) -> DVector<f64> {
    let n = band.ncols();
    let mut out = rhs.clone();
    for i in 0..n {
        for j in 1..=width.min(n - i - 1) {
            out[i + j] -= band[(j, i)] * out[i];
        }
    }
    for i in (0..n).rev() {
        let mut rxw = band[(0, i)] * out[i];
        for j in 1..=width.min(n - i - 1) {
            rxw -= band[(j, i)] * out[i + j];
        }
        out[i] = rxw;
    }
    out
}

/// Band part of the inverse of a decomposed band matrix, in the same storage layout.
fn band_of_inverse(band: &DMatrix<f64>, width: usize) -> DMatrix<f64> {
    let n = band.ncols();
    let mut inverse = DMatrix::zeros(width + 1, n);
    for i in (0..n).rev() {
        let mut rxw = band[(0, i)];
        for j in (i.saturating_sub(width)..=i).rev() {
            for k in (j + 1)..=(n - 1).min(j + width) {
                rxw -= inverse[(i.abs_diff(k), i.min(k))] * band[(k - j, j)];
            }
            inverse[(i - j, j)] = rxw;
            rxw = 0.0;
        }
    }
    inverse
}
