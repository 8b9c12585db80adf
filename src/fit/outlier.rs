//! M-estimator down-weighting of outlying measurements.
//!
//! Each policy maps the normalized residual `t = r / σ` of a measurement row to a weight in
//! `[0, 1]`. The fit is repeated with the new weights until they settle.
//!
//! | policy      | default `c` | weight                                   |
//! |-------------|-------------|------------------------------------------|
//! | `Huber`     | 1.345       | `1` if `|t| ≤ c`, else `c / |t|`         |
//! | `Cauchy`    | 2.3849      | `1 / (1 + (t/c)²)`                       |
//! | `Truncated` | 3.0         | `1` if `|t| ≤ c`, else `0`               |
//! | `Tukey`     | 4.6851      | `(1 − (t/c)²)²` if `|t| < c`, else `0`   |
use std::str::FromStr;

use crate::align_errors::AlignError;

pub const HUBER_CUT: f64 = 1.345;
pub const CAUCHY_CUT: f64 = 2.3849;
pub const TRUNCATION_CUT: f64 = 3.0;
pub const TUKEY_CUT: f64 = 4.6851;

/// Down-weighting policy with its tuning constant.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum OutlierPolicy {
    #[default]
    None,
    Huber(f64),
    Cauchy(f64),
    Truncated(f64),
    Tukey(f64),
}

impl OutlierPolicy {
    pub fn huber() -> Self {
        OutlierPolicy::Huber(HUBER_CUT)
    }

    pub fn cauchy() -> Self {
        OutlierPolicy::Cauchy(CAUCHY_CUT)
    }

    pub fn truncated() -> Self {
        OutlierPolicy::Truncated(TRUNCATION_CUT)
    }

    pub fn tukey() -> Self {
        OutlierPolicy::Tukey(TUKEY_CUT)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, OutlierPolicy::None)
    }

    fn cut(&self) -> Option<f64> {
        match *self {
            OutlierPolicy::None => None,
            OutlierPolicy::Huber(c)
            | OutlierPolicy::Cauchy(c)
            | OutlierPolicy::Truncated(c)
            | OutlierPolicy::Tukey(c) => Some(c),
        }
    }

    /// Check that the tuning constant is positive and finite.
    pub fn validate(&self) -> Result<(), AlignError> {
        match self.cut() {
            Some(c) if !(c > 0.0 && c.is_finite()) => Err(AlignError::InvalidConfiguration(
                format!("outlier cut must be positive, got {c}"),
            )),
            _ => Ok(()),
        }
    }

    /// Weight of a measurement with normalized residual `t`.
    pub fn weight(&self, t: f64) -> f64 {
        let a = t.abs();
        match *self {
            OutlierPolicy::None => 1.0,
            OutlierPolicy::Huber(c) => {
                if a <= c {
                    1.0
                } else {
                    c / a
                }
            }
            OutlierPolicy::Cauchy(c) => 1.0 / (1.0 + (t / c).powi(2)),
            OutlierPolicy::Truncated(c) => {
                if a <= c {
                    1.0
                } else {
                    0.0
                }
            }
            OutlierPolicy::Tukey(c) => {
                if a < c {
                    (1.0 - (t / c).powi(2)).powi(2)
                } else {
                    0.0
                }
            }
        }
    }
}

impl FromStr for OutlierPolicy {
    type Err = AlignError;

    /// Accepts the policy name or its initial, case-insensitively (`"huber"`, `"H"`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(OutlierPolicy::None),
            "h" | "huber" => Ok(OutlierPolicy::huber()),
            "c" | "cauchy" => Ok(OutlierPolicy::cauchy()),
            "t" | "truncated" => Ok(OutlierPolicy::truncated()),
            "k" | "tukey" => Ok(OutlierPolicy::tukey()),
            _ => Err(AlignError::InvalidConfiguration(format!(
                "unknown outlier policy: {s}"
            ))),
        }
    }
}
