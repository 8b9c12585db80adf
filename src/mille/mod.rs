//! # Binary derivative record stream
//!
//! Append-only binary file handed to the external alignment solver. Every accepted track is
//! written as one record holding one [`DerivativeRecord`] per fit constraint. All values
//! are little-endian.
//!
//! ## File layout
//!
//! ```text
//! header   : b"TLMB" | u32 version | u32 capacity (words per record) | u32 float width
//! record   : i32 n | n/2 floats | n/2 i32      (n negated for 8-byte floats)
//! ```
//!
//! Inside a record the floats and ints form `(float, int)` word pairs. Word 0 is
//! `(0.0, 0)`; then, per constraint,
//!
//! ```text
//! (value, 0) (dL, i)* (σ, 0) (w, 0) (dG, label)*
//! ```
//!
//! where `i ≥ 1` is the local parameter index, `w` the down-weight and `label ≥ 1` the
//! alignment label. The zero ints delimit the blocks.
use smallvec::SmallVec;

use crate::{
    align_errors::AlignError,
    constants::{Label, MAX_LABEL},
    fit::FitRow,
};

pub mod reader;
pub mod writer;

/// Width of the floats stored in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordPrecision {
    #[default]
    F32,
    F64,
}

impl RecordPrecision {
    /// Size of one float in bytes.
    pub fn width(self) -> u32 {
        match self {
            RecordPrecision::F32 => 4,
            RecordPrecision::F64 => 8,
        }
    }

    pub fn from_width(width: u32) -> Result<Self, AlignError> {
        match width {
            4 => Ok(RecordPrecision::F32),
            8 => Ok(RecordPrecision::F64),
            w => Err(AlignError::MalformedRecord(format!(
                "unsupported float width {w}"
            ))),
        }
    }
}

/// File-level header of the record stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u32,
    /// Maximum number of words in one record
    pub capacity: u32,
    pub precision: RecordPrecision,
}

/// Derivatives of one constraint, as stored in the stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DerivativeRecord {
    /// `(local index ≥ 1, derivative)` for every non-zero local derivative
    pub local: SmallVec<[(u32, f64); 8]>,
    /// `(label, derivative)` for every alignment parameter the constraint depends on
    pub globals: SmallVec<[(Label, f64); 6]>,
    pub value: f64,
    pub sigma: f64,
    pub down_weight: f64,
}

impl DerivativeRecord {
    /// Record of one fit constraint; local indices become 1-based.
    pub fn from_row(row: &FitRow) -> Self {
        DerivativeRecord {
            local: row
                .local_derivatives
                .iter()
                .filter(|(_, d)| *d != 0.0)
                .map(|&(i, d)| (i as u32 + 1, d))
                .collect(),
            globals: row.global_derivatives.clone(),
            value: row.value,
            sigma: row.sigma,
            down_weight: row.down_weight,
        }
    }

    /// Number of `(float, int)` words this record occupies.
    pub fn words(&self) -> usize {
        3 + self.local.len() + self.globals.len()
    }

    /// Check the indices and labels before they reach the stream.
    pub fn validate(&self) -> Result<(), AlignError> {
        if let Some(&(label, _)) = self
            .globals
            .iter()
            .find(|(label, _)| !(1..=MAX_LABEL).contains(label))
        {
            return Err(AlignError::InvalidLabel(label));
        }
        if self
            .local
            .iter()
            .any(|&(i, _)| i == 0 || i > i32::MAX as u32)
        {
            return Err(AlignError::MalformedRecord(
                "local indices must be in 1..=i32::MAX".into(),
            ));
        }
        Ok(())
    }
}
