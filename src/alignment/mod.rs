//! # Alignment degrees of freedom
//!
//! Every sensor can move along and rotate around the three telescope axes. The six kinds of
//! motion are the [`Dof`] variants; a run only adjusts the subset selected by its
//! [`AlignmentMode`].
//!
//! ## Canonical order
//!
//! The canonical order `ShiftX, ShiftY, ShiftZ, RotX, RotY, RotZ` is used everywhere labels
//! are generated (see [`registry`]). It is encoded in the discriminants of [`Dof`] and must
//! never change: the solver result refers to parameters only by label.
//!
//! ## Modes
//!
//! | mode              | dofs                          |
//! |-------------------|-------------------------------|
//! | `XYShift`         | ShiftX, ShiftY                |
//! | `XYShiftRotZ`     | ShiftX, ShiftY, RotZ          |
//! | `XYZShiftRotZ`    | ShiftX, ShiftY, ShiftZ, RotZ  |
//! | `XYShiftRotXYZ`   | ShiftX, ShiftY, RotX, RotY, RotZ |
//! | `XYZShiftRotXYZ`  | all six                       |
//! | `Custom(set)`     | any [`DofSet`]                |
use std::{fmt, str::FromStr};

use crate::align_errors::AlignError;

pub mod derivatives;
pub mod registry;

/// Kind of alignment degree of freedom, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dof {
    ShiftX = 0,
    ShiftY = 1,
    ShiftZ = 2,
    RotX = 3,
    RotY = 4,
    RotZ = 5,
}

impl Dof {
    /// All degrees of freedom in canonical order.
    pub const ALL: [Dof; 6] = [
        Dof::ShiftX,
        Dof::ShiftY,
        Dof::ShiftZ,
        Dof::RotX,
        Dof::RotY,
        Dof::RotZ,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_shift(self) -> bool {
        matches!(self, Dof::ShiftX | Dof::ShiftY | Dof::ShiftZ)
    }

    pub fn name(self) -> &'static str {
        match self {
            Dof::ShiftX => "shiftX",
            Dof::ShiftY => "shiftY",
            Dof::ShiftZ => "shiftZ",
            Dof::RotX => "rotX",
            Dof::RotY => "rotY",
            Dof::RotZ => "rotZ",
        }
    }
}

impl fmt::Display for Dof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dof {
    type Err = AlignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dof::ALL
            .into_iter()
            .find(|d| d.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| AlignError::InvalidConfiguration(format!("unknown dof: {s}")))
    }
}

/// Compact set of degrees of freedom; iteration follows the canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DofSet(u8);

impl DofSet {
    pub const fn empty() -> Self {
        DofSet(0)
    }

    pub const fn all() -> Self {
        DofSet(0b11_1111)
    }

    pub fn contains(&self, dof: Dof) -> bool {
        self.0 & (1 << dof.index()) != 0
    }

    pub fn insert(&mut self, dof: Dof) {
        self.0 |= 1 << dof.index();
    }

    pub fn with(mut self, dof: Dof) -> Self {
        self.insert(dof);
        self
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Dof> {
        let set = *self;
        Dof::ALL.into_iter().filter(move |d| set.contains(*d))
    }
}

impl FromIterator<Dof> for DofSet {
    fn from_iter<T: IntoIterator<Item = Dof>>(iter: T) -> Self {
        iter.into_iter().fold(DofSet::empty(), DofSet::with)
    }
}

/// Subset of degrees of freedom adjusted in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlignmentMode {
    #[default]
    XYShift,
    XYShiftRotZ,
    XYZShiftRotZ,
    XYShiftRotXYZ,
    XYZShiftRotXYZ,
    Custom(DofSet),
}

impl AlignmentMode {
    pub fn dofs(&self) -> DofSet {
        use Dof::*;
        match self {
            AlignmentMode::XYShift => [ShiftX, ShiftY].into_iter().collect(),
            AlignmentMode::XYShiftRotZ => [ShiftX, ShiftY, RotZ].into_iter().collect(),
            AlignmentMode::XYZShiftRotZ => [ShiftX, ShiftY, ShiftZ, RotZ].into_iter().collect(),
            AlignmentMode::XYShiftRotXYZ => {
                [ShiftX, ShiftY, RotX, RotY, RotZ].into_iter().collect()
            }
            AlignmentMode::XYZShiftRotXYZ => DofSet::all(),
            AlignmentMode::Custom(set) => *set,
        }
    }
}

impl FromStr for AlignmentMode {
    type Err = AlignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "XYShift" => Ok(AlignmentMode::XYShift),
            "XYShiftRotZ" => Ok(AlignmentMode::XYShiftRotZ),
            "XYZShiftRotZ" => Ok(AlignmentMode::XYZShiftRotZ),
            "XYShiftRotXYZ" => Ok(AlignmentMode::XYShiftRotXYZ),
            "XYZShiftRotXYZ" => Ok(AlignmentMode::XYZShiftRotXYZ),
            _ => Err(AlignError::InvalidConfiguration(format!(
                "unknown alignment mode: {s}"
            ))),
        }
    }
}
