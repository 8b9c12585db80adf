//! Steering description handed to the solver.
//!
//! ```text
//! Cfiles
//! millepede.bin
//!
//! Parameter
//! 1 -0.0123 0.0 ! 2 shiftX
//! 2 0.0 -1.0 ! 0 shiftX
//!
//! method inversion 5 0.1
//! end
//! ```
//!
//! Free parameters carry presigma `0.0` and their seed; fixed parameters carry presigma
//! `-1.0` and the value `0.0`.
use std::fmt;

use camino::Utf8Path;

use crate::{
    align_errors::AlignError,
    alignment::{registry::AlignmentParameterRegistry, Dof},
    constants::{Label, SensorId, FIXED_PRESIGMA, FREE_PRESIGMA},
};

/// One line of the `Parameter` section.
#[derive(Debug, Clone, PartialEq)]
pub struct SteeringParameter {
    pub label: Label,
    pub initial_value: f64,
    pub presigma: f64,
    pub sensor_id: SensorId,
    pub dof: Dof,
}

impl SteeringParameter {
    pub fn is_fixed(&self) -> bool {
        self.presigma < 0.0
    }
}

/// Content of a steering file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Steering {
    pub binary_files: Vec<String>,
    pub parameters: Vec<SteeringParameter>,
    pub directives: Vec<String>,
}

impl Steering {
    /// Steering for one binary file and every parameter of `registry`, in label order.
    ///
    /// Arguments
    /// -----------------
    /// * `binary_file`: record stream name, as the solver will see it from its working
    ///   directory.
    /// * `registry`: the run's parameters, with their seeds and fixed flags.
    /// * `directives`: raw solver directives; `\\` separates lines.
    pub fn from_registry(
        binary_file: &str,
        registry: &AlignmentParameterRegistry,
        directives: &str,
    ) -> Self {
        let parameters = registry
            .parameters()
            .iter()
            .map(|p| SteeringParameter {
                label: p.label,
                initial_value: p.seed(),
                presigma: if p.fixed {
                    FIXED_PRESIGMA
                } else {
                    FREE_PRESIGMA
                },
                sensor_id: p.sensor_id,
                dof: p.dof,
            })
            .collect();
        Steering {
            binary_files: vec![binary_file.to_string()],
            parameters,
            directives: split_directives(directives),
        }
    }

    /// Write the steering file, mapping any I/O failure to [`AlignError::SteeringWrite`].
    pub fn write(&self, path: &Utf8Path) -> Result<(), AlignError> {
        std::fs::write(path, self.to_string())
            .map_err(|e| AlignError::SteeringWrite(format!("{path}: {e}")))?;
        tracing::info!(%path, parameters = self.parameters.len(), "steering written");
        Ok(())
    }
}

impl fmt::Display for Steering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cfiles")?;
        for file in &self.binary_files {
            writeln!(f, "{file}")?;
        }
        writeln!(f)?;
        writeln!(f, "Parameter")?;
        for p in &self.parameters {
            writeln!(
                f,
                "{} {:?} {:?} ! {} {}",
                p.label, p.initial_value, p.presigma, p.sensor_id, p.dof
            )?;
        }
        writeln!(f)?;
        for line in &self.directives {
            writeln!(f, "{line}")?;
        }
        writeln!(f, "end")
    }
}

/// Split raw directives on the two-backslash separator into trimmed, non-empty lines.
pub fn split_directives(raw: &str) -> Vec<String> {
    raw.split("\\\\")
        .flat_map(str::lines)
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}
