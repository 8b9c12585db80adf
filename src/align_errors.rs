use thiserror::Error;

use crate::constants::{Label, SensorId};

#[derive(Error, Debug)]
pub enum AlignError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Degenerate trajectory: {measured} measured planes, at least {required} required")]
    DegenerateTrajectory { measured: usize, required: usize },

    #[error("Unfit-able trajectory: {0}")]
    SingularFit(String),

    #[error("Record stream I/O failure: {0}")]
    RecordStream(#[from] std::io::Error),

    #[error("Record exceeds the reserved capacity of {capacity} words ({requested} requested)")]
    RecordOverflow { capacity: usize, requested: usize },

    #[error("Invalid alignment label {0}")]
    InvalidLabel(Label),

    #[error("Malformed record stream: {0}")]
    MalformedRecord(String),

    #[error("Unknown sensor id {0}")]
    UnknownSensor(SensorId),

    #[error("Unable to write the steering description: {0}")]
    SteeringWrite(String),

    #[error("Solver executable not found: {0}")]
    SolverNotFound(String),

    #[error("Solver exited with status {status:?}")]
    SolverFailed { status: Option<i32> },

    #[error("Solver result file missing: {0}")]
    ResultMissing(String),

    #[error("Error during the solver result parsing: {0}")]
    ResultParse(String),

    #[error("Geometry update failure: {0}")]
    GeometryUpdate(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid orchestrator transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

impl PartialEq for AlignError {
    fn eq(&self, other: &Self) -> bool {
        use AlignError::*;
        match (self, other) {
            (InvalidConfiguration(a), InvalidConfiguration(b)) => a == b,
            (
                DegenerateTrajectory {
                    measured: a,
                    required: b,
                },
                DegenerateTrajectory {
                    measured: c,
                    required: d,
                },
            ) => a == c && b == d,
            (SingularFit(a), SingularFit(b)) => a == b,

            // io / csv errors are not comparable: same variant is enough
            (RecordStream(_), RecordStream(_)) => true,
            (Csv(_), Csv(_)) => true,

            (
                RecordOverflow {
                    capacity: a,
                    requested: b,
                },
                RecordOverflow {
                    capacity: c,
                    requested: d,
                },
            ) => a == c && b == d,
            (InvalidLabel(a), InvalidLabel(b)) => a == b,
            (MalformedRecord(a), MalformedRecord(b)) => a == b,
            (UnknownSensor(a), UnknownSensor(b)) => a == b,
            (SteeringWrite(a), SteeringWrite(b)) => a == b,
            (SolverNotFound(a), SolverNotFound(b)) => a == b,
            (SolverFailed { status: a }, SolverFailed { status: b }) => a == b,
            (ResultMissing(a), ResultMissing(b)) => a == b,
            (ResultParse(a), ResultParse(b)) => a == b,
            (GeometryUpdate(a), GeometryUpdate(b)) => a == b,
            (InvalidTransition { from: a, to: b }, InvalidTransition { from: c, to: d }) => {
                a == c && b == d
            }

            _ => false,
        }
    }
}
