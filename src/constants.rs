//! # Constants and type definitions for telalign
//!
//! This module centralizes the **physical constants**, **default artifact names**, and
//! **common type aliases** used throughout the crate.
//!
//! ## Overview
//!
//! - Multiple-scattering constants (Highland formula) and the field-to-curvature factor
//! - Default file names of the solver artifacts (binary record stream, steering, result)
//! - Limits of the binary record format (label range, reserved record capacity)
//! - Type aliases for sensor identifiers, alignment labels and lengths
//!
//! Units follow the usual telescope conventions: lengths in **millimetres**, momenta in
//! **GeV/c**, magnetic field in **tesla**, material as a fraction of a radiation length.

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Identifier of a detector plane (sensor), as used by the geometry description.
pub type SensorId = i32;

/// Integer label of an alignment parameter, unique within a run (starts at 1).
pub type Label = i32;

/// Length in millimetres
pub type Millimeter = f64;

/// Material budget expressed as thickness over radiation length (x/X0)
pub type RadiationLengths = f64;

// -------------------------------------------------------------------------------------------------
// Physical constants
// -------------------------------------------------------------------------------------------------

/// Highland formula scale, in GeV
pub const HIGHLAND_SCALE_GEV: f64 = 0.0136;

/// Highland logarithmic correction coefficient
pub const HIGHLAND_LOG_COEFF: f64 = 0.038;

/// Curvature per millimetre for unit charge, 1 T and 1 GeV/c (c · 1e-3 mm⁻¹)
pub const CURVATURE_PER_TESLA_GEV_MM: f64 = 0.299_792_458e-3;

/// Numerical epsilon used for floating-point comparisons on geometry
pub const EPS: f64 = 1e-9;

// -------------------------------------------------------------------------------------------------
// Solver artifacts
// -------------------------------------------------------------------------------------------------

/// Default name of the binary record stream
pub const DEFAULT_BINARY_FILE: &str = "millepede.bin";

/// Default name of the steering description
pub const DEFAULT_STEERING_FILE: &str = "steer.txt";

/// Result file name written by the external solver in its working directory
pub const DEFAULT_RESULT_FILE: &str = "millepede.res";

/// Default external solver executable
pub const DEFAULT_SOLVER_COMMAND: &str = "pede";

/// Presigma marking a parameter as fixed in the steering description
pub const FIXED_PRESIGMA: f64 = -1.0;

/// Presigma marking a parameter as free in the steering description
pub const FREE_PRESIGMA: f64 = 0.0;

// -------------------------------------------------------------------------------------------------
// Binary record format
// -------------------------------------------------------------------------------------------------

/// Magic bytes at the start of a record stream
pub const RECORD_MAGIC: [u8; 4] = *b"TLMB";

/// Version of the record stream layout
pub const RECORD_FORMAT_VERSION: u32 = 1;

/// Default maximum number of (float, int) words in a single record
pub const DEFAULT_RECORD_CAPACITY: u32 = 5000;

/// Largest record capacity whose signed word count (`2 · words`) still fits an `i32`
pub const MAX_RECORD_CAPACITY: u32 = (i32::MAX / 2) as u32;

/// Largest label accepted by the solver
pub const MAX_LABEL: Label = i32::MAX;
