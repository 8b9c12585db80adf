//! # Solver interface
//!
//! Files and processes exchanged with the external sparse alignment solver:
//!
//! * [`steering`] – The text description of the parameters and solver directives.
//! * [`result`] – Parser for the solved parameter file.
//! * [`process`] – Subprocess execution with concurrent output draining.
pub mod process;
pub mod result;
pub mod steering;
