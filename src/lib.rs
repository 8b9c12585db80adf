//! # telalign
//!
//! Track fitting and alignment engine for particle-beam telescopes.
//!
//! Hits already assigned to the ordered telescope planes are turned into broken-line
//! trajectories ([`trajectory`]), fitted with a band-structured least-squares solve that
//! also yields the sensitivities to the sensor alignment parameters ([`fit`]), and streamed
//! to a binary record file ([`mille`]). At the end of a run the external sparse solver is
//! steered and invoked, and its result is fed back into the geometry ([`pede`],
//! [`orchestrator`]).
//!
//! The [`pipeline`] module drives a run event by event through explicitly registered
//! processing stages.
pub mod align_errors;
pub mod alignment;
pub mod constants;
pub mod fit;
pub mod geometry;
pub mod mille;
pub mod orchestrator;
pub mod pede;
pub mod pipeline;
pub mod tracks;
pub mod trajectory;

pub use align_errors::AlignError;
pub use alignment::{registry::AlignmentParameterRegistry, AlignmentMode, Dof};
pub use fit::{BrokenLineFitter, FitOutcome};
pub use orchestrator::{AlignmentOrchestrator, OrchestratorConfig};
pub use trajectory::assembler::TrajectoryAssembler;
