//! # Run-level alignment lifecycle
//!
//! The [`AlignmentOrchestrator`] owns the parameter registry of a run and drives it through
//!
//! ```text
//! Accumulating ──► SteeringWritten ──► Solved ──► Ingested
//!       │                 │               │
//!       └─────────────────┴───────────────┴──► Failed
//! ```
//!
//! * **Accumulating** spans the event loop: every track that passed the χ² gate feeds its
//!   residuals to the running means that seed the solver.
//! * **SteeringWritten** is entered once the record stream is closed and the steering file
//!   is on disk.
//! * **Solved** is entered when the solver exited successfully and left a result file.
//! * **Ingested** is entered once the corrections reached the geometry sink and the result
//!   file was archived under a run-tagged name.
//!
//! Alignment is best effort: a failing solver or a missing result moves the orchestrator to
//! `Failed`, logs at error level and leaves the previous constants untouched. Calls made in
//! `Failed` are no-ops.
use std::{fmt, io::Write};

use camino::{Utf8Path, Utf8PathBuf};

use crate::{
    align_errors::AlignError,
    alignment::{registry::AlignmentParameterRegistry, AlignmentMode, Dof},
    constants::{
        SensorId, DEFAULT_BINARY_FILE, DEFAULT_RESULT_FILE, DEFAULT_SOLVER_COMMAND,
        DEFAULT_STEERING_FILE,
    },
    fit::FitOutcome,
    geometry::update::{GeometryUpdateSink, SensorCorrection},
    mille::{writer::DerivativeRecordWriter, RecordPrecision},
    pede::{
        process::ProcessRunner,
        result::{read_result, SolvedParameter},
        steering::Steering,
    },
};

/// Track-quality gate applied before a track contributes to the alignment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Chi2Cut {
    /// Maximum χ²
    Total(f64),
    /// Maximum χ²/ndf
    PerNdf(f64),
}

impl Default for Chi2Cut {
    fn default() -> Self {
        Chi2Cut::Total(f64::INFINITY)
    }
}

impl Chi2Cut {
    pub fn accepts(&self, outcome: &FitOutcome) -> bool {
        match *self {
            Chi2Cut::Total(max) => outcome.chi2 <= max,
            Chi2Cut::PerNdf(max) => outcome.chi2_per_ndf() <= max,
        }
    }

    fn threshold(&self) -> f64 {
        match *self {
            Chi2Cut::Total(v) | Chi2Cut::PerNdf(v) => v,
        }
    }
}

/// External helper turning the solver output into a geometry description.
///
/// Invoked as `<command> <steering> <result> <output_geometry> <original_geometry> <suffix>`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConverterConfig {
    pub command: String,
    pub output_geometry: Utf8PathBuf,
    pub original_geometry: Utf8PathBuf,
    pub suffix: String,
}

/// Configuration of the end-of-run alignment.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub alignment_mode: AlignmentMode,
    /// Individual parameters kept at their nominal value
    pub fixed: Vec<(SensorId, Dof)>,
    /// Reference sensors, all of whose parameters are fixed
    pub fixed_sensors: Vec<SensorId>,
    pub chi2_cut: Chi2Cut,
    /// Directory holding every artifact; the solver runs there
    pub working_dir: Utf8PathBuf,
    pub binary_file: String,
    pub steering_file: String,
    pub result_file: String,
    pub solver_command: String,
    /// Run the solver at the end of the run
    pub auto_solve: bool,
    /// Verbatim solver directives, `\\`-separated
    pub extra_directives: String,
    pub converter: Option<ConverterConfig>,
    pub run_number: u32,
    pub record_precision: RecordPrecision,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            alignment_mode: AlignmentMode::default(),
            fixed: Vec::new(),
            fixed_sensors: Vec::new(),
            chi2_cut: Chi2Cut::default(),
            working_dir: Utf8PathBuf::from("."),
            binary_file: DEFAULT_BINARY_FILE.into(),
            steering_file: DEFAULT_STEERING_FILE.into(),
            result_file: DEFAULT_RESULT_FILE.into(),
            solver_command: DEFAULT_SOLVER_COMMAND.into(),
            auto_solve: true,
            extra_directives: String::new(),
            converter: None,
            run_number: 0,
            record_precision: RecordPrecision::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::new()
    }

    pub fn binary_path(&self) -> Utf8PathBuf {
        self.working_dir.join(&self.binary_file)
    }

    pub fn steering_path(&self) -> Utf8PathBuf {
        self.working_dir.join(&self.steering_file)
    }

    pub fn result_path(&self) -> Utf8PathBuf {
        self.working_dir.join(&self.result_file)
    }
}

/// Builder for [`OrchestratorConfig`], with validation.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
        }
    }

    pub fn alignment_mode(mut self, v: AlignmentMode) -> Self {
        self.config.alignment_mode = v;
        self
    }
    pub fn fix(mut self, sensor_id: SensorId, dof: Dof) -> Self {
        self.config.fixed.push((sensor_id, dof));
        self
    }
    pub fn fixed_sensors(mut self, v: Vec<SensorId>) -> Self {
        self.config.fixed_sensors = v;
        self
    }
    pub fn chi2_cut(mut self, v: Chi2Cut) -> Self {
        self.config.chi2_cut = v;
        self
    }
    pub fn working_dir(mut self, v: impl Into<Utf8PathBuf>) -> Self {
        self.config.working_dir = v.into();
        self
    }
    pub fn binary_file(mut self, v: impl Into<String>) -> Self {
        self.config.binary_file = v.into();
        self
    }
    pub fn steering_file(mut self, v: impl Into<String>) -> Self {
        self.config.steering_file = v.into();
        self
    }
    pub fn result_file(mut self, v: impl Into<String>) -> Self {
        self.config.result_file = v.into();
        self
    }
    pub fn solver_command(mut self, v: impl Into<String>) -> Self {
        self.config.solver_command = v.into();
        self
    }
    pub fn auto_solve(mut self, v: bool) -> Self {
        self.config.auto_solve = v;
        self
    }
    pub fn extra_directives(mut self, v: impl Into<String>) -> Self {
        self.config.extra_directives = v.into();
        self
    }
    pub fn converter(mut self, v: ConverterConfig) -> Self {
        self.config.converter = Some(v);
        self
    }
    pub fn run_number(mut self, v: u32) -> Self {
        self.config.run_number = v;
        self
    }
    pub fn record_precision(mut self, v: RecordPrecision) -> Self {
        self.config.record_precision = v;
        self
    }

    pub fn build(self) -> Result<OrchestratorConfig, AlignError> {
        let c = &self.config;
        if c.alignment_mode.dofs().is_empty() {
            return Err(AlignError::InvalidConfiguration(
                "alignment mode enables no degree of freedom".into(),
            ));
        }
        if c.chi2_cut.threshold().is_nan() || c.chi2_cut.threshold() < 0.0 {
            return Err(AlignError::InvalidConfiguration(
                "chi2 cut must be >= 0".into(),
            ));
        }
        for (name, value) in [
            ("binary_file", &c.binary_file),
            ("steering_file", &c.steering_file),
            ("result_file", &c.result_file),
            ("solver_command", &c.solver_command),
        ] {
            if value.trim().is_empty() {
                return Err(AlignError::InvalidConfiguration(format!(
                    "{name} must not be empty"
                )));
            }
        }
        Ok(self.config)
    }
}

/// Lifecycle state of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Accumulating,
    SteeringWritten,
    Solved,
    Ingested,
    Failed,
}

impl OrchestratorState {
    pub fn name(self) -> &'static str {
        match self {
            OrchestratorState::Accumulating => "Accumulating",
            OrchestratorState::SteeringWritten => "SteeringWritten",
            OrchestratorState::Solved => "Solved",
            OrchestratorState::Ingested => "Ingested",
            OrchestratorState::Failed => "Failed",
        }
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Name under which the result of run `run_number` is archived:
/// `<stem>-run<NNNNNN>.<ext>`, next to the original.
pub fn archived_result_path(result: &Utf8Path, run_number: u32) -> Utf8PathBuf {
    let stem = result.file_stem().unwrap_or("result");
    let name = match result.extension() {
        Some(ext) => format!("{stem}-run{run_number:06}.{ext}"),
        None => format!("{stem}-run{run_number:06}"),
    };
    result.with_file_name(name)
}

/// Drives the end-of-run alignment: seeding, steering, solve, ingestion.
#[derive(Debug)]
pub struct AlignmentOrchestrator {
    config: OrchestratorConfig,
    registry: AlignmentParameterRegistry,
    state: OrchestratorState,
    stream_closed: bool,
    tracks: u64,
    records: u64,
}

impl AlignmentOrchestrator {
    /// Allocate the parameters of `sensors` under the configured mode and apply the fixed
    /// set.
    ///
    /// Arguments
    /// -----------------
    /// * `config`: validated configuration.
    /// * `sensors`: the aligned sensors, in beam order.
    ///
    /// Return
    /// ----------
    /// * The orchestrator in `Accumulating`, or [`AlignError::UnknownSensor`] when the fixed
    ///   set names a sensor that is not aligned.
    pub fn new(config: OrchestratorConfig, sensors: &[SensorId]) -> Result<Self, AlignError> {
        let mut registry =
            AlignmentParameterRegistry::allocate(sensors, config.alignment_mode.dofs())?;
        for &sensor_id in &config.fixed_sensors {
            registry.fix_sensor(sensor_id)?;
        }
        for &(sensor_id, dof) in &config.fixed {
            registry.fix(sensor_id, dof)?;
        }
        tracing::info!(
            sensors = sensors.len(),
            parameters = registry.len(),
            mode = ?config.alignment_mode,
            "alignment parameters allocated"
        );
        Ok(AlignmentOrchestrator {
            config,
            registry,
            state: OrchestratorState::Accumulating,
            stream_closed: false,
            tracks: 0,
            records: 0,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &AlignmentParameterRegistry {
        &self.registry
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Number of tracks accumulated so far.
    pub fn tracks(&self) -> u64 {
        self.tracks
    }

    fn expect_state(
        &self,
        expected: OrchestratorState,
        to: OrchestratorState,
    ) -> Result<(), AlignError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(AlignError::InvalidTransition {
                from: self.state.name(),
                to: to.name(),
            })
        }
    }

    fn fail(&mut self, error: &AlignError) {
        tracing::error!(
            state = %self.state,
            run = self.config.run_number,
            %error,
            "alignment aborted, previous constants kept"
        );
        self.state = OrchestratorState::Failed;
    }

    /// Feed the unbiased residuals of an accepted track to the seeding means.
    pub fn accumulate(&mut self, outcome: &FitOutcome) -> Result<(), AlignError> {
        self.expect_state(OrchestratorState::Accumulating, OrchestratorState::Accumulating)?;
        for (sensor_id, residual) in outcome.unbiased_residuals() {
            self.registry.accumulate_residual(sensor_id, &residual);
        }
        self.tracks += 1;
        Ok(())
    }

    /// Close the record stream. This is the barrier that allows the steering to be written.
    pub fn close_stream<W: Write>(
        &mut self,
        writer: DerivativeRecordWriter<W>,
    ) -> Result<u64, AlignError> {
        self.expect_state(OrchestratorState::Accumulating, OrchestratorState::Accumulating)?;
        self.records = writer.records_written();
        writer.finish()?;
        self.stream_closed = true;
        Ok(self.records)
    }

    /// Mark the stream as closed when the records were written elsewhere.
    pub fn mark_stream_closed(&mut self, records: u64) {
        self.records = records;
        self.stream_closed = true;
    }

    /// Write the steering file: `Accumulating → SteeringWritten`.
    pub fn write_steering(&mut self) -> Result<(), AlignError> {
        if self.state == OrchestratorState::Failed {
            return Ok(());
        }
        self.expect_state(OrchestratorState::Accumulating, OrchestratorState::SteeringWritten)?;
        if !self.stream_closed {
            return Err(AlignError::InvalidTransition {
                from: "Accumulating (record stream open)",
                to: OrchestratorState::SteeringWritten.name(),
            });
        }

        let steering = Steering::from_registry(
            &self.config.binary_file,
            &self.registry,
            &self.config.extra_directives,
        );
        if let Err(error) = steering.write(&self.config.steering_path()) {
            self.fail(&error);
            return Err(error);
        }
        self.state = OrchestratorState::SteeringWritten;
        Ok(())
    }

    /// Run the solver: `SteeringWritten → Solved`.
    pub fn solve(&mut self, runner: &impl ProcessRunner) -> Result<(), AlignError> {
        if self.state == OrchestratorState::Failed {
            return Ok(());
        }
        self.expect_state(OrchestratorState::SteeringWritten, OrchestratorState::Solved)?;

        let args = vec![self.config.steering_file.clone()];
        let outcome = runner
            .run(&self.config.solver_command, &args, &self.config.working_dir)
            .and_then(|output| {
                if output.success() {
                    Ok(())
                } else {
                    Err(AlignError::SolverFailed {
                        status: output.status,
                    })
                }
            })
            .and_then(|()| {
                let result = self.config.result_path();
                if result.is_file() {
                    Ok(())
                } else {
                    Err(AlignError::ResultMissing(result.to_string()))
                }
            });

        match outcome {
            Ok(()) => {
                self.state = OrchestratorState::Solved;
                tracing::info!(records = self.records, tracks = self.tracks, "alignment solved");
                Ok(())
            }
            Err(error) => {
                self.fail(&error);
                Err(error)
            }
        }
    }

    /// Turn the solved parameters into one correction per aligned sensor.
    fn corrections(&self, solved: &[SolvedParameter]) -> Vec<SensorCorrection> {
        let mut corrections: Vec<SensorCorrection> = self
            .registry
            .sensors()
            .iter()
            .map(|&id| SensorCorrection::zero(id))
            .collect();

        for p in solved {
            let Some(parameter) = self.registry.by_label(p.label) else {
                tracing::warn!(label = p.label, "solver returned an unknown label");
                continue;
            };
            tracing::debug!(
                label = p.label,
                sensor = parameter.sensor_id,
                dof = %parameter.dof,
                value = p.value,
                error = ?p.error,
                pull = ?p.pull(),
                "solved parameter"
            );
            if parameter.fixed {
                continue;
            }
            if let Some(c) = corrections
                .iter_mut()
                .find(|c| c.sensor_id == parameter.sensor_id)
            {
                let i = parameter.dof.index();
                if parameter.dof.is_shift() {
                    c.shift[i] += p.value;
                } else {
                    c.rotation[i - 3] += p.value;
                }
            }
        }
        corrections
    }

    /// Publish the solved corrections: `Solved → Ingested`.
    ///
    /// The corrections go to `sink`, the optional converter runs through `runner`, and the
    /// result file is renamed with the run number. Converter and archiving failures are
    /// logged but do not undo the ingestion.
    pub fn ingest(
        &mut self,
        sink: &mut impl GeometryUpdateSink,
        runner: &impl ProcessRunner,
    ) -> Result<Vec<SensorCorrection>, AlignError> {
        if self.state == OrchestratorState::Failed {
            return Ok(Vec::new());
        }
        self.expect_state(OrchestratorState::Solved, OrchestratorState::Ingested)?;

        let result_path = self.config.result_path();
        let corrections = match read_result(&result_path)
            .map(|solved| self.corrections(&solved))
            .and_then(|corrections| sink.apply(&corrections).map(|()| corrections))
        {
            Ok(corrections) => corrections,
            Err(error) => {
                self.fail(&error);
                return Err(error);
            }
        };

        if let Some(converter) = &self.config.converter {
            let args = vec![
                self.config.steering_path().to_string(),
                result_path.to_string(),
                converter.output_geometry.to_string(),
                converter.original_geometry.to_string(),
                converter.suffix.clone(),
            ];
            match runner.run(&converter.command, &args, &self.config.working_dir) {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    tracing::warn!(status = ?output.status, "geometry converter failed")
                }
                Err(error) => tracing::warn!(%error, "geometry converter not run"),
            }
        }

        let archived = archived_result_path(&result_path, self.config.run_number);
        if let Err(error) = std::fs::rename(&result_path, &archived) {
            tracing::warn!(%error, %archived, "result file not archived");
        }

        tracing::info!(sensors = corrections.len(), %archived, "alignment constants updated");
        self.state = OrchestratorState::Ingested;
        Ok(corrections)
    }

    /// Run the whole end-of-run sequence. Never fails: problems are logged and the
    /// previous constants stay in place.
    ///
    /// Return
    /// ----------
    /// * The corrections handed to the sink, or `None` when nothing was ingested.
    pub fn finish(
        &mut self,
        runner: &impl ProcessRunner,
        sink: &mut impl GeometryUpdateSink,
    ) -> Option<Vec<SensorCorrection>> {
        let result = self.write_steering().and_then(|()| {
            if !self.config.auto_solve {
                tracing::info!(
                    steering = %self.config.steering_path(),
                    "automatic solving disabled"
                );
                return Ok(None);
            }
            self.solve(runner)?;
            self.ingest(sink, runner).map(Some)
        });

        match result {
            Ok(corrections) if self.state == OrchestratorState::Ingested => corrections,
            Ok(_) => None,
            Err(error) => {
                if self.state != OrchestratorState::Failed {
                    self.fail(&error);
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod orchestrator_test {
    use super::*;
    use crate::{fit::PointResult, pede::process::ProcessOutput};
    use nalgebra::Vector2;
    use std::cell::RefCell;

    /// Runner that pretends to be the solver by writing a canned result file.
    struct FakeSolver {
        result: Option<String>,
        status: Option<i32>,
        calls: RefCell<Vec<(String, Vec<String>)>>,
    }

    impl FakeSolver {
        fn new(result: Option<&str>, status: Option<i32>) -> Self {
            FakeSolver {
                result: result.map(String::from),
                status,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ProcessRunner for FakeSolver {
        fn run(
            &self,
            program: &str,
            args: &[String],
            working_dir: &Utf8Path,
        ) -> Result<ProcessOutput, AlignError> {
            self.calls
                .borrow_mut()
                .push((program.to_string(), args.to_vec()));
            if program == "pede" {
                if let Some(content) = &self.result {
                    std::fs::write(working_dir.join(DEFAULT_RESULT_FILE), content)?;
                }
            }
            Ok(ProcessOutput {
                status: self.status,
                ..Default::default()
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink(Vec<SensorCorrection>);

    impl GeometryUpdateSink for RecordingSink {
        fn apply(&mut self, corrections: &[SensorCorrection]) -> Result<(), AlignError> {
            self.0.extend_from_slice(corrections);
            Ok(())
        }
    }

    fn outcome(residuals: &[(SensorId, f64)]) -> FitOutcome {
        FitOutcome {
            chi2: 1.0,
            ndf: 2,
            lost_weight: 0.0,
            iterations: 1,
            curvature: None,
            rows: Vec::new(),
            points: residuals
                .iter()
                .map(|&(sensor_id, r)| PointResult {
                    sensor_id,
                    path_length: 0.0,
                    position: Vector2::zeros(),
                    slopes: Vector2::zeros(),
                    residual: Some(Vector2::new(r, r) * 0.5),
                    residual_covariance: None,
                    unbiased_residual: Some(Vector2::new(r, r)),
                    active: true,
                })
                .collect(),
        }
    }

    fn orchestrator(dir: &Utf8Path) -> AlignmentOrchestrator {
        let config = OrchestratorConfig::builder()
            .working_dir(dir)
            .fixed_sensors(vec![0])
            .run_number(42)
            .build()
            .unwrap();
        let mut orch = AlignmentOrchestrator::new(config, &[0, 1]).unwrap();
        orch.mark_stream_closed(0);
        orch
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_chi2_cut() {
        let o = outcome(&[]);
        assert!(Chi2Cut::Total(1.0).accepts(&o));
        assert!(!Chi2Cut::Total(0.5).accepts(&o));
        assert!(Chi2Cut::PerNdf(0.5).accepts(&o));
        assert!(!Chi2Cut::PerNdf(0.4).accepts(&o));
        assert!(Chi2Cut::default().accepts(&o));
    }

    #[test]
    fn test_archived_name() {
        assert_eq!(
            archived_result_path(Utf8Path::new("/w/millepede.res"), 7),
            Utf8PathBuf::from("/w/millepede-run000007.res")
        );
        assert_eq!(
            archived_result_path(Utf8Path::new("out"), 123456),
            Utf8PathBuf::from("out-run123456")
        );
    }

    #[test]
    fn test_full_lifecycle() {
        let (_guard, dir) = tempdir();
        let mut orch = orchestrator(&dir);
        orch.accumulate(&outcome(&[(0, 0.3), (1, 0.02)])).unwrap();

        let solver = FakeSolver::new(
            Some("Parameter\n 1 0.0 -1.0\n 2 0.015 0.0 0.015 0.001\n 4 -0.02 0.0 -0.02 0.001\n"),
            Some(0),
        );
        let mut sink = RecordingSink::default();
        let corrections = orch.finish(&solver, &mut sink).unwrap();

        assert_eq!(orch.state(), OrchestratorState::Ingested);
        assert_eq!(sink.0, corrections);
        assert_eq!(corrections.len(), 2);
        assert_eq!(corrections[0], SensorCorrection::zero(0));
        assert_eq!(corrections[1].shift.x, 0.015);
        assert_eq!(corrections[1].shift.y, -0.02);

        let steering = std::fs::read_to_string(dir.join(DEFAULT_STEERING_FILE)).unwrap();
        assert!(steering.contains("1 0.0 -1.0 ! 0 shiftX"));
        assert!(steering.contains("2 -0.02 0.0 ! 1 shiftX"));
        assert!(dir.join("millepede-run000042.res").is_file());
        assert!(!dir.join(DEFAULT_RESULT_FILE).exists());
        assert_eq!(solver.calls.borrow()[0].1, vec![DEFAULT_STEERING_FILE.to_string()]);
    }

    #[test]
    fn test_solver_failure_keeps_constants() {
        let (_guard, dir) = tempdir();
        let mut sink = RecordingSink::default();

        let mut orch = orchestrator(&dir);
        assert!(orch.finish(&FakeSolver::new(None, Some(0)), &mut sink).is_none());
        assert_eq!(orch.state(), OrchestratorState::Failed);

        let mut orch = orchestrator(&dir);
        assert!(orch
            .finish(&FakeSolver::new(Some("Parameter\n"), Some(1)), &mut sink)
            .is_none());
        assert_eq!(orch.state(), OrchestratorState::Failed);

        assert!(sink.0.is_empty());
        // calls in Failed are no-ops
        assert!(orch.solve(&FakeSolver::new(None, Some(0))).is_ok());
    }

    #[test]
    fn test_steering_write_failure_skips_solve() {
        let (_guard, dir) = tempdir();
        let config = OrchestratorConfig::builder()
            .working_dir(dir.join("no/such/dir"))
            .build()
            .unwrap();
        let mut orch = AlignmentOrchestrator::new(config, &[0, 1]).unwrap();
        orch.accumulate(&outcome(&[(1, 0.02)])).unwrap();
        orch.mark_stream_closed(1);

        let solver = FakeSolver::new(Some("Parameter\n 1 0.5 0.0\n"), Some(0));
        let mut sink = RecordingSink::default();
        assert!(orch.finish(&solver, &mut sink).is_none());

        assert_eq!(orch.state(), OrchestratorState::Failed);
        assert!(solver.calls.borrow().is_empty());
        assert!(sink.0.is_empty());
        // later calls are no-ops
        assert!(orch.write_steering().is_ok());
        assert!(orch.ingest(&mut sink, &solver).is_ok());
        assert!(sink.0.is_empty());
    }

    #[test]
    fn test_transitions_are_checked() {
        let (_guard, dir) = tempdir();
        let config = OrchestratorConfig::builder()
            .working_dir(dir.as_path())
            .build()
            .unwrap();
        let mut orch = AlignmentOrchestrator::new(config, &[0, 1]).unwrap();

        // record stream still open
        assert!(matches!(
            orch.write_steering(),
            Err(AlignError::InvalidTransition { .. })
        ));
        assert!(matches!(
            orch.solve(&FakeSolver::new(None, Some(0))),
            Err(AlignError::InvalidTransition { .. })
        ));

        orch.mark_stream_closed(0);
        orch.write_steering().unwrap();
        assert_eq!(orch.state(), OrchestratorState::SteeringWritten);
        assert!(orch.accumulate(&outcome(&[])).is_err());
    }

    #[test]
    fn test_auto_solve_disabled() {
        let (_guard, dir) = tempdir();
        let config = OrchestratorConfig::builder()
            .working_dir(dir.as_path())
            .auto_solve(false)
            .build()
            .unwrap();
        let mut orch = AlignmentOrchestrator::new(config, &[0]).unwrap();
        orch.mark_stream_closed(0);
        let solver = FakeSolver::new(None, Some(0));
        assert!(orch.finish(&solver, &mut RecordingSink::default()).is_none());
        assert_eq!(orch.state(), OrchestratorState::SteeringWritten);
        assert!(solver.calls.borrow().is_empty());
    }

    #[test]
    fn test_unknown_fixed_sensor() {
        let config = OrchestratorConfig::builder()
            .fixed_sensors(vec![9])
            .build()
            .unwrap();
        assert_eq!(
            AlignmentOrchestrator::new(config, &[0, 1]).unwrap_err(),
            AlignError::UnknownSensor(9)
        );
    }
}
