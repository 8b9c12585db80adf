//! The alignment stage: track fits, derivative records and the end-of-run solve.
//!
//! For every event the stage assembles and fits each track candidate, applies the χ² gate,
//! streams the accepted fits to the record file and feeds their residuals to the
//! orchestrator. Tracks that cannot be fitted are counted and dropped. At the end of the
//! run the record stream is closed and the orchestrator performs the best-effort solve.
//! Solved corrections are handed to the configured sink and applied to the stage's own
//! layout, so that a following run starts from the corrected geometry.
use std::{borrow::Cow, fmt, fs::File, io::BufWriter};

use crate::{
    align_errors::AlignError,
    constants::{SensorId, DEFAULT_RECORD_CAPACITY},
    fit::BrokenLineFitter,
    geometry::{
        update::{GeometryUpdateSink, SensorCorrection},
        PlaneLayout, TelescopeLayout,
    },
    mille::writer::DerivativeRecordWriter,
    orchestrator::{AlignmentOrchestrator, OrchestratorConfig},
    pede::process::ProcessRunner,
    pipeline::{Event, EventOutcome, Processor, RunHeader, SkipReason, WarningLimiter},
    tracks::{finder::CandidateFinder, TrackCandidate},
    trajectory::assembler::TrajectoryAssembler,
};

/// Per-run counters of the alignment stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunStatistics {
    pub events_processed: u64,
    pub events_skipped: u64,
    pub candidates: u64,
    /// Candidates with too few usable measurements
    pub degenerate: u64,
    /// Candidates referring to a sensor unknown to the layout
    pub invalid: u64,
    /// Fits with a singular system
    pub singular: u64,
    /// Hits on excluded planes outside the span of the active measurements
    pub dropped_hits: u64,
    pub rejected_chi2: u64,
    pub tracks_written: u64,
}

impl RunStatistics {
    /// Candidates that produced a fit, accepted or not.
    pub fn tracks_fitted(&self) -> u64 {
        self.tracks_written + self.rejected_chi2
    }
}

impl fmt::Display for RunStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "events {} (+{} skipped), candidates {}, degenerate {}, invalid {}, singular {}, \
             dropped hits {}, chi2-rejected {}, written {}",
            self.events_processed,
            self.events_skipped,
            self.candidates,
            self.degenerate,
            self.invalid,
            self.singular,
            self.dropped_hits,
            self.rejected_chi2,
            self.tracks_written
        )
    }
}

type RecordFile = DerivativeRecordWriter<BufWriter<File>>;

/// Processing stage running the track-based alignment.
pub struct AlignmentProcessor<R: ProcessRunner, S: GeometryUpdateSink> {
    layout: TelescopeLayout,
    finder: Option<CandidateFinder>,
    assembler: TrajectoryAssembler,
    fitter: BrokenLineFitter,
    config: OrchestratorConfig,
    runner: R,
    sink: S,
    orchestrator: Option<AlignmentOrchestrator>,
    writer: Option<RecordFile>,
    warnings: WarningLimiter,
    statistics: RunStatistics,
    corrections: Option<Vec<SensorCorrection>>,
}

impl<R: ProcessRunner, S: GeometryUpdateSink> AlignmentProcessor<R, S> {
    /// Arguments
    /// -----------------
    /// * `layout`: the telescope planes; its alignment constants are updated after a
    ///   successful solve.
    /// * `assembler`, `fitter`: the track model.
    /// * `config`: end-of-run alignment configuration. The run number is taken from the
    ///   run header.
    /// * `runner`: executes the solver and the geometry converter.
    /// * `sink`: receives the solved corrections.
    pub fn new(
        layout: TelescopeLayout,
        assembler: TrajectoryAssembler,
        fitter: BrokenLineFitter,
        config: OrchestratorConfig,
        runner: R,
        sink: S,
    ) -> Self {
        AlignmentProcessor {
            layout,
            finder: None,
            assembler,
            fitter,
            config,
            runner,
            sink,
            orchestrator: None,
            writer: None,
            warnings: WarningLimiter::default(),
            statistics: RunStatistics::default(),
            corrections: None,
        }
    }

    /// Build candidates from raw hits for events that carry no candidates.
    pub fn with_finder(mut self, finder: CandidateFinder) -> Self {
        self.finder = Some(finder);
        self
    }

    pub fn with_warning_cap(mut self, cap: usize) -> Self {
        self.warnings = WarningLimiter::new(cap);
        self
    }

    pub fn layout(&self) -> &TelescopeLayout {
        &self.layout
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn statistics(&self) -> &RunStatistics {
        &self.statistics
    }

    /// Orchestrator of the current (or last) run.
    pub fn orchestrator(&self) -> Option<&AlignmentOrchestrator> {
        self.orchestrator.as_ref()
    }

    /// Corrections ingested at the end of the last run.
    pub fn corrections(&self) -> Option<&[SensorCorrection]> {
        self.corrections.as_deref()
    }

    /// Sensors carrying alignment parameters: every plane not excluded from the fit.
    pub fn aligned_sensors(&self) -> Vec<SensorId> {
        self.layout
            .sensor_ids()
            .into_iter()
            .filter(|&id| !self.assembler.config().is_excluded(id))
            .collect()
    }

    /// Fit one candidate and stream it when it passes the gate.
    fn process_candidate(
        &mut self,
        candidate: &TrackCandidate,
        event_number: u64,
    ) -> Result<(), AlignError> {
        let (Some(orchestrator), Some(writer)) =
            (self.orchestrator.as_mut(), self.writer.as_mut())
        else {
            return Err(AlignError::InvalidTransition {
                from: "Idle",
                to: "Accumulating",
            });
        };
        self.statistics.candidates += 1;

        let trajectory = match self.assembler.assemble(candidate, &self.layout) {
            Ok(t) => t,
            Err(AlignError::DegenerateTrajectory { measured, .. }) => {
                tracing::trace!(event = event_number, measured, "degenerate candidate");
                self.statistics.degenerate += 1;
                return Ok(());
            }
            Err(AlignError::UnknownSensor(id)) => {
                self.warnings.warn(
                    "unknown-sensor",
                    format!("event {event_number}: hit on unknown sensor {id}"),
                );
                self.statistics.invalid += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if trajectory.dropped_hits > 0 {
            self.statistics.dropped_hits += trajectory.dropped_hits as u64;
            self.warnings.warn(
                "dropped-hits",
                format!(
                    "event {event_number}: {} hit(s) on excluded planes outside the fitted span",
                    trajectory.dropped_hits
                ),
            );
        }

        let outcome = match self.fitter.fit(&trajectory, orchestrator.registry()) {
            Ok(o) => o,
            Err(AlignError::SingularFit(reason)) => {
                tracing::debug!(event = event_number, %reason, "track not fitted");
                self.statistics.singular += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if !self.config.chi2_cut.accepts(&outcome) {
            self.statistics.rejected_chi2 += 1;
            return Ok(());
        }

        writer.append(&outcome)?;
        orchestrator.accumulate(&outcome)?;
        self.statistics.tracks_written += 1;
        Ok(())
    }
}

impl<R: ProcessRunner, S: GeometryUpdateSink> Processor for AlignmentProcessor<R, S> {
    fn name(&self) -> &str {
        "alignment"
    }

    fn on_run_start(&mut self, header: &RunHeader) -> Result<(), AlignError> {
        self.config.run_number = header.run_number;
        self.statistics = RunStatistics::default();
        self.warnings.reset();
        self.corrections = None;

        let sensors = self.aligned_sensors();
        let orchestrator = AlignmentOrchestrator::new(self.config.clone(), &sensors)?;
        let writer = DerivativeRecordWriter::create(
            &self.config.binary_path(),
            self.config.record_precision,
            DEFAULT_RECORD_CAPACITY,
        )?;
        self.orchestrator = Some(orchestrator);
        self.writer = Some(writer);
        Ok(())
    }

    fn on_event(&mut self, event: &Event) -> Result<EventOutcome, AlignError> {
        let candidates: Cow<'_, [TrackCandidate]> = match (&event.candidates, &event.hits) {
            (Some(candidates), _) => Cow::Borrowed(candidates.as_slice()),
            (None, Some(hits)) if self.finder.is_some() => {
                let found = self
                    .finder
                    .as_ref()
                    .map(|f| f.find(hits, &self.layout))
                    .unwrap_or_default();
                Cow::Owned(found)
            }
            _ => {
                self.warnings.warn(
                    "missing-candidates",
                    format!("event {}: no track candidate collection", event.number),
                );
                self.statistics.events_skipped += 1;
                return Ok(EventOutcome::Skipped(SkipReason::MissingInput(
                    "track candidates",
                )));
            }
        };

        if candidates.is_empty() {
            self.statistics.events_skipped += 1;
            return Ok(EventOutcome::Skipped(SkipReason::NoCandidates));
        }

        for candidate in candidates.iter() {
            self.process_candidate(candidate, event.number)?;
        }
        self.statistics.events_processed += 1;
        Ok(EventOutcome::Processed)
    }

    fn on_run_end(&mut self) -> Result<(), AlignError> {
        let (Some(orchestrator), Some(writer)) =
            (self.orchestrator.as_mut(), self.writer.take())
        else {
            return Ok(());
        };

        let records = orchestrator.close_stream(writer)?;
        tracing::info!(
            run = self.config.run_number,
            records,
            statistics = %self.statistics,
            "alignment statistics"
        );

        self.corrections = orchestrator.finish(&self.runner, &mut self.sink);
        if let Some(corrections) = &self.corrections {
            if let Err(error) = self.layout.apply(corrections) {
                tracing::error!(%error, "corrections not applied to the layout");
            }
        }
        Ok(())
    }
}
