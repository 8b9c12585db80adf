//! # Processing stages
//!
//! A run is driven by application code through an explicitly built [`Pipeline`]: an ordered
//! list of named [`Processor`] stages. Every stage sees the run header, every event in
//! order, and the end of the run.
//!
//! ## Event outcomes
//!
//! A stage answers each event with:
//!
//! * `Ok(EventOutcome::Processed)` when it did its work,
//! * `Ok(EventOutcome::Skipped(reason))` when the event could not be used (missing input,
//!   nothing to fit). Skips are counted and never stop the run,
//! * `Err(AlignError)` for fatal problems such as a failing record stream. The pipeline
//!   stops at the first fatal error and returns it.
//!
//! Warnings emitted per event go through a [`WarningLimiter`] so that a run lacking an
//! expected input does not flood the log.
use std::{collections::HashMap, fmt};

use ahash::RandomState;

use crate::{
    align_errors::AlignError,
    tracks::{Hit, TrackCandidate},
};

pub mod alignment_processor;

/// Default number of warnings logged per category before suppression.
pub const DEFAULT_WARNING_CAP: usize = 10;

/// Information available when a run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunHeader {
    pub run_number: u32,
}

/// Input of one event.
///
/// Either collection may be absent; stages decide which one they need.
#[derive(Debug, Clone, Default)]
pub struct Event {
    pub run: u32,
    pub number: u64,
    /// Raw hits of the event, before pattern recognition
    pub hits: Option<Vec<Hit>>,
    /// Track candidates built upstream
    pub candidates: Option<Vec<TrackCandidate>>,
}

impl Event {
    pub fn with_candidates(run: u32, number: u64, candidates: Vec<TrackCandidate>) -> Self {
        Event {
            run,
            number,
            hits: None,
            candidates: Some(candidates),
        }
    }

    pub fn with_hits(run: u32, number: u64, hits: Vec<Hit>) -> Self {
        Event {
            run,
            number,
            hits: Some(hits),
            candidates: None,
        }
    }
}

/// Why an event was not used by a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A required input collection is absent from the event
    MissingInput(&'static str),
    /// The event holds no track candidate
    NoCandidates,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingInput(what) => write!(f, "missing input collection '{what}'"),
            SkipReason::NoCandidates => f.write_str("no track candidate"),
        }
    }
}

/// Non-fatal outcome of one event in one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Processed,
    Skipped(SkipReason),
}

/// One processing stage.
pub trait Processor {
    fn name(&self) -> &str;

    fn on_run_start(&mut self, header: &RunHeader) -> Result<(), AlignError>;

    fn on_event(&mut self, event: &Event) -> Result<EventOutcome, AlignError>;

    /// End of run. Stages holding run-level state (record streams, solvers) finalize here.
    fn on_run_end(&mut self) -> Result<(), AlignError>;
}

/// Per-category warning rate limiter.
///
/// The first `cap` warnings of a category are logged; the `cap`-th is followed by a notice
/// that later ones are suppressed. Suppressed warnings are still counted.
#[derive(Debug, Clone)]
pub struct WarningLimiter {
    cap: usize,
    counts: HashMap<&'static str, usize, RandomState>,
}

impl Default for WarningLimiter {
    fn default() -> Self {
        WarningLimiter::new(DEFAULT_WARNING_CAP)
    }
}

impl WarningLimiter {
    pub fn new(cap: usize) -> Self {
        WarningLimiter {
            cap,
            counts: HashMap::with_hasher(RandomState::new()),
        }
    }

    /// Log `message` under `category` unless the category already reached its cap.
    ///
    /// Return
    /// ----------
    /// * `true` when the warning was logged.
    pub fn warn(&mut self, category: &'static str, message: impl fmt::Display) -> bool {
        let count = self.counts.entry(category).or_default();
        *count += 1;
        if *count > self.cap {
            return false;
        }
        tracing::warn!(category, "{message}");
        if *count == self.cap {
            tracing::warn!(category, "further warnings of this kind suppressed");
        }
        true
    }

    /// Number of warnings seen in `category`, suppressed ones included.
    pub fn count(&self, category: &str) -> usize {
        self.counts.get(category).copied().unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.counts.clear();
    }
}

/// Event counters of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageCounters {
    pub processed: u64,
    pub skipped: u64,
}

struct Stage {
    processor: Box<dyn Processor>,
    counters: StageCounters,
}

/// Ordered registry of processing stages.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|s| s.processor.name()))
            .finish()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage. Stages see every event in insertion order.
    pub fn add(&mut self, processor: Box<dyn Processor>) -> Result<(), AlignError> {
        let name = processor.name();
        if self.stages.iter().any(|s| s.processor.name() == name) {
            return Err(AlignError::InvalidConfiguration(format!(
                "stage '{name}' registered twice"
            )));
        }
        self.stages.push(Stage {
            processor,
            counters: StageCounters::default(),
        });
        Ok(())
    }

    pub fn with_stage(mut self, processor: Box<dyn Processor>) -> Result<Self, AlignError> {
        self.add(processor)?;
        Ok(self)
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.processor.name()).collect()
    }

    /// Counters of the stage called `name`.
    pub fn counters(&self, name: &str) -> Option<StageCounters> {
        self.stages
            .iter()
            .find(|s| s.processor.name() == name)
            .map(|s| s.counters)
    }

    /// Run every stage over `events`.
    ///
    /// Arguments
    /// -----------------
    /// * `header`: the run header, handed to every stage first.
    /// * `events`: the events of the run, in order.
    ///
    /// Return
    /// ----------
    /// * The number of events read, or the first fatal error of any stage. After a fatal
    ///   error no further event is processed and `on_run_end` is not called.
    pub fn run(
        &mut self,
        header: &RunHeader,
        events: impl IntoIterator<Item = Event>,
    ) -> Result<u64, AlignError> {
        for stage in &mut self.stages {
            stage.counters = StageCounters::default();
            stage.processor.on_run_start(header)?;
        }
        tracing::info!(run = header.run_number, stages = ?self.stage_names(), "run started");

        let mut n_events = 0u64;
        for event in events {
            n_events += 1;
            for stage in &mut self.stages {
                match stage.processor.on_event(&event) {
                    Ok(EventOutcome::Processed) => stage.counters.processed += 1,
                    Ok(EventOutcome::Skipped(reason)) => {
                        tracing::debug!(
                            stage = stage.processor.name(),
                            event = event.number,
                            %reason,
                            "event skipped"
                        );
                        stage.counters.skipped += 1;
                    }
                    Err(error) => {
                        tracing::error!(
                            stage = stage.processor.name(),
                            event = event.number,
                            %error,
                            "fatal error, run aborted"
                        );
                        return Err(error);
                    }
                }
            }
        }

        for stage in &mut self.stages {
            stage.processor.on_run_end()?;
            tracing::info!(
                stage = stage.processor.name(),
                processed = stage.counters.processed,
                skipped = stage.counters.skipped,
                "stage finished"
            );
        }
        Ok(n_events)
    }
}

#[cfg(test)]
mod pipeline_test {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    /// Stage that skips odd events and fails on event `fail_at`.
    struct Recorder {
        name: &'static str,
        fail_at: Option<u64>,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Processor for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn on_run_start(&mut self, header: &RunHeader) -> Result<(), AlignError> {
            self.log
                .borrow_mut()
                .push(format!("{} start {}", self.name, header.run_number));
            Ok(())
        }

        fn on_event(&mut self, event: &Event) -> Result<EventOutcome, AlignError> {
            if Some(event.number) == self.fail_at {
                return Err(AlignError::MalformedRecord("boom".into()));
            }
            self.log
                .borrow_mut()
                .push(format!("{} event {}", self.name, event.number));
            if event.number % 2 == 1 {
                Ok(EventOutcome::Skipped(SkipReason::NoCandidates))
            } else {
                Ok(EventOutcome::Processed)
            }
        }

        fn on_run_end(&mut self) -> Result<(), AlignError> {
            self.log.borrow_mut().push(format!("{} end", self.name));
            Ok(())
        }
    }

    fn events(n: u64) -> Vec<Event> {
        (0..n)
            .map(|number| Event {
                run: 1,
                number,
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn test_stage_order_and_counters() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut pipeline = Pipeline::new()
            .with_stage(Box::new(Recorder {
                name: "a",
                fail_at: None,
                log: log.clone(),
            }))
            .unwrap()
            .with_stage(Box::new(Recorder {
                name: "b",
                fail_at: None,
                log: log.clone(),
            }))
            .unwrap();

        let n = pipeline.run(&RunHeader { run_number: 1 }, events(3)).unwrap();
        assert_eq!(n, 3);
        assert_eq!(
            pipeline.counters("a"),
            Some(StageCounters {
                processed: 2,
                skipped: 1
            })
        );
        let log = log.borrow();
        assert_eq!(log[0], "a start 1");
        assert_eq!(log[2], "a event 0");
        assert_eq!(log[3], "b event 0");
        assert_eq!(log.last().unwrap(), "b end");
    }

    #[test]
    fn test_fatal_error_stops_run() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline
            .add(Box::new(Recorder {
                name: "a",
                fail_at: Some(1),
                log: log.clone(),
            }))
            .unwrap();

        let err = pipeline
            .run(&RunHeader::default(), events(5))
            .unwrap_err();
        assert!(matches!(err, AlignError::MalformedRecord(_)));
        assert!(!log.borrow().iter().any(|l| l == "a end"));
        assert_eq!(pipeline.counters("a").unwrap().processed, 1);
    }

    #[test]
    fn test_duplicate_stage_name() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let recorder = |name| {
            Box::new(Recorder {
                name,
                fail_at: None,
                log: log.clone(),
            })
        };
        let mut pipeline = Pipeline::new();
        pipeline.add(recorder("a")).unwrap();
        assert!(pipeline.add(recorder("a")).is_err());
        assert_eq!(pipeline.stage_names(), vec!["a"]);
    }

    #[test]
    fn test_warning_limiter() {
        let mut limiter = WarningLimiter::new(3);
        let logged = (0..10)
            .filter(|i| limiter.warn("missing-hits", format!("event {i}")))
            .count();
        assert_eq!(logged, 3);
        assert_eq!(limiter.count("missing-hits"), 10);
        assert!(limiter.warn("other", "first"));
        limiter.reset();
        assert_eq!(limiter.count("missing-hits"), 0);
    }
}
