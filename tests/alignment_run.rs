mod common;

use approx::assert_abs_diff_eq;
use camino::Utf8Path;
use nalgebra::Vector2;
use rand::{rngs::StdRng, SeedableRng};
use telalign::{
    alignment::{AlignmentMode, Dof},
    fit::BrokenLineFitter,
    geometry::{
        update::{CsvConstantsSink, GeometryUpdateSink, SensorCorrection},
        PlaneLayout, TelescopeLayout,
    },
    mille::reader::MilleReader,
    orchestrator::{Chi2Cut, OrchestratorConfig, OrchestratorState},
    pede::{
        process::{ProcessOutput, ProcessRunner, TokioProcessRunner},
        result::SolvedParameter,
    },
    pipeline::{alignment_processor::AlignmentProcessor, Event, Pipeline, Processor, RunHeader},
    trajectory::assembler::{AssemblerConfig, TrajectoryAssembler},
    AlignError,
};

use crate::common::{init_logging, telescope, uniform, workdir, TrackGun};

#[derive(Debug, Default)]
struct CountingSink {
    calls: usize,
}

impl GeometryUpdateSink for CountingSink {
    fn apply(&mut self, _: &[SensorCorrection]) -> Result<(), AlignError> {
        self.calls += 1;
        Ok(())
    }
}

/// Stand-in for the solver: reads the steering file and returns the seeds as solution.
struct EchoSolver;

impl ProcessRunner for EchoSolver {
    fn run(
        &self,
        program: &str,
        args: &[String],
        working_dir: &Utf8Path,
    ) -> Result<ProcessOutput, AlignError> {
        if program != "pede" {
            return Err(AlignError::SolverNotFound(program.to_string()));
        }
        let steering = std::fs::read_to_string(working_dir.join(&args[0]))?;
        let mut result = String::from("Parameter\n");
        for p in steering_parameters(&steering) {
            result.push_str(&format!(
                "{} {:e} {:?} {:e} 1.0e-3\n",
                p.label, p.value, p.presigma, p.value
            ));
        }
        std::fs::write(working_dir.join("millepede.res"), result)?;
        Ok(ProcessOutput {
            status: Some(0),
            stdout: vec!["ok".into()],
            stderr: Vec::new(),
        })
    }
}

/// `Parameter` lines of a steering file.
fn steering_parameters(steering: &str) -> Vec<SolvedParameter> {
    steering
        .lines()
        .skip_while(|l| *l != "Parameter")
        .skip(1)
        .take_while(|l| !l.trim().is_empty())
        .map(|l| {
            let fields: Vec<&str> = l.split_whitespace().collect();
            SolvedParameter {
                label: fields[0].parse().unwrap(),
                value: fields[1].parse().unwrap(),
                presigma: fields[2].parse().unwrap(),
                difference: None,
                error: None,
            }
        })
        .collect()
}

fn assembler(excluded: Vec<i32>) -> TrajectoryAssembler {
    TrajectoryAssembler::new(
        AssemblerConfig::builder()
            .excluded_sensors(excluded)
            .build()
            .unwrap(),
    )
}

fn stage<R: ProcessRunner, S: GeometryUpdateSink>(
    layout: TelescopeLayout,
    excluded: Vec<i32>,
    config: OrchestratorConfig,
    runner: R,
    sink: S,
) -> AlignmentProcessor<R, S> {
    AlignmentProcessor::new(
        layout,
        assembler(excluded),
        BrokenLineFitter::default(),
        config,
        runner,
        sink,
    )
}

fn events(gun: &TrackGun, n_events: u64, seed: u64) -> Vec<Event> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n_events)
        .map(|number| {
            let n_tracks = uniform(&mut rng, 1, 4);
            Event::with_candidates(1, number, gun.shoot_many(n_tracks, &mut rng))
        })
        .collect()
}

#[test]
fn test_tighter_chi2_cut_never_adds_tracks() {
    init_logging();
    let layout = telescope(6, 1e-3);
    let gun = TrackGun::new(layout.clone());
    let sample = events(&gun, 200, 42);

    let mut previous = u64::MAX;
    for cut in [f64::INFINITY, 4.0, 2.0, 1.0, 0.5, 0.0] {
        let (_guard, dir) = workdir();
        let config = OrchestratorConfig::builder()
            .working_dir(dir.as_path())
            .chi2_cut(Chi2Cut::PerNdf(cut))
            .auto_solve(false)
            .build()
            .unwrap();
        let mut pipeline = Pipeline::new();
        pipeline
            .add(Box::new(stage(
                layout.clone(),
                vec![],
                config,
                TokioProcessRunner,
                CountingSink::default(),
            )))
            .unwrap();
        pipeline
            .run(&RunHeader { run_number: 1 }, sample.clone())
            .unwrap();

        let written = MilleReader::open(&dir.join("millepede.bin"))
            .unwrap()
            .count() as u64;
        assert!(written <= previous, "cut {cut}: {written} > {previous}");
        previous = written;
    }
    assert_eq!(previous, 0);
}

#[test]
fn test_seed_converges_to_offset() {
    let layout = telescope(6, 0.0);
    let delta = Vector2::new(0.05, -0.03);
    let misaligned = 2;
    let gun = TrackGun::new(layout.clone())
        .without_scattering()
        .with_misalignment(misaligned, delta);

    let (_guard, dir) = workdir();
    let config = OrchestratorConfig::builder()
        .working_dir(dir.as_path())
        .alignment_mode(AlignmentMode::XYShift)
        .auto_solve(false)
        .build()
        .unwrap();
    let mut stage = stage(layout.clone(), vec![], config, EchoSolver, CountingSink::default());
    stage.on_run_start(&RunHeader { run_number: 1 }).unwrap();
    for event in events(&gun, 1000, 7) {
        stage.on_event(&event).unwrap();
    }

    let registry = stage.orchestrator().unwrap().registry();
    let x = registry.parameter(misaligned, Dof::ShiftX).unwrap();
    let y = registry.parameter(misaligned, Dof::ShiftY).unwrap();
    assert!(x.samples() > 1000);
    assert_abs_diff_eq!(x.seed(), delta.x, epsilon = 5e-4);
    assert_abs_diff_eq!(y.seed(), delta.y, epsilon = 5e-4);
    assert!((x.seed() - delta.x).abs() < 0.05 * delta.x.abs());
    assert!((y.seed() - delta.y).abs() < 0.05 * delta.y.abs());

    let other = registry.parameter(4, Dof::ShiftX).unwrap();
    assert!(other.seed().abs() < delta.x.abs() / 2.0);
}

#[test]
fn test_steering_with_excluded_planes() {
    let layout = telescope(4, 5e-4);
    let gun = TrackGun::new(layout.clone()).without_scattering();
    let (_guard, dir) = workdir();
    let config = OrchestratorConfig::builder()
        .working_dir(dir.as_path())
        .alignment_mode(AlignmentMode::XYShift)
        .auto_solve(false)
        .build()
        .unwrap();

    let mut stage = stage(layout, vec![1, 2], config, EchoSolver, CountingSink::default());
    assert_eq!(stage.aligned_sensors(), vec![0, 3]);
    stage.on_run_start(&RunHeader { run_number: 9 }).unwrap();
    for event in events(&gun, 50, 1) {
        stage.on_event(&event).unwrap();
    }
    stage.on_run_end().unwrap();
    assert_eq!(
        stage.orchestrator().unwrap().state(),
        OrchestratorState::SteeringWritten
    );
    assert_eq!(stage.sink().calls, 0);

    let steering = std::fs::read_to_string(dir.join("steer.txt")).unwrap();
    assert!(steering.starts_with("Cfiles\nmillepede.bin\n"));
    assert!(steering.ends_with("end\n"));
    let params = steering_parameters(&steering);
    // one line per (sensor, dof) pair of the two aligned planes
    assert_eq!(params.len(), 4);
    let mut labels: Vec<_> = params.iter().map(|p| p.label).collect();
    labels.dedup();
    assert_eq!(labels, vec![1, 2, 3, 4]);
    for p in &params {
        assert_eq!(p.presigma, 0.0);
        assert_abs_diff_eq!(p.value, 0.0, epsilon = 1e-6);
    }
}

#[test]
fn test_fixed_sensor_ignores_residuals() {
    let layout = telescope(6, 0.0);
    let gun = TrackGun::new(layout.clone())
        .without_scattering()
        .with_misalignment(0, Vector2::new(0.1, 0.1));
    let (_guard, dir) = workdir();
    let config = OrchestratorConfig::builder()
        .working_dir(dir.as_path())
        .fixed_sensors(vec![0])
        .auto_solve(false)
        .build()
        .unwrap();

    let mut stage = stage(layout, vec![], config, EchoSolver, CountingSink::default());
    stage.on_run_start(&RunHeader { run_number: 2 }).unwrap();
    for event in events(&gun, 100, 3) {
        stage.on_event(&event).unwrap();
    }
    stage.on_run_end().unwrap();

    let steering = std::fs::read_to_string(dir.join("steer.txt")).unwrap();
    assert!(steering.contains("\n1 0.0 -1.0 ! 0 shiftX\n"));
    assert!(steering.contains("\n7 0.0 -1.0 ! 0 shiftY\n"));
    let params = steering_parameters(&steering);
    assert_eq!(params.iter().filter(|p| p.presigma == 0.0).count(), 10);
    // sensor 0 residuals were accumulated nonetheless
    let registry = stage.orchestrator().unwrap().registry();
    assert!(registry.parameter(0, Dof::ShiftX).unwrap().mean_residual() < -0.01);
}

#[test]
fn test_missing_solver_leaves_geometry_untouched() {
    init_logging();
    let layout = telescope(4, 5e-4);
    let gun = TrackGun::new(layout.clone());
    let (_guard, dir) = workdir();
    let constants = dir.join("constants.csv");
    let config = OrchestratorConfig::builder()
        .working_dir(dir.as_path())
        .solver_command("telalign-test-missing-solver")
        .build()
        .unwrap();

    let mut stage = stage(
        layout.clone(),
        vec![],
        config,
        TokioProcessRunner,
        CsvConstantsSink::new(constants.clone()),
    );
    stage.on_run_start(&RunHeader { run_number: 4 }).unwrap();
    for event in events(&gun, 20, 5) {
        stage.on_event(&event).unwrap();
    }
    assert!(stage.on_run_end().is_ok());

    assert_eq!(
        stage.orchestrator().unwrap().state(),
        OrchestratorState::Failed
    );
    assert!(stage.corrections().is_none());
    assert!(!constants.exists());
    for (before, after) in layout.planes().iter().zip(stage.layout().planes()) {
        assert_eq!(before.alignment, after.alignment);
    }
}

#[test]
fn test_solved_constants_reach_sink_and_layout() {
    let layout = telescope(6, 0.0);
    let gun = TrackGun::new(layout.clone())
        .without_scattering()
        .with_misalignment(3, Vector2::new(0.02, 0.0));
    let (_guard, dir) = workdir();
    let constants = dir.join("constants.csv");
    let config = OrchestratorConfig::builder()
        .working_dir(dir.as_path())
        .fixed_sensors(vec![0, 5])
        .build()
        .unwrap();

    let mut stage = stage(
        layout,
        vec![],
        config,
        EchoSolver,
        CsvConstantsSink::new(constants.clone()),
    );
    stage.on_run_start(&RunHeader { run_number: 5 }).unwrap();
    for event in events(&gun, 300, 9) {
        stage.on_event(&event).unwrap();
    }
    stage.on_run_end().unwrap();

    assert_eq!(
        stage.orchestrator().unwrap().state(),
        OrchestratorState::Ingested
    );
    let corrections = stage.corrections().unwrap().to_vec();
    assert_eq!(corrections.len(), 6);
    assert_eq!(CsvConstantsSink::read(&constants).unwrap(), corrections);

    let seed = stage
        .orchestrator()
        .unwrap()
        .registry()
        .parameter(3, Dof::ShiftX)
        .unwrap()
        .seed();
    let c3 = corrections.iter().find(|c| c.sensor_id == 3).unwrap();
    assert!(seed > 0.005);
    assert_abs_diff_eq!(c3.shift.x, seed, epsilon = 1e-9);
    assert_eq!(corrections[0], SensorCorrection::zero(0));

    let plane = stage.layout().plane(3).unwrap();
    assert_abs_diff_eq!(plane.alignment.shift.x, seed, epsilon = 1e-9);
    assert!(dir.join("millepede-run000005.res").is_file());
}
