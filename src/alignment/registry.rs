//! # Alignment parameter registry
//!
//! Single source of truth for the alignment parameters of a run: which `(sensor, dof)`
//! pairs exist, the integer label of each one, whether it is fixed, and the running mean of
//! the residuals used to seed its initial value.
//!
//! ## Labeling scheme
//!
//! Labels are dense integers starting at `1`. They are allocated by iterating the enabled
//! degrees of freedom in canonical order (see [`Dof`]) and, within each degree of freedom,
//! the sensors in the order given at allocation:
//!
//! ```text
//! label(sensor_k, dof_j) = 1 + rank(dof_j) · n_sensors + k
//! ```
//!
//! where `rank` is the position of the dof among the *enabled* ones. The mapping only depends
//! on the sensor list and the alignment mode, so two runs with the same inputs share their
//! labels, which is what the solver result relies on.
//!
//! Fixed parameters keep their label: fixing or freeing a parameter never renumbers the
//! others. They are reported to the solver with a "do not adjust" presigma and a zero seed.
use std::collections::HashMap;

use ahash::RandomState;
use nalgebra::Vector2;

use crate::{
    align_errors::AlignError,
    alignment::{Dof, DofSet},
    constants::{Label, SensorId},
};

/// Running mean, updated one sample at a time.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RunningMean {
    count: u64,
    mean: f64,
}

impl RunningMean {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.mean += (value - self.mean) / self.count as f64;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean of the pushed samples, `0.0` when empty.
    pub fn mean(&self) -> f64 {
        self.mean
    }
}

/// One alignment parameter: a `(sensor, dof)` pair with its label.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentParameter {
    pub sensor_id: SensorId,
    pub dof: Dof,
    pub label: Label,
    pub fixed: bool,
    residuals: RunningMean,
}

impl AlignmentParameter {
    /// Mean residual accumulated over the run.
    pub fn mean_residual(&self) -> f64 {
        self.residuals.mean()
    }

    pub fn samples(&self) -> u64 {
        self.residuals.count()
    }

    /// Initial value handed to the solver: the negated mean residual, or exactly `0.0`
    /// for a fixed parameter.
    pub fn seed(&self) -> f64 {
        if self.fixed || self.residuals.count() == 0 {
            0.0
        } else {
            -self.residuals.mean()
        }
    }
}

/// Resolution of `(sensor, dof)` pairs to solver labels, as seen by the track fit.
pub trait AlignmentLookup {
    /// Degrees of freedom for which labels may exist.
    fn dofs(&self) -> DofSet;

    fn label(&self, sensor_id: SensorId, dof: Dof) -> Option<Label>;
}

/// Lookup that resolves nothing; fits run through it produce no global derivatives.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAlignment;

impl AlignmentLookup for NoAlignment {
    fn dofs(&self) -> DofSet {
        DofSet::empty()
    }

    fn label(&self, _sensor_id: SensorId, _dof: Dof) -> Option<Label> {
        None
    }
}

/// Registry of all alignment parameters of a run.
#[derive(Debug, Clone)]
pub struct AlignmentParameterRegistry {
    sensors: Vec<SensorId>,
    dofs: DofSet,
    parameters: Vec<AlignmentParameter>,
    by_key: HashMap<(SensorId, Dof), usize, RandomState>,
}

impl AlignmentParameterRegistry {
    /// Allocate labels for every sensor under every enabled degree of freedom.
    ///
    /// Arguments
    /// -----------------
    /// * `sensor_ids`: the sensors, in canonical (beam) order.
    /// * `dofs`: the degrees of freedom enabled by the alignment mode.
    ///
    /// Return
    /// ----------
    /// * The registry, or [`AlignError::InvalidConfiguration`] when a sensor appears twice.
    ///
    /// See also
    /// ------------
    /// * [`AlignmentParameterRegistry::fix`] – Mark a parameter as "do not adjust".
    /// * [`AlignmentParameterRegistry::label`] – Resolve a `(sensor, dof)` pair.
    pub fn allocate(sensor_ids: &[SensorId], dofs: DofSet) -> Result<Self, AlignError> {
        let mut by_key = HashMap::with_hasher(RandomState::new());
        let mut parameters = Vec::with_capacity(sensor_ids.len() * dofs.len());

        for dof in dofs.iter() {
            for &sensor_id in sensor_ids {
                let label = parameters.len() as Label + 1;
                if by_key.insert((sensor_id, dof), parameters.len()).is_some() {
                    return Err(AlignError::InvalidConfiguration(format!(
                        "sensor {sensor_id} listed twice"
                    )));
                }
                parameters.push(AlignmentParameter {
                    sensor_id,
                    dof,
                    label,
                    fixed: false,
                    residuals: RunningMean::default(),
                });
            }
        }

        Ok(AlignmentParameterRegistry {
            sensors: sensor_ids.to_vec(),
            dofs,
            parameters,
            by_key,
        })
    }

    /// Mark `(sensor, dof)` as fixed. Pairs that have no label (dof not enabled) are
    /// ignored; unknown sensors are an error.
    pub fn fix(&mut self, sensor_id: SensorId, dof: Dof) -> Result<(), AlignError> {
        if !self.sensors.contains(&sensor_id) {
            return Err(AlignError::UnknownSensor(sensor_id));
        }
        if let Some(&i) = self.by_key.get(&(sensor_id, dof)) {
            self.parameters[i].fixed = true;
        }
        Ok(())
    }

    /// Fix every degree of freedom of a reference sensor.
    pub fn fix_sensor(&mut self, sensor_id: SensorId) -> Result<(), AlignError> {
        for dof in Dof::ALL {
            self.fix(sensor_id, dof)?;
        }
        Ok(())
    }

    /// Whether `(sensor, dof)` was placed in the fixed set, or is not adjusted at all
    /// because the dof is not enabled by the alignment mode.
    pub fn is_fixed(&self, sensor_id: SensorId, dof: Dof) -> bool {
        self.by_key
            .get(&(sensor_id, dof))
            .map_or(true, |&i| self.parameters[i].fixed)
    }

    pub fn sensors(&self) -> &[SensorId] {
        &self.sensors
    }

    pub fn parameter(&self, sensor_id: SensorId, dof: Dof) -> Option<&AlignmentParameter> {
        self.by_key
            .get(&(sensor_id, dof))
            .map(|&i| &self.parameters[i])
    }

    /// Parameter owning `label`.
    pub fn by_label(&self, label: Label) -> Option<&AlignmentParameter> {
        // labels are dense: label k lives at index k - 1
        usize::try_from(label - 1)
            .ok()
            .and_then(|i| self.parameters.get(i))
    }

    /// All parameters in label order.
    pub fn parameters(&self) -> &[AlignmentParameter] {
        &self.parameters
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// The `(sensor, dof) → label` mapping in label order.
    pub fn mapping(&self) -> Vec<((SensorId, Dof), Label)> {
        self.parameters
            .iter()
            .map(|p| ((p.sensor_id, p.dof), p.label))
            .collect()
    }

    /// Add one 2D hit residual of `sensor_id` to the running means of its shift
    /// parameters. Sensors without labels are ignored.
    pub fn accumulate_residual(&mut self, sensor_id: SensorId, residual: &Vector2<f64>) {
        for (dof, value) in [(Dof::ShiftX, residual.x), (Dof::ShiftY, residual.y)] {
            if let Some(&i) = self.by_key.get(&(sensor_id, dof)) {
                self.parameters[i].residuals.push(value);
            }
        }
    }
}

impl AlignmentLookup for AlignmentParameterRegistry {
    fn dofs(&self) -> DofSet {
        self.dofs
    }

    fn label(&self, sensor_id: SensorId, dof: Dof) -> Option<Label> {
        self.by_key
            .get(&(sensor_id, dof))
            .map(|&i| self.parameters[i].label)
    }
}
