//! # Geometry-update sinks
//!
//! After the external solve, the alignment corrections are republished per sensor, keyed by
//! the same sensor identifiers as the plane layout. A [`GeometryUpdateSink`] is the
//! receiving end of that hand-off:
//!
//! * [`TelescopeLayout`] accumulates the corrections into its planes so that later events
//!   of the same process see the corrected geometry,
//! * [`CsvConstantsSink`] writes them as a small CSV table (`sensor_id,dx,dy,dz,rx,ry,rz`)
//!   for later runs.
//!
//! Sinks receive all corrections of a run in a single call; a sink either applies all of
//! them or reports an error.
use camino::{Utf8Path, Utf8PathBuf};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::{
    align_errors::AlignError,
    constants::SensorId,
    geometry::{PlaneLayout, TelescopeLayout},
};

/// Solved alignment correction for one sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorCorrection {
    pub sensor_id: SensorId,
    /// Fitted displacement along x, y, z (mm)
    pub shift: Vector3<f64>,
    /// Fitted small-angle rotation around x, y, z (rad)
    pub rotation: Vector3<f64>,
}

impl SensorCorrection {
    pub fn zero(sensor_id: SensorId) -> Self {
        SensorCorrection {
            sensor_id,
            shift: Vector3::zeros(),
            rotation: Vector3::zeros(),
        }
    }
}

/// Receiver of the corrected per-sensor alignment constants.
pub trait GeometryUpdateSink {
    fn apply(&mut self, corrections: &[SensorCorrection]) -> Result<(), AlignError>;
}

impl GeometryUpdateSink for TelescopeLayout {
    fn apply(&mut self, corrections: &[SensorCorrection]) -> Result<(), AlignError> {
        if let Some(c) = corrections
            .iter()
            .find(|c| PlaneLayout::plane(self, c.sensor_id).is_none())
        {
            return Err(AlignError::UnknownSensor(c.sensor_id));
        }

        for c in corrections {
            if let Some(plane) = self.plane_mut(c.sensor_id) {
                plane.alignment.shift += c.shift;
                plane.alignment.rotation += c.rotation;
            }
        }
        Ok(())
    }
}

/// One CSV row of alignment constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConstantsRow {
    pub sensor_id: SensorId,
    pub dx: f64,
    pub dy: f64,
    pub dz: f64,
    pub rx: f64,
    pub ry: f64,
    pub rz: f64,
}

impl From<&SensorCorrection> for ConstantsRow {
    fn from(c: &SensorCorrection) -> Self {
        ConstantsRow {
            sensor_id: c.sensor_id,
            dx: c.shift.x,
            dy: c.shift.y,
            dz: c.shift.z,
            rx: c.rotation.x,
            ry: c.rotation.y,
            rz: c.rotation.z,
        }
    }
}

impl From<ConstantsRow> for SensorCorrection {
    fn from(r: ConstantsRow) -> Self {
        SensorCorrection {
            sensor_id: r.sensor_id,
            shift: Vector3::new(r.dx, r.dy, r.dz),
            rotation: Vector3::new(r.rx, r.ry, r.rz),
        }
    }
}

/// Writes the alignment constants to a CSV file, replacing any previous content.
#[derive(Debug, Clone)]
pub struct CsvConstantsSink {
    path: Utf8PathBuf,
}

impl CsvConstantsSink {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        CsvConstantsSink { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Read back a constants file written by this sink.
    pub fn read(path: &Utf8Path) -> Result<Vec<SensorCorrection>, AlignError> {
        let mut reader = csv::Reader::from_path(path)?;
        reader
            .deserialize::<ConstantsRow>()
            .map(|row| row.map(SensorCorrection::from).map_err(AlignError::from))
            .collect()
    }
}

impl GeometryUpdateSink for CsvConstantsSink {
    fn apply(&mut self, corrections: &[SensorCorrection]) -> Result<(), AlignError> {
        let mut writer = csv::Writer::from_path(&self.path)?;
        for c in corrections {
            writer.serialize(ConstantsRow::from(c))?;
        }
        writer
            .flush()
            .map_err(|e| AlignError::GeometryUpdate(e.to_string()))?;
        tracing::info!(
            path = %self.path,
            sensors = corrections.len(),
            "alignment constants written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod update_test {
    use super::*;
    use crate::geometry::Plane;

    #[test]
    fn test_layout_accumulates_corrections() {
        let mut layout = TelescopeLayout::new(vec![
            Plane::new(0, Vector3::new(0.0, 0.0, 0.0), 0.0),
            Plane::new(1, Vector3::new(0.0, 0.0, 100.0), 0.0),
        ])
        .unwrap();

        let mut c = SensorCorrection::zero(1);
        c.shift.x = 0.05;
        layout.apply(&[c]).unwrap();
        layout.apply(&[c]).unwrap();

        let plane = PlaneLayout::plane(&layout, 1).unwrap();
        assert!((plane.alignment.shift.x - 0.1).abs() < 1e-15);
        assert_eq!(
            PlaneLayout::plane(&layout, 0).unwrap().alignment.shift,
            Vector3::zeros()
        );
    }

    #[test]
    fn test_layout_rejects_unknown_sensor_without_partial_update() {
        let mut layout =
            TelescopeLayout::new(vec![Plane::new(0, Vector3::new(0.0, 0.0, 0.0), 0.0)]).unwrap();
        let mut good = SensorCorrection::zero(0);
        good.shift.y = 1.0;
        let err = layout
            .apply(&[good, SensorCorrection::zero(42)])
            .unwrap_err();
        assert_eq!(err, AlignError::UnknownSensor(42));
        assert_eq!(
            PlaneLayout::plane(&layout, 0).unwrap().alignment.shift.y,
            0.0
        );
    }

    #[test]
    fn test_csv_sink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("constants.csv")).unwrap();
        let mut sink = CsvConstantsSink::new(path.clone());

        let corrections = vec![
            SensorCorrection {
                sensor_id: 2,
                shift: Vector3::new(0.01, -0.02, 0.5),
                rotation: Vector3::new(0.0, 0.0, 1e-4),
            },
            SensorCorrection::zero(3),
        ];
        sink.apply(&corrections).unwrap();

        let read = CsvConstantsSink::read(&path).unwrap();
        assert_eq!(read, corrections);
    }
}
