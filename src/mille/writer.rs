//! Writer side of the binary record stream.
use std::{
    fs::File,
    io::{BufWriter, Write},
};

use byteorder::{LittleEndian, WriteBytesExt};
use camino::Utf8Path;

use crate::{
    align_errors::AlignError,
    constants::{
        DEFAULT_RECORD_CAPACITY, MAX_RECORD_CAPACITY, RECORD_FORMAT_VERSION, RECORD_MAGIC,
    },
    fit::FitOutcome,
    mille::{DerivativeRecord, RecordHeader, RecordPrecision},
};

/// Single-writer, append-only record stream.
///
/// The header is written on construction. Records are serialized into an in-memory buffer
/// first, so a record exceeding the capacity leaves the stream untouched.
#[derive(Debug)]
pub struct DerivativeRecordWriter<W: Write> {
    sink: W,
    header: RecordHeader,
    floats: Vec<f64>,
    ints: Vec<i32>,
    records: u64,
}

impl DerivativeRecordWriter<BufWriter<File>> {
    /// Create (truncate) the stream file at `path`.
    pub fn create(
        path: &Utf8Path,
        precision: RecordPrecision,
        capacity: u32,
    ) -> Result<Self, AlignError> {
        let file = File::create(path)?;
        tracing::info!(%path, ?precision, "record stream opened");
        DerivativeRecordWriter::new(BufWriter::new(file), precision, capacity)
    }
}

impl<W: Write> DerivativeRecordWriter<W> {
    /// Wrap `sink` and write the file header.
    ///
    /// Arguments
    /// -----------------
    /// * `sink`: destination of the stream.
    /// * `precision`: width of the stored floats.
    /// * `capacity`: maximum number of words per record, in `1..=MAX_RECORD_CAPACITY`.
    pub fn new(mut sink: W, precision: RecordPrecision, capacity: u32) -> Result<Self, AlignError> {
        if !(1..=MAX_RECORD_CAPACITY).contains(&capacity) {
            return Err(AlignError::InvalidConfiguration(format!(
                "record capacity must be in 1..={MAX_RECORD_CAPACITY}, got {capacity}"
            )));
        }
        sink.write_all(&RECORD_MAGIC)?;
        sink.write_u32::<LittleEndian>(RECORD_FORMAT_VERSION)?;
        sink.write_u32::<LittleEndian>(capacity)?;
        sink.write_u32::<LittleEndian>(precision.width())?;
        Ok(DerivativeRecordWriter {
            sink,
            header: RecordHeader {
                version: RECORD_FORMAT_VERSION,
                capacity,
                precision,
            },
            floats: Vec::with_capacity(capacity.min(DEFAULT_RECORD_CAPACITY) as usize),
            ints: Vec::with_capacity(capacity.min(DEFAULT_RECORD_CAPACITY) as usize),
            records: 0,
        })
    }

    /// Writer with the default capacity.
    pub fn with_default_capacity(sink: W, precision: RecordPrecision) -> Result<Self, AlignError> {
        DerivativeRecordWriter::new(sink, precision, DEFAULT_RECORD_CAPACITY)
    }

    pub fn header(&self) -> &RecordHeader {
        &self.header
    }

    /// Number of records written so far.
    pub fn records_written(&self) -> u64 {
        self.records
    }

    /// Append the constraints of one fitted track as one record.
    pub fn append(&mut self, outcome: &FitOutcome) -> Result<(), AlignError> {
        let rows: Vec<DerivativeRecord> = outcome.rows.iter().map(DerivativeRecord::from_row).collect();
        self.write_record(&rows)
    }

    /// Append one record made of `rows`.
    ///
    /// Return
    /// ----------
    /// * [`AlignError::RecordOverflow`] when the record exceeds the capacity,
    ///   [`AlignError::InvalidLabel`] for a label outside `1..=i32::MAX`,
    ///   [`AlignError::RecordStream`] on I/O failure.
    pub fn write_record(&mut self, rows: &[DerivativeRecord]) -> Result<(), AlignError> {
        let requested = 1 + rows.iter().map(DerivativeRecord::words).sum::<usize>();
        let capacity = self.header.capacity as usize;
        if requested > capacity {
            return Err(AlignError::RecordOverflow {
                capacity,
                requested,
            });
        }
        rows.iter().try_for_each(DerivativeRecord::validate)?;

        self.floats.clear();
        self.ints.clear();
        self.push(0.0, 0);
        for row in rows {
            self.push(row.value, 0);
            for &(index, d) in &row.local {
                self.push(d, index as i32);
            }
            self.push(row.sigma, 0);
            self.push(row.down_weight, 0);
            for &(label, d) in &row.globals {
                self.push(d, label);
            }
        }

        let n = 2 * self.floats.len() as i32;
        match self.header.precision {
            RecordPrecision::F32 => {
                self.sink.write_i32::<LittleEndian>(n)?;
                for &v in &self.floats {
                    self.sink.write_f32::<LittleEndian>(v as f32)?;
                }
            }
            RecordPrecision::F64 => {
                self.sink.write_i32::<LittleEndian>(-n)?;
                for &v in &self.floats {
                    self.sink.write_f64::<LittleEndian>(v)?;
                }
            }
        }
        for &i in &self.ints {
            self.sink.write_i32::<LittleEndian>(i)?;
        }
        self.records += 1;
        Ok(())
    }

    fn push(&mut self, value: f64, int: i32) {
        self.floats.push(value);
        self.ints.push(int);
    }

    pub fn flush(&mut self) -> Result<(), AlignError> {
        self.sink.flush()?;
        Ok(())
    }

    /// Flush and hand back the sink, closing the stream.
    pub fn finish(mut self) -> Result<W, AlignError> {
        self.sink.flush()?;
        tracing::debug!(records = self.records, "record stream closed");
        Ok(self.sink)
    }
}

#[cfg(test)]
mod writer_test {
    use super::*;
    use smallvec::smallvec;

    fn row() -> DerivativeRecord {
        DerivativeRecord {
            local: smallvec![(1, 0.5), (3, -1.0)],
            globals: smallvec![(7, -1.0)],
            value: 0.25,
            sigma: 0.004,
            down_weight: 1.0,
        }
    }

    #[test]
    fn test_header_and_record_layout() {
        let mut writer =
            DerivativeRecordWriter::new(Vec::new(), RecordPrecision::F32, 100).unwrap();
        writer.write_record(&[row()]).unwrap();
        let bytes = writer.finish().unwrap();

        assert_eq!(&bytes[0..4], b"TLMB");
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &100u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &4u32.to_le_bytes());
        // 1 + 6 words → n = 14
        assert_eq!(&bytes[16..20], &14i32.to_le_bytes());
        assert_eq!(bytes.len(), 16 + 4 + 7 * 4 + 7 * 4);
    }

    #[test]
    fn test_double_precision_negates_count() {
        let mut writer =
            DerivativeRecordWriter::with_default_capacity(Vec::new(), RecordPrecision::F64)
                .unwrap();
        writer.write_record(&[row()]).unwrap();
        assert_eq!(writer.records_written(), 1);
        let bytes = writer.finish().unwrap();
        assert_eq!(&bytes[16..20], &(-14i32).to_le_bytes());
        assert_eq!(bytes.len(), 16 + 4 + 7 * 8 + 7 * 4);
    }

    #[test]
    fn test_overflow_and_invalid_label() {
        let mut writer = DerivativeRecordWriter::new(Vec::new(), RecordPrecision::F32, 10).unwrap();
        let err = writer.write_record(&[row(), row()]).unwrap_err();
        assert_eq!(
            err,
            AlignError::RecordOverflow {
                capacity: 10,
                requested: 13
            }
        );

        let mut bad = row();
        bad.globals[0].0 = 0;
        assert_eq!(
            writer.write_record(&[bad]).unwrap_err(),
            AlignError::InvalidLabel(0)
        );
        assert_eq!(writer.records_written(), 0);
        assert_eq!(writer.finish().unwrap().len(), 16);
    }

    #[test]
    fn test_capacity_bounds() {
        for capacity in [0, MAX_RECORD_CAPACITY + 1, u32::MAX] {
            let err = DerivativeRecordWriter::new(Vec::new(), RecordPrecision::F64, capacity)
                .unwrap_err();
            assert!(matches!(err, AlignError::InvalidConfiguration(_)));
        }
        let writer =
            DerivativeRecordWriter::new(Vec::new(), RecordPrecision::F64, MAX_RECORD_CAPACITY)
                .unwrap();
        assert_eq!(writer.header().capacity, MAX_RECORD_CAPACITY);
        // header only
        assert_eq!(writer.finish().unwrap().len(), 16);
    }
}
