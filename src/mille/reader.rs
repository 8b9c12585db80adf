//! Reader for the binary record stream, used for diagnostics and tests.
use std::{
    fs::File,
    io::{self, BufReader, Read},
};

use byteorder::{LittleEndian, ReadBytesExt};
use camino::Utf8Path;

use crate::{
    align_errors::AlignError,
    constants::{RECORD_FORMAT_VERSION, RECORD_MAGIC},
    mille::{DerivativeRecord, RecordHeader, RecordPrecision},
};

/// Sequential reader of the records written by
/// [`DerivativeRecordWriter`](crate::mille::writer::DerivativeRecordWriter).
#[derive(Debug)]
pub struct MilleReader<R: Read> {
    source: R,
    header: RecordHeader,
}

impl MilleReader<BufReader<File>> {
    pub fn open(path: &Utf8Path) -> Result<Self, AlignError> {
        MilleReader::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read> MilleReader<R> {
    /// Read and validate the file header.
    pub fn new(mut source: R) -> Result<Self, AlignError> {
        let mut magic = [0u8; 4];
        source.read_exact(&mut magic)?;
        if magic != RECORD_MAGIC {
            return Err(AlignError::MalformedRecord("bad magic".into()));
        }
        let version = source.read_u32::<LittleEndian>()?;
        if version != RECORD_FORMAT_VERSION {
            return Err(AlignError::MalformedRecord(format!(
                "unsupported format version {version}"
            )));
        }
        let capacity = source.read_u32::<LittleEndian>()?;
        let precision = RecordPrecision::from_width(source.read_u32::<LittleEndian>()?)?;
        Ok(MilleReader {
            source,
            header: RecordHeader {
                version,
                capacity,
                precision,
            },
        })
    }

    pub fn header(&self) -> &RecordHeader {
        &self.header
    }

    /// Next record, or `None` at the end of the stream.
    pub fn next_record(&mut self) -> Result<Option<Vec<DerivativeRecord>>, AlignError> {
        let n = match self.source.read_i32::<LittleEndian>() {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let double = n < 0;
        let expected = self.header.precision == RecordPrecision::F64;
        if double != expected || n % 2 != 0 || n == 0 {
            return Err(AlignError::MalformedRecord(format!("bad word count {n}")));
        }
        let words = (n.unsigned_abs() / 2) as usize;
        if words > self.header.capacity as usize {
            return Err(AlignError::RecordOverflow {
                capacity: self.header.capacity as usize,
                requested: words,
            });
        }

        let floats = (0..words)
            .map(|_| match self.header.precision {
                RecordPrecision::F32 => self.source.read_f32::<LittleEndian>().map(f64::from),
                RecordPrecision::F64 => self.source.read_f64::<LittleEndian>(),
            })
            .collect::<Result<Vec<f64>, _>>()?;
        let ints = (0..words)
            .map(|_| self.source.read_i32::<LittleEndian>())
            .collect::<Result<Vec<i32>, _>>()?;

        decode(&floats, &ints).map(Some)
    }
}

impl<R: Read> Iterator for MilleReader<R> {
    type Item = Result<Vec<DerivativeRecord>, AlignError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Split the word pairs of one record into its constraints.
fn decode(floats: &[f64], ints: &[i32]) -> Result<Vec<DerivativeRecord>, AlignError> {
    let malformed = |what: &str| AlignError::MalformedRecord(what.to_string());
    if ints.first() != Some(&0) || floats.first() != Some(&0.0) {
        return Err(malformed("record does not start with the (0, 0) word"));
    }

    let words = ints.len();
    let marker = |i: usize| i < words && ints[i] == 0;
    let mut rows = Vec::new();
    let mut i = 1;
    while i < words {
        let mut row = DerivativeRecord {
            value: floats[i],
            ..Default::default()
        };
        i += 1;
        while i < words && ints[i] != 0 {
            let index = u32::try_from(ints[i]).map_err(|_| malformed("negative local index"))?;
            row.local.push((index, floats[i]));
            i += 1;
        }
        if !marker(i) || !marker(i + 1) {
            return Err(malformed("truncated constraint block"));
        }
        row.sigma = floats[i];
        row.down_weight = floats[i + 1];
        i += 2;
        while i < words && ints[i] != 0 {
            row.globals.push((ints[i], floats[i]));
            i += 1;
        }
        rows.push(row);
    }
    Ok(rows)
}
