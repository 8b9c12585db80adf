//! Parser for the solver result file.
//!
//! ```text
//! Parameter   ! first 3 elements per line are significant
//!          1  0.12345E-02  0.0000  0.12345E-02  0.4567E-03
//!          2  0.00000E+00 -1.0000
//! ```
//!
//! Columns are `label value presigma [difference error]`; everything after `!` is a comment.
use camino::Utf8Path;
use nom::{
    bytes::complete::take_until,
    character::complete::{i32 as label, space0, space1},
    combinator::{map, opt},
    number::complete::double,
    sequence::preceded,
    IResult, Parser,
};

use crate::{align_errors::AlignError, constants::Label};

/// One solved parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct SolvedParameter {
    pub label: Label,
    pub value: f64,
    pub presigma: f64,
    pub difference: Option<f64>,
    pub error: Option<f64>,
}

impl SolvedParameter {
    /// `value / error`, when the solver reported a positive error.
    pub fn pull(&self) -> Option<f64> {
        self.error.filter(|e| *e > 0.0).map(|e| self.value / e)
    }

    pub fn is_fixed(&self) -> bool {
        self.presigma < 0.0
    }
}

/// Parse one parameter line, comments excluded.
pub fn parse_result_line(input: &str) -> IResult<&str, SolvedParameter> {
    let (input, remain) = opt(take_until("!")).parse(input)?; // ignore comments
    let input = remain.unwrap_or(input).trim();

    map(
        (
            preceded(space0, label),
            preceded(space1, double),
            preceded(space1, double),
            opt((preceded(space1, double), preceded(space1, double))),
        ),
        |(label, value, presigma, extra)| SolvedParameter {
            label,
            value,
            presigma,
            difference: extra.map(|(d, _)| d),
            error: extra.map(|(_, e)| e),
        },
    )
    .parse(input)
}

/// Parse a whole result file.
///
/// Blank lines, comment lines and the `Parameter` header are skipped. Any other line that
/// does not parse is an [`AlignError::ResultParse`].
pub fn parse_result(content: &str) -> Result<Vec<SolvedParameter>, AlignError> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim_start();
            !(line.is_empty() || line.starts_with('!') || line.starts_with("Parameter"))
        })
        .map(|(n, line)| {
            parse_result_line(line)
                .map(|(_, p)| p)
                .map_err(|e| AlignError::ResultParse(format!("line {}: {e}", n + 1)))
        })
        .collect()
}

/// Read and parse the result file at `path`.
///
/// Return
/// ----------
/// * [`AlignError::ResultMissing`] when the file does not exist or cannot be read.
pub fn read_result(path: &Utf8Path) -> Result<Vec<SolvedParameter>, AlignError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AlignError::ResultMissing(format!("{path}: {e}")))?;
    parse_result(&content)
}
