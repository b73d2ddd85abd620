//! Comma-separated dataframe I/O. Cells are doubles, parsed with C
//! `strtod` semantics; the writer emits fixed-point values and appends the
//! classification columns.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::{verify, Error, Sample};

pub const PHOTON_INDEX_COLUMN: &str = "index_ph";
pub const X_COLUMN: &str = "x_atc";
pub const Z_COLUMN: &str = "geoid_corr_h";
pub const CLS_COLUMN: &str = "manual_label";
pub const PREDICTION_COLUMN: &str = "prediction";
pub const SURFACE_COLUMN: &str = "sea_surface_h";
pub const BATHY_COLUMN: &str = "bathy_h";

/// Digits written after the decimal point.
const OUTPUT_PRECISION: usize = 16;

#[derive(Clone, Debug, Default)]
pub struct Dataframe {
    pub headers: Vec<String>,
    pub columns: Vec<Vec<f64>>,
}

impl Dataframe {
    pub fn is_valid(&self) -> bool {
        if self.headers.len() != self.columns.len() {
            return false;
        }
        self.columns
            .iter()
            .all(|c| c.len() == self.columns[0].len())
    }

    pub fn rows(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h == name)
    }

    pub fn column(&self, name: &str) -> Option<&Vec<f64>> {
        let index = self.headers.iter().position(|h| h == name)?;
        Some(&self.columns[index])
    }

    /// Read a dataframe from CSV text. The first line is the header row
    /// (carriage returns stripped); empty lines are skipped; a data row
    /// whose width differs from the header is an error.
    pub fn read<R: BufRead>(mut reader: R) -> Result<Self, Error> {
        let mut df = Dataframe::default();

        let mut line = String::new();
        if read_line(&mut reader, &mut line)? == 0 {
            return Ok(df);
        }

        for header in trimmed(&line).split(',') {
            df.headers.push(header.replace('\r', ""));
        }
        df.columns = vec![Vec::new(); df.headers.len()];

        let mut row = 0usize;
        loop {
            line.clear();
            if read_line(&mut reader, &mut line)? == 0 {
                break;
            }
            let text = trimmed(&line);
            if text.is_empty() {
                continue;
            }
            row += 1;

            let mut cells = 0usize;
            for (i, cell) in text.split(',').enumerate() {
                if i < df.columns.len() {
                    df.columns[i].push(parse_cell(cell));
                }
                cells = i + 1;
            }
            if cells != df.headers.len() {
                return Err(Error::InputFormat(format!(
                    "row {} has {} cells but the header has {} columns",
                    row,
                    cells,
                    df.headers.len()
                )));
            }
        }

        verify!(df.is_valid());
        Ok(df)
    }

    pub fn read_path(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)
            .map_err(|e| Error::InputFormat(format!("{}: {e}", path.display())))?;
        Self::read(BufReader::new(file))
    }
}

fn read_line<R: BufRead>(reader: &mut R, line: &mut String) -> Result<usize, Error> {
    reader
        .read_line(line)
        .map_err(|e| Error::InputFormat(e.to_string()))
}

fn trimmed(line: &str) -> &str {
    line.trim_end_matches(|c| c == '\n' || c == '\r')
}

/// Parse a cell the way `strtod` does: skip leading whitespace, consume the
/// longest numeric prefix, and yield 0.0 when nothing parses.
fn parse_cell(cell: &str) -> f64 {
    let text = cell.trim();
    for end in (1..=text.len()).rev() {
        if !text.is_char_boundary(end) {
            continue;
        }
        if let Ok(v) = text[..end].parse::<f64>() {
            return v;
        }
    }
    0.0
}

/// Build the photon records from a dataframe. `index_ph`, `x_atc` and
/// `geoid_corr_h` are required; label, prediction and estimate columns are
/// carried over when present.
pub fn convert_dataframe(df: &Dataframe) -> Result<Vec<Sample>, Error> {
    verify!(df.is_valid());

    let pi = required_column(df, PHOTON_INDEX_COLUMN)?;
    let x = required_column(df, X_COLUMN)?;
    let z = required_column(df, Z_COLUMN)?;

    let cls = df.column(CLS_COLUMN);
    let prediction = df.column(PREDICTION_COLUMN);
    let surface_elevation = df.column(SURFACE_COLUMN);
    let bathy_elevation = df.column(BATHY_COLUMN);

    let nrows = df.rows();
    let mut dataset = vec![Sample::default(); nrows];

    for (j, s) in dataset.iter_mut().enumerate() {
        s.h5_index = pi[j] as u64;
        s.x = x[j];
        s.z = z[j];
        if let Some(c) = cls {
            s.cls = c[j] as u32;
        }
        if let Some(p) = prediction {
            s.prediction = p[j] as u32;
        }
        if let Some(e) = surface_elevation {
            s.surface_elevation = e[j];
        }
        if let Some(e) = bathy_elevation {
            s.bathy_elevation = e[j];
        }
    }

    Ok(dataset)
}

fn required_column<'a>(df: &'a Dataframe, name: &str) -> Result<&'a Vec<f64>, Error> {
    df.column(name)
        .ok_or_else(|| Error::InputFormat(format!("can't find '{name}' in dataframe")))
}

/// Write the input dataframe with `prediction`, `sea_surface_h` and
/// `bathy_h` appended, fixed-point with 16-digit precision.
pub fn write_samples<W: Write>(writer: W, df: &Dataframe, samples: &[Sample]) -> Result<(), Error> {
    verify!(df.is_valid());
    verify!(df.rows() == samples.len());

    // A dataframe with no columns writes nothing
    if df.headers.is_empty() {
        return Ok(());
    }

    let mut w = csv::Writer::from_writer(writer);

    let mut headers = df.headers.clone();
    headers.push(PREDICTION_COLUMN.to_string());
    headers.push(SURFACE_COLUMN.to_string());
    headers.push(BATHY_COLUMN.to_string());
    w.write_record(&headers)
        .map_err(|e| Error::InputFormat(e.to_string()))?;

    for (i, s) in samples.iter().enumerate() {
        let mut record: Vec<String> = df.columns.iter().map(|c| format_cell(c[i])).collect();
        record.push(format_cell(s.prediction as f64));
        record.push(format_cell(s.surface_elevation));
        record.push(format_cell(s.bathy_elevation));
        w.write_record(&record)
            .map_err(|e| Error::InputFormat(e.to_string()))?;
    }

    w.flush().map_err(|e| Error::InputFormat(e.to_string()))?;
    Ok(())
}

fn format_cell(v: f64) -> String {
    format!("{:.prec$}", v, prec = OUTPUT_PRECISION)
}
