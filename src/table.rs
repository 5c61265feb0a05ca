//! Plain-text numeric tables: the format of scores, loadings and confounds.
//!
//! Values are written with ten decimal places, one row per line, columns
//! separated by a single space.

use std::fmt::Write as _;
use std::fs;

use camino::Utf8Path;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::error::TableError;

/// Writes one value on a single line, without a trailing newline.
pub fn write_scalar(path: impl AsRef<Utf8Path>, value: f64) -> Result<(), TableError> {
    fs::write(path.as_ref(), format!("{value:.10}"))?;
    Ok(())
}

/// Writes a vector with one value per line.
pub fn write_vector(path: impl AsRef<Utf8Path>, values: ArrayView1<f64>) -> Result<(), TableError> {
    let mut buffer = String::new();
    for value in values {
        let _ = writeln!(buffer, "{value:.10}");
    }

    fs::write(path.as_ref(), buffer)?;
    Ok(())
}

/// Writes a matrix, one row per line.
pub fn write_matrix(path: impl AsRef<Utf8Path>, values: ArrayView2<f64>) -> Result<(), TableError> {
    fs::write(path.as_ref(), format_matrix(values))?;
    Ok(())
}

fn format_matrix(values: ArrayView2<f64>) -> String {
    let mut buffer = String::new();

    for row in values.rows() {
        let mut first = true;
        for value in row {
            if !first {
                buffer.push(' ');
            }
            let _ = write!(buffer, "{value:.10}");
            first = false;
        }
        buffer.push('\n');
    }

    buffer
}

/// Reads a whitespace- or comma-delimited numeric table.
///
/// Blank lines and lines starting with `#` are skipped. A first row that does
/// not parse as numbers is treated as a column header and dropped.
pub fn read_matrix(path: impl AsRef<Utf8Path>) -> Result<Array2<f64>, TableError> {
    parse_matrix(&fs::read_to_string(path.as_ref())?)
}

fn parse_matrix(text: &str) -> Result<Array2<f64>, TableError> {
    let mut rows: Vec<Vec<f64>> = Vec::new();
    let mut width = None;

    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let tokens: Vec<&str> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
            .collect();

        let parsed: Result<Vec<f64>, _> = tokens.iter().map(|t| t.parse::<f64>()).collect();
        let row = match parsed {
            Ok(row) => row,
            Err(_) if rows.is_empty() && width.is_none() => {
                // header
                width = Some(tokens.len());
                continue;
            }
            Err(_) => {
                let token = tokens
                    .iter()
                    .find(|t| t.parse::<f64>().is_err())
                    .map(|t| t.to_string())
                    .unwrap_or_default();
                return Err(TableError::Parse {
                    line: number + 1,
                    token,
                });
            }
        };

        let expected = *width.get_or_insert(row.len());
        if row.len() != expected {
            return Err(TableError::Ragged {
                line: number + 1,
                expected,
                found: row.len(),
            });
        }

        rows.push(row);
    }

    let ncols = width.unwrap_or(0);
    let nrows = rows.len();
    let flat: Vec<f64> = rows.into_iter().flatten().collect();

    Ok(Array2::from_shape_vec((nrows, ncols), flat)?)
}

/// Reads a single column (or a single row) as a vector.
pub fn read_vector(path: impl AsRef<Utf8Path>) -> Result<Array1<f64>, TableError> {
    let matrix = read_matrix(path)?;
    let len = matrix.len();
    Ok(matrix.into_shape_with_order(len)?)
}
