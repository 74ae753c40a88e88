//! Tab-separated text export of a [`SweepResult`].
//!
//! One header line, then one `angle\tvoltage\tstd` row per entry, every value
//! in fixed notation with eight decimals.

use chrono::Local;
use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use log::{debug, info};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::SweepError;
use crate::types::SweepResult;

pub const HEADER: [&str; 3] = ["Angle (deg)", "Voltage (V)", "Voltage STD (V)"];

/// Write `result` as TSV to any writer
pub fn to_writer<W: Write>(result: &SweepResult, writer: W) -> Result<(), SweepError> {
    let mut writer = WriterBuilder::new().delimiter(b'\t').from_writer(writer);
    writer.write_record(HEADER)?;
    for (angle, voltage, noise) in result.rows() {
        writer.write_record([
            format!("{:.8}", angle),
            format!("{:.8}", voltage),
            format!("{:.8}", noise),
        ])?;
    }
    writer.flush().map_err(|source| SweepError::Io {
        source,
        context: "Could not flush export writer".to_string(),
    })?;
    Ok(())
}

/// Write `result` to `path`, creating parent directories as needed
pub fn write_tsv(result: &SweepResult, path: &Path) -> Result<(), SweepError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| SweepError::Io {
            source,
            context: format!("Could not create output directory {:?}", parent),
        })?;
    }
    let file = File::create(path).map_err(|source| SweepError::Io {
        source,
        context: format!("Could not create export file {:?}", path),
    })?;
    to_writer(result, file)?;
    info!("Wrote {} entries to {:?}", result.len(), path);
    Ok(())
}

fn parse_field(record: &StringRecord, column: usize, line: u64) -> Result<f64, SweepError> {
    let field = record.get(column).ok_or_else(|| {
        SweepError::Parse(format!(
            "line {}: expected {} columns, got {}",
            line,
            HEADER.len(),
            record.len()
        ))
    })?;
    field.parse::<f64>().map_err(|e| {
        SweepError::Parse(format!(
            "line {}: invalid value {:?} in column '{}': {}",
            line, field, HEADER[column], e
        ))
    })
}

/// Parse a TSV export back into a [`SweepResult`]
pub fn from_reader<R: Read>(reader: R) -> Result<SweepResult, SweepError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .trim(Trim::All)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    if headers.len() != HEADER.len() {
        return Err(SweepError::Parse(format!(
            "expected header with {} columns, got {:?}",
            HEADER.len(),
            headers
        )));
    }

    let mut angles = Vec::new();
    let mut voltages = Vec::new();
    let mut noises = Vec::new();
    for row in reader.records() {
        let row = row?;
        let line = row.position().map(|p| p.line()).unwrap_or(0);
        angles.push(parse_field(&row, 0, line)?);
        voltages.push(parse_field(&row, 1, line)?);
        noises.push(parse_field(&row, 2, line)?);
    }

    debug!("Parsed {} export rows", angles.len());
    SweepResult::from_columns(angles, voltages, noises)
}

pub fn read_tsv(path: &Path) -> Result<SweepResult, SweepError> {
    let file = File::open(path).map_err(|source| SweepError::Io {
        source,
        context: format!("Could not open export file {:?}", path),
    })?;
    from_reader(file)
}

/// `<dir>/<prefix>_<YYYYmmdd_HHMMSS>.txt` for the current local time
pub fn output_path(dir: &Path, prefix: &str) -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("{}_{}.txt", prefix, timestamp))
}
