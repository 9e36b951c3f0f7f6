//! Insurer file parsing and metadata-driven record mapping.
//!
//! The reader turns a CSV or spreadsheet file into a header-indexed table of
//! loosely typed cell values; the mapper then applies an insurer's field
//! mapping rules (plus named transforms) to each row, producing one
//! `CanonicalRecord` per source row.

use std::collections::HashMap;
use std::io::{Cursor, Read, Seek};
use std::path::Path;

use calamine::{open_workbook_auto, open_workbook_auto_from_rs, Data, Reader};
use pims_core::normalize::apply_transform;
use pims_core::{CanonicalRecord, FieldMapping, FieldValue};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "pims-ingest";

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("unsupported file extension: {0}")]
    UnsupportedExtension(String),
    #[error("{0}: file has no header row")]
    MissingHeader(String),
    #[error("{0}: workbook has no sheets")]
    EmptyWorkbook(String),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("reading workbook {path}: {source}")]
    Workbook {
        path: String,
        #[source]
        source: calamine::Error,
    },
}

/// Header row plus data rows, each row aligned to the header-to-index map.
/// A missing cell, a blank cell, and a cell past the row's end all surface
/// as `None`.
#[derive(Debug, Clone)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub header_index: HashMap<String, usize>,
    pub rows: Vec<Vec<Option<FieldValue>>>,
}

fn extension_of(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_ascii_lowercase())
    }
}

/// Parse a file on disk, branching on its extension.
pub fn read_table(path: impl AsRef<Path>) -> Result<RawTable, ReadError> {
    let path = path.as_ref();
    let display = path.display().to_string();
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("csv") => {
            let file = std::fs::File::open(path).map_err(|source| ReadError::Io {
                path: display.clone(),
                source,
            })?;
            read_csv(file, &display)
        }
        Some("xls") | Some("xlsx") => {
            let workbook = open_workbook_auto(path).map_err(|source| ReadError::Workbook {
                path: display.clone(),
                source,
            })?;
            read_spreadsheet(workbook, &display)
        }
        other => Err(ReadError::UnsupportedExtension(
            other.unwrap_or("<none>").to_string(),
        )),
    }
}

/// Parse in-memory upload bytes; used for pre-job schema validation so the
/// same coercion rules apply before and after a job exists.
pub fn read_table_from_bytes(filename: &str, bytes: &[u8]) -> Result<RawTable, ReadError> {
    match extension_of(filename).as_deref() {
        Some("csv") => read_csv(Cursor::new(bytes), filename),
        Some("xls") | Some("xlsx") => {
            let workbook =
                open_workbook_auto_from_rs(Cursor::new(bytes)).map_err(|source| {
                    ReadError::Workbook {
                        path: filename.to_string(),
                        source,
                    }
                })?;
            read_spreadsheet(workbook, filename)
        }
        other => Err(ReadError::UnsupportedExtension(
            other.unwrap_or("<none>").to_string(),
        )),
    }
}

fn read_csv<R: Read>(reader: R, path: &str) -> Result<RawTable, ReadError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut records = csv_reader.records();
    let header_record = match records.next() {
        Some(Ok(record)) => record,
        Some(Err(source)) => {
            return Err(ReadError::Csv {
                path: path.to_string(),
                source,
            })
        }
        None => return Err(ReadError::MissingHeader(path.to_string())),
    };

    let headers: Vec<String> = header_record.iter().map(|h| h.trim().to_string()).collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(ReadError::MissingHeader(path.to_string()));
    }
    let header_index = build_header_index(&headers);

    let mut rows = Vec::new();
    for record in records {
        let record = record.map_err(|source| ReadError::Csv {
            path: path.to_string(),
            source,
        })?;
        let values: Vec<Option<FieldValue>> = (0..headers.len())
            .map(|i| {
                record.get(i).and_then(|cell| {
                    let cell = cell.trim();
                    if cell.is_empty() {
                        None
                    } else {
                        Some(FieldValue::Text(cell.to_string()))
                    }
                })
            })
            .collect();
        if values.iter().all(Option::is_none) {
            continue;
        }
        rows.push(values);
    }

    info!(path, rows = rows.len(), "CSV parsed");
    Ok(RawTable {
        headers,
        header_index,
        rows,
    })
}

fn read_spreadsheet<RS: Read + Seek>(
    mut workbook: calamine::Sheets<RS>,
    path: &str,
) -> Result<RawTable, ReadError> {
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| ReadError::EmptyWorkbook(path.to_string()))?
        .map_err(|source| ReadError::Workbook {
            path: path.to_string(),
            source,
        })?;

    let mut sheet_rows = range.rows();
    let header_row = sheet_rows
        .next()
        .ok_or_else(|| ReadError::MissingHeader(path.to_string()))?;

    let headers: Vec<String> = header_row
        .iter()
        .map(|cell| {
            cell_to_value(cell)
                .map(|v| v.render().trim().to_string())
                .unwrap_or_default()
        })
        .collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(ReadError::MissingHeader(path.to_string()));
    }
    let header_index = build_header_index(&headers);

    let mut rows = Vec::new();
    for sheet_row in sheet_rows {
        let values: Vec<Option<FieldValue>> = (0..headers.len())
            .map(|i| sheet_row.get(i).and_then(cell_to_value))
            .collect();
        if values.iter().all(Option::is_none) {
            continue;
        }
        rows.push(values);
    }

    info!(path, rows = rows.len(), "spreadsheet parsed");
    Ok(RawTable {
        headers,
        header_index,
        rows,
    })
}

fn build_header_index(headers: &[String]) -> HashMap<String, usize> {
    let mut index = HashMap::new();
    for (i, header) in headers.iter().enumerate() {
        if !header.is_empty() {
            index.insert(header.clone(), i);
        }
    }
    index
}

/// Coerce one spreadsheet cell. String cells pass through, date-formatted
/// numerics become dates, other numerics stay numbers, booleans render as
/// `true`/`false`; error and empty cells are null.
fn cell_to_value(cell: &Data) -> Option<FieldValue> {
    match cell {
        Data::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(FieldValue::Text(trimmed.to_string()))
            }
        }
        Data::Float(f) => Some(FieldValue::Number(*f)),
        Data::Int(i) => Some(FieldValue::Number(*i as f64)),
        Data::Bool(b) => Some(FieldValue::Text(b.to_string())),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|ndt| FieldValue::Date(ndt.date()))
            .or(Some(FieldValue::Number(dt.as_f64()))),
        Data::DateTimeIso(s) => Some(FieldValue::Text(s.clone())),
        Data::DurationIso(s) => Some(FieldValue::Text(s.clone())),
        Data::Error(_) | Data::Empty => None,
    }
}

/// Apply one insurer's mapping rules to a single raw row. Source columns
/// are looked up by exact header name; a missing or blank cell maps to
/// nothing. Required-ness is not enforced here: one bad row must not abort
/// the whole file.
pub fn map_row(
    table: &RawTable,
    row: &[Option<FieldValue>],
    mappings: &[FieldMapping],
    insurer_id: &str,
    policy_type: &str,
) -> CanonicalRecord {
    let mut record = CanonicalRecord::new(insurer_id, policy_type);
    for mapping in mappings {
        let raw = table
            .header_index
            .get(&mapping.source_field)
            .and_then(|&i| row.get(i).cloned().flatten());
        let Some(value) = raw else { continue };
        match mapping.transform.as_deref().filter(|t| !t.trim().is_empty()) {
            Some(transform) => {
                let transformed = apply_transform(transform, &value.render());
                record.set_field(&mapping.target_field, FieldValue::Text(transformed));
            }
            None => record.set_field(&mapping.target_field, value),
        }
    }
    record
}

/// Map every row of a parsed table into canonical records.
pub fn map_table(
    table: &RawTable,
    mappings: &[FieldMapping],
    insurer_id: &str,
    policy_type: &str,
) -> Vec<CanonicalRecord> {
    let records: Vec<CanonicalRecord> = table
        .rows
        .iter()
        .map(|row| map_row(table, row, mappings, insurer_id, policy_type))
        .collect();
    debug!(
        insurer_id,
        policy_type,
        records = records.len(),
        "mapped rows to canonical records"
    );
    records
}

/// Names of required source columns absent from the table's header row.
/// Consumed by upload-time schema validation for normal files.
pub fn missing_required_columns(table: &RawTable, mappings: &[FieldMapping]) -> Vec<String> {
    mappings
        .iter()
        .filter(|m| m.required && !table.header_index.contains_key(&m.source_field))
        .map(|m| m.source_field.clone())
        .collect()
}
