//! Uniform sheet access over the two recognized extract formats.
//!
//! Survey extracts arrive either as spreadsheet workbooks (`.xlsx`/`.xls`,
//! read via calamine) or as delimited single-table extracts (`.csv`/`.tsv`,
//! read via the `csv` crate). Both are exposed through the same
//! [`WorkbookContents`] shape: a delimited extract is a one-sheet workbook
//! whose sheet name is the file stem.
//!
//! A sheet that fails to parse is recorded in
//! [`WorkbookContents::errors`] and never aborts its siblings.

use std::{fs::File, io::BufReader, io::Cursor, path::Path};

use calamine::{Data, Reader, open_workbook_auto};
use chrono::NaiveDateTime;
use encoding_rs::{Encoding, UTF_8};

use crate::error::{PipelineError, Result};

pub const DEFAULT_CSV_DELIMITER: u8 = b',';
pub const DEFAULT_TSV_DELIMITER: u8 = b'\t';

/// One cell as read from a sheet, before any target-domain conversion.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    DateTime(NaiveDateTime),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Canonical display form, used for sample retention and key building.
    pub fn display(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Int(i) => i.to_string(),
            CellValue::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    (*f as i64).to_string()
                } else {
                    f.to_string()
                }
            }
            CellValue::Text(s) => s.trim().to_string(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SheetData {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

#[derive(Debug, Clone)]
pub struct SheetIssue {
    pub sheet: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct WorkbookContents {
    pub sheets: Vec<SheetData>,
    pub errors: Vec<SheetIssue>,
}

pub fn is_workbook_extension(ext: &str) -> bool {
    ext.eq_ignore_ascii_case("xlsx") || ext.eq_ignore_ascii_case("xls")
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("extract")
        .to_string()
}

pub fn resolve_delimiter(path: &Path, provided: Option<u8>) -> u8 {
    provided.unwrap_or_else(|| {
        if extension(path) == "tsv" {
            DEFAULT_TSV_DELIMITER
        } else {
            DEFAULT_CSV_DELIMITER
        }
    })
}

pub fn resolve_encoding(label: Option<&str>) -> Result<&'static Encoding> {
    if let Some(value) = label {
        Encoding::for_label(value.trim().as_bytes())
            .ok_or_else(|| PipelineError::UnknownEncoding(value.to_string()))
    } else {
        Ok(UTF_8)
    }
}

/// Number of sheets in the file without loading any cell data.
///
/// Doubles as the structural parse used by accessibility checks: a file that
/// fails the probe is treated as corrupt.
pub fn sheet_count(path: &Path) -> Result<usize> {
    let ext = extension(path);
    if is_workbook_extension(&ext) {
        let workbook = open_workbook_auto(path)?;
        Ok(workbook.sheet_names().len())
    } else {
        // A delimited extract is structurally sound when its header record
        // parses.
        let file = File::open(path).map_err(|err| PipelineError::io(path, err))?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .delimiter(resolve_delimiter(path, None))
            .from_reader(BufReader::new(file));
        reader.byte_headers()?;
        Ok(1)
    }
}

/// Reads every sheet in the file, capturing per-sheet failures.
pub fn read_workbook(
    path: &Path,
    delimiter: Option<u8>,
    encoding_label: Option<&str>,
) -> Result<WorkbookContents> {
    let ext = extension(path);
    if is_workbook_extension(&ext) {
        read_spreadsheet(path)
    } else {
        read_delimited(path, delimiter, encoding_label)
    }
}

fn read_spreadsheet(path: &Path) -> Result<WorkbookContents> {
    let mut workbook = open_workbook_auto(path)?;
    let names = workbook.sheet_names().to_vec();
    let mut contents = WorkbookContents::default();
    for name in names {
        match workbook.worksheet_range(&name) {
            Ok(range) => contents.sheets.push(range_to_sheet(&name, &range)),
            Err(err) => contents.errors.push(SheetIssue {
                sheet: name.clone(),
                message: err.to_string(),
            }),
        }
    }
    Ok(contents)
}

fn range_to_sheet(name: &str, range: &calamine::Range<Data>) -> SheetData {
    let mut rows_iter = range.rows();
    let headers = rows_iter
        .next()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(idx, cell)| {
                    let text = convert_cell(cell).display();
                    if text.is_empty() {
                        format!("column_{}", idx + 1)
                    } else {
                        text
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    let rows = rows_iter
        .map(|row| row.iter().map(convert_cell).collect())
        .collect();
    SheetData {
        name: name.to_string(),
        headers,
        rows,
    }
}

fn convert_cell(cell: &Data) -> CellValue {
    match cell {
        Data::Empty => CellValue::Empty,
        Data::String(s) => {
            if s.trim().is_empty() {
                CellValue::Empty
            } else {
                CellValue::Text(s.clone())
            }
        }
        Data::Int(i) => CellValue::Int(*i),
        Data::Float(f) => CellValue::Float(*f),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(parsed) => CellValue::DateTime(parsed),
            None => CellValue::Empty,
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::Text(s.clone()),
        // Formula errors (#N/A and friends) carry no recoverable value.
        Data::Error(_) => CellValue::Empty,
    }
}

fn read_delimited(
    path: &Path,
    delimiter: Option<u8>,
    encoding_label: Option<&str>,
) -> Result<WorkbookContents> {
    let sheet_name = file_stem(path);
    let delimiter = resolve_delimiter(path, delimiter);
    let encoding = resolve_encoding(encoding_label)?;

    let bytes = std::fs::read(path).map_err(|err| PipelineError::io(path, err))?;
    let (text, _, had_errors) = encoding.decode(&bytes);
    if had_errors {
        return Ok(WorkbookContents {
            sheets: Vec::new(),
            errors: vec![SheetIssue {
                sheet: sheet_name,
                message: format!("Failed to decode contents as {}", encoding.name()),
            }],
        });
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .double_quote(true)
        .flexible(false)
        .from_reader(Cursor::new(text.into_owned().into_bytes()));

    let mut contents = WorkbookContents::default();
    let headers: Vec<String> = match reader.headers() {
        Ok(headers) => headers
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                if name.trim().is_empty() {
                    format!("column_{}", idx + 1)
                } else {
                    name.trim().to_string()
                }
            })
            .collect(),
        Err(err) => {
            contents.errors.push(SheetIssue {
                sheet: sheet_name,
                message: err.to_string(),
            });
            return Ok(contents);
        }
    };

    let mut rows = Vec::new();
    for (row_idx, record) in reader.records().enumerate() {
        match record {
            Ok(record) => {
                rows.push(
                    record
                        .iter()
                        .map(|field| {
                            let trimmed = field.trim();
                            if trimmed.is_empty() {
                                CellValue::Empty
                            } else {
                                CellValue::Text(trimmed.to_string())
                            }
                        })
                        .collect(),
                );
            }
            Err(err) => {
                contents.errors.push(SheetIssue {
                    sheet: sheet_name.clone(),
                    message: format!("Row {}: {err}", row_idx + 2),
                });
                break;
            }
        }
    }
    contents.sheets.push(SheetData {
        name: sheet_name,
        headers,
        rows,
    });
    Ok(contents)
}
