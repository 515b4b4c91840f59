//! Roster export parsing and directory aggregation into the merged enrollment table.
//!
//! A raw INFODA export is a semicolon-delimited grid with decorative rows on top, a
//! section label such as `(503203-4) PROGRAMACIÓN` somewhere in that preamble, and a
//! per-student table that starts below the row holding the `Corr.` sentinel.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use infoda_core::{dedup_first_wins, EnrollmentRecord, TableLayout};
use infoda_storage::{write_merged_table, WrittenTable, UTF8_BOM};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "infoda-normalize";

/// Positions of the per-student fields inside the data block. These follow the
/// observed export layout and are not detected from the header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnLayout {
    pub student_id: usize,
    pub student_name: usize,
    pub program: usize,
}

impl ColumnLayout {
    pub fn max_index(&self) -> usize {
        self.student_id.max(self.student_name).max(self.program)
    }
}

impl Default for ColumnLayout {
    fn default() -> Self {
        Self {
            student_id: 2,
            student_name: 6,
            program: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterFormat {
    pub delimiter: u8,
    pub header_sentinel: String,
    pub header_scan_limit: usize,
    pub columns: ColumnLayout,
}

impl Default for RosterFormat {
    fn default() -> Self {
        Self {
            delimiter: b';',
            header_sentinel: "Corr.".to_string(),
            header_scan_limit: 200,
            columns: ColumnLayout::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizeConfig {
    pub input_dir: PathBuf,
    pub file_pattern: String,
    pub output_path: PathBuf,
    pub layout: TableLayout,
    pub format: RosterFormat,
}

impl NormalizeConfig {
    pub fn from_env() -> Self {
        let defaults = ColumnLayout::default();
        let column = |key: &str, fallback: usize| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(fallback)
        };
        Self {
            input_dir: std::env::var("INFODA_LISTAS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("infoda_listas")),
            file_pattern: std::env::var("INFODA_FILE_PATTERN").unwrap_or_else(|_| "*.csv".to_string()),
            output_path: std::env::var("CSV_MAESTRO")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("estudiantes_maestro_infoda.csv")),
            layout: std::env::var("INFODA_OUTPUT_LAYOUT")
                .ok()
                .and_then(|v| TableLayout::parse(&v))
                .unwrap_or_default(),
            format: RosterFormat {
                columns: ColumnLayout {
                    student_id: column("INFODA_COL_STUDENT_ID", defaults.student_id),
                    student_name: column("INFODA_COL_STUDENT_NAME", defaults.student_name),
                    program: column("INFODA_COL_PROGRAM", defaults.program),
                },
                ..RosterFormat::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceEncoding {
    Utf8,
    Latin1,
}

/// Decode export bytes as UTF-8 (an optional BOM is dropped), falling back to Latin-1,
/// which accepts any byte sequence.
pub fn decode_roster_bytes(bytes: &[u8]) -> (String, SourceEncoding) {
    let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    match std::str::from_utf8(body) {
        Ok(text) => (text.to_string(), SourceEncoding::Utf8),
        Err(_) => (
            body.iter().map(|&b| char::from(b)).collect(),
            SourceEncoding::Latin1,
        ),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionLabel {
    pub code: String,
    pub subject: String,
}

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {file}: {source}")]
    Csv {
        file: String,
        #[source]
        source: csv::Error,
    },
    #[error("header '{sentinel}' not found in the first {limit} rows of {file}")]
    HeaderNotFound {
        file: String,
        sentinel: String,
        limit: usize,
    },
    #[error("column {column} is outside the {width}-column grid of {file}")]
    ColumnOutOfRange {
        file: String,
        column: usize,
        width: usize,
    },
}

/// Raw export as a grid of trimmed-on-demand text cells. Empty cells stand for absent values.
#[derive(Debug, Clone)]
pub struct RosterGrid {
    pub file_name: String,
    pub encoding: SourceEncoding,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct RosterExtract {
    pub file_name: String,
    pub encoding: SourceEncoding,
    pub section: Option<SectionLabel>,
    pub records: Vec<EnrollmentRecord>,
    /// Data-block rows that were not students or lacked a name or program.
    pub skipped_rows: usize,
}

pub struct RosterParser {
    format: RosterFormat,
    section_marker: Regex,
    student_id: Regex,
    program_prefix: Regex,
}

impl RosterParser {
    pub fn new(format: RosterFormat) -> Result<Self, regex::Error> {
        Ok(Self {
            format,
            section_marker: Regex::new(r"\(\s*([0-9]+-[0-9]+)\s*\)")?,
            student_id: Regex::new(r"^[0-9]+$")?,
            program_prefix: Regex::new(r"^\(([0-9]+)\)\s*")?,
        })
    }

    pub fn parse_grid_text(&self, text: &str) -> Result<Vec<Vec<String>>, csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.format.delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());
        let mut rows = Vec::new();
        for record in reader.records() {
            rows.push(record?.iter().map(str::to_string).collect());
        }
        Ok(rows)
    }

    pub fn read_grid(&self, path: &Path) -> Result<RosterGrid, RosterError> {
        let file_name = file_name_of(path);
        let bytes = fs::read(path).map_err(|source| RosterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let (text, encoding) = decode_roster_bytes(&bytes);
        let rows = self
            .parse_grid_text(&text)
            .map_err(|source| RosterError::Csv {
                file: file_name.clone(),
                source,
            })?;
        Ok(RosterGrid {
            file_name,
            encoding,
            rows,
        })
    }

    /// First cell, scanning column by column, that carries a `(digits-digits)` code.
    pub fn find_section_label(&self, rows: &[Vec<String>]) -> Option<SectionLabel> {
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        for col in 0..width {
            for row in rows {
                let Some(cell) = row.get(col) else {
                    continue;
                };
                if cell.trim().is_empty() {
                    continue;
                }
                if let Some(caps) = self.section_marker.captures(cell) {
                    let code = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
                    let tail = caps.get(0).map(|m| &cell[m.end()..]).unwrap_or_default();
                    return Some(SectionLabel {
                        code: code.to_string(),
                        subject: tail.trim().to_string(),
                    });
                }
            }
        }
        None
    }

    pub fn find_header_row(&self, rows: &[Vec<String>]) -> Option<usize> {
        let sentinel = self.format.header_sentinel.as_str();
        rows.iter()
            .take(self.format.header_scan_limit)
            .position(|row| row.iter().any(|cell| cell.trim() == sentinel))
    }

    /// Split `(3309) INGENIERIA EN SISTEMAS` into its code and name.
    pub fn split_program(&self, cell: &str) -> (Option<i32>, String) {
        let cell = cell.trim();
        match self.program_prefix.captures(cell) {
            Some(caps) => {
                let code = caps.get(1).and_then(|m| m.as_str().parse().ok());
                let rest = caps.get(0).map(|m| &cell[m.end()..]).unwrap_or(cell);
                (code, rest.trim().to_string())
            }
            None => (None, cell.to_string()),
        }
    }

    pub fn extract(&self, grid: &RosterGrid) -> Result<RosterExtract, RosterError> {
        let section = self.find_section_label(&grid.rows);
        let header = self
            .find_header_row(&grid.rows)
            .ok_or_else(|| RosterError::HeaderNotFound {
                file: grid.file_name.clone(),
                sentinel: self.format.header_sentinel.clone(),
                limit: self.format.header_scan_limit,
            })?;

        let (section_code, subject_name) = section
            .as_ref()
            .map(|s| (s.code.clone(), s.subject.clone()))
            .unwrap_or_default();
        let columns = self.format.columns;
        let width = grid.rows[header..].iter().map(Vec::len).max().unwrap_or(0);
        if columns.max_index() >= width {
            return Err(RosterError::ColumnOutOfRange {
                file: grid.file_name.clone(),
                column: columns.max_index(),
                width,
            });
        }

        let mut records = Vec::new();
        let mut skipped_rows = 0usize;
        for row in grid.rows.iter().skip(header + 1) {
            let student_id = cell_at(row, columns.student_id);
            if !self.student_id.is_match(student_id) {
                skipped_rows += 1;
                continue;
            }
            let student_name = cell_at(row, columns.student_name);
            let (program_code, program_name) = self.split_program(cell_at(row, columns.program));
            if student_name.is_empty() || program_name.is_empty() {
                skipped_rows += 1;
                continue;
            }
            records.push(EnrollmentRecord {
                student_id: student_id.to_string(),
                student_name: student_name.to_string(),
                program_code,
                program_name,
                section_code: section_code.clone(),
                subject_name: subject_name.clone(),
                source_file: grid.file_name.clone(),
            });
        }

        Ok(RosterExtract {
            file_name: grid.file_name.clone(),
            encoding: grid.encoding,
            section,
            records,
            skipped_rows,
        })
    }

    pub fn parse_file(&self, path: &Path) -> Result<RosterExtract, RosterError> {
        let grid = self.read_grid(path)?;
        self.extract(&grid)
    }
}

fn cell_at(row: &[String], index: usize) -> &str {
    row.get(index).map(|c| c.trim()).unwrap_or_default()
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("input directory does not exist: {}", .0.display())]
    MissingInputDir(PathBuf),
    #[error("invalid roster file pattern {pattern}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("no roster file could be normalized in {} ({failed} failed)", .dir.display())]
    NoValidFiles { dir: PathBuf, failed: usize },
    #[error("compiling roster patterns: {0}")]
    Regex(#[from] regex::Error),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub file_name: String,
    pub encoding: SourceEncoding,
    pub section_code: String,
    pub records: usize,
    pub skipped_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub file_name: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub files: Vec<FileOutcome>,
    pub failures: Vec<FileFailure>,
    pub records: Vec<EnrollmentRecord>,
    pub duplicates_dropped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NormalizeSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files: Vec<FileOutcome>,
    pub failures: Vec<FileFailure>,
    pub records: usize,
    pub duplicates_dropped: usize,
    pub output: WrittenTable,
}

/// Roster files in `dir` matching `pattern`, ordered by file name.
pub fn discover_roster_files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, NormalizeError> {
    if !dir.is_dir() {
        return Err(NormalizeError::MissingInputDir(dir.to_path_buf()));
    }
    let full_pattern = format!(
        "{}/{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        pattern
    );
    let entries = glob::glob(&full_pattern).map_err(|source| NormalizeError::Pattern {
        pattern: full_pattern.clone(),
        source,
    })?;
    let mut files = readable_matches(
        entries.map(|entry| entry.map_err(|err| (err.path().to_path_buf(), err.into_error()))),
    );
    files.sort_by_key(|path| file_name_of(path));
    Ok(files)
}

/// Regular files among the matches. Entries that cannot be read are logged and skipped.
fn readable_matches<I>(entries: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = Result<PathBuf, (PathBuf, std::io::Error)>>,
{
    let mut files = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(_) => {}
            Err((path, error)) => {
                warn!(path = %path.display(), %error, "unreadable roster path skipped")
            }
        }
    }
    files
}

/// Parse every file, concatenate in the given order and drop repeated
/// `(student_id, section_code)` pairs. Per-file failures are recorded, never raised.
pub fn merge_rosters(parser: &RosterParser, paths: &[PathBuf]) -> MergeOutcome {
    let mut files = Vec::new();
    let mut failures = Vec::new();
    let mut records = Vec::new();

    for path in paths {
        let file_name = file_name_of(path);
        let span = info_span!("roster_file", file = %file_name);
        let _guard = span.enter();

        match parser.parse_file(path) {
            Ok(extract) => {
                let section_code = extract
                    .section
                    .as_ref()
                    .map(|s| s.code.clone())
                    .unwrap_or_default();
                if section_code.is_empty() {
                    warn!("no section label found; records keep an empty section");
                }
                info!(
                    records = extract.records.len(),
                    skipped = extract.skipped_rows,
                    section = %section_code,
                    encoding = ?extract.encoding,
                    "roster normalized"
                );
                files.push(FileOutcome {
                    file_name,
                    encoding: extract.encoding,
                    section_code,
                    records: extract.records.len(),
                    skipped_rows: extract.skipped_rows,
                });
                records.extend(extract.records);
            }
            Err(err) => {
                warn!(error = %err, "roster skipped");
                failures.push(FileFailure {
                    file_name,
                    message: err.to_string(),
                });
            }
        }
    }

    let (records, duplicates_dropped) = dedup_first_wins(records, EnrollmentRecord::enrollment_key);
    MergeOutcome {
        files,
        failures,
        records,
        duplicates_dropped,
    }
}

pub fn normalize_directory(config: &NormalizeConfig) -> Result<MergeOutcome, NormalizeError> {
    let parser = RosterParser::new(config.format.clone())?;
    let paths = discover_roster_files(&config.input_dir, &config.file_pattern)?;
    let outcome = merge_rosters(&parser, &paths);
    if outcome.files.is_empty() {
        return Err(NormalizeError::NoValidFiles {
            dir: config.input_dir.clone(),
            failed: outcome.failures.len(),
        });
    }
    Ok(outcome)
}

pub async fn run_normalize(config: &NormalizeConfig) -> Result<NormalizeSummary, NormalizeError> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();
    info!(%run_id, input_dir = %config.input_dir.display(), "normalize run started");

    let outcome = normalize_directory(config)?;
    let output = write_merged_table(&config.output_path, config.layout, &outcome.records).await?;

    info!(
        %run_id,
        files = outcome.files.len(),
        failed = outcome.failures.len(),
        rows = output.rows,
        duplicates = outcome.duplicates_dropped,
        "merged table written"
    );

    Ok(NormalizeSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        files: outcome.files,
        failures: outcome.failures,
        records: output.rows,
        duplicates_dropped: outcome.duplicates_dropped,
        output,
    })
}

pub async fn run_normalize_from_env() -> Result<NormalizeSummary, NormalizeError> {
    run_normalize(&NormalizeConfig::from_env()).await
}
