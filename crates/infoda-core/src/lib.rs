//! Canonical enrollment model shared by the normalizer, the loader and the query API.

use std::collections::HashSet;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "infoda-core";

pub const COL_STUDENT_ID: &str = "matricula";
pub const COL_STUDENT_NAME: &str = "apellidos_nombres";
pub const COL_PROGRAM_CODE: &str = "codigo_carrera";
pub const COL_PROGRAM_NAME: &str = "carrera";
pub const COL_SECTION: &str = "seccion";
pub const COL_SUBJECT: &str = "asignatura";
pub const COL_SOURCE_FILE: &str = "archivo_origen";

/// Header of the merged table as produced by the normalizer.
pub const CANONICAL_COLUMNS: [&str; 5] = [
    COL_STUDENT_ID,
    COL_STUDENT_NAME,
    COL_PROGRAM_NAME,
    COL_SECTION,
    COL_SOURCE_FILE,
];

/// Canonical header plus the program code and subject columns the loader requires.
pub const EXTENDED_COLUMNS: [&str; 7] = [
    COL_STUDENT_ID,
    COL_STUDENT_NAME,
    COL_PROGRAM_CODE,
    COL_PROGRAM_NAME,
    COL_SECTION,
    COL_SUBJECT,
    COL_SOURCE_FILE,
];

/// One student enrolled in one section, as read from one roster export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub student_id: String,
    pub student_name: String,
    pub program_code: Option<i32>,
    pub program_name: String,
    /// Empty when the export carried no recognizable section label.
    pub section_code: String,
    pub subject_name: String,
    pub source_file: String,
}

impl EnrollmentRecord {
    pub fn enrollment_key(&self) -> (String, String) {
        (self.student_id.clone(), self.section_code.clone())
    }
}

/// Column set written to the merged table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableLayout {
    #[default]
    Canonical,
    Extended,
}

impl TableLayout {
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            TableLayout::Canonical => &CANONICAL_COLUMNS,
            TableLayout::Extended => &EXTENDED_COLUMNS,
        }
    }

    pub fn row(&self, record: &EnrollmentRecord) -> Vec<String> {
        self.columns()
            .iter()
            .map(|column| match *column {
                COL_STUDENT_ID => record.student_id.clone(),
                COL_STUDENT_NAME => record.student_name.clone(),
                COL_PROGRAM_CODE => record
                    .program_code
                    .map(|code| code.to_string())
                    .unwrap_or_default(),
                COL_PROGRAM_NAME => record.program_name.clone(),
                COL_SECTION => record.section_code.clone(),
                COL_SUBJECT => record.subject_name.clone(),
                _ => record.source_file.clone(),
            })
            .collect()
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "canonical" => Some(TableLayout::Canonical),
            "extended" => Some(TableLayout::Extended),
            _ => None,
        }
    }
}

/// Program dimension row as stored (`carrera`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramRow {
    pub id: i32,
    pub code: Option<i32>,
    pub name: String,
}

/// Section dimension row as stored (`seccion`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionRow {
    pub id: i32,
    pub code: String,
    pub subject: String,
}

/// Source-file dimension row as stored (`archivo_origen`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFileRow {
    pub id: i32,
    pub name: String,
}

/// Enrollment fact with resolved surrogate keys (`estudiantes`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentFact {
    pub student_id: String,
    pub student_name: String,
    pub program_id: i32,
    pub section_id: i32,
    pub source_file_id: Option<i32>,
}

/// Keeps the first item for every key, preserving order. Returns the kept items and the
/// number of dropped duplicates.
pub fn dedup_first_wins<T, K, F>(items: Vec<T>, key: F) -> (Vec<T>, usize)
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut seen = HashSet::with_capacity(items.len());
    let total = items.len();
    let kept = items
        .into_iter()
        .filter(|item| seen.insert(key(item)))
        .collect::<Vec<_>>();
    let dropped = total - kept.len();
    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(student_id: &str, section_code: &str, source_file: &str) -> EnrollmentRecord {
        EnrollmentRecord {
            student_id: student_id.to_string(),
            student_name: "Pérez Juan".to_string(),
            program_code: Some(3309),
            program_name: "INGENIERIA EN SISTEMAS".to_string(),
            section_code: section_code.to_string(),
            subject_name: "PROGRAMACIÓN".to_string(),
            source_file: source_file.to_string(),
        }
    }

    #[test]
    fn dedup_keeps_first_occurrence_in_order() {
        let items = vec![
            record("1", "503203-4", "A.csv"),
            record("2", "503203-4", "A.csv"),
            record("1", "503203-4", "B.csv"),
            record("1", "503203-5", "B.csv"),
        ];
        let (kept, dropped) = dedup_first_wins(items, EnrollmentRecord::enrollment_key);
        assert_eq!(dropped, 1);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].source_file, "A.csv");
        assert_eq!(kept[2].section_code, "503203-5");
    }

    #[test]
    fn canonical_row_follows_header_order() {
        let row = TableLayout::Canonical.row(&record("12345", "503203-4", "A.csv"));
        assert_eq!(
            row,
            vec!["12345", "Pérez Juan", "INGENIERIA EN SISTEMAS", "503203-4", "A.csv"]
        );
    }

    #[test]
    fn extended_row_renders_missing_code_as_empty() {
        let mut rec = record("12345", "503203-4", "A.csv");
        rec.program_code = None;
        let row = TableLayout::Extended.row(&rec);
        assert_eq!(row.len(), EXTENDED_COLUMNS.len());
        assert_eq!(row[2], "");
        assert_eq!(row[5], "PROGRAMACIÓN");
    }

    #[test]
    fn layout_parse_is_case_insensitive() {
        assert_eq!(TableLayout::parse(" Extended "), Some(TableLayout::Extended));
        assert_eq!(TableLayout::parse("canonical"), Some(TableLayout::Canonical));
        assert_eq!(TableLayout::parse("wide"), None);
    }
}
