//! Merged-table persistence: the comma-delimited interchange file between the
//! normalizer and the loader.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use infoda_core::{EnrollmentRecord, TableLayout};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub const CRATE_NAME: &str = "infoda-storage";

/// Spreadsheet tools only detect UTF-8 when the file starts with a byte-order mark.
pub const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone, Serialize)]
pub struct WrittenTable {
    pub path: PathBuf,
    pub rows: usize,
    pub byte_size: usize,
    pub content_hash: String,
}

/// Merged table read back as untyped text. Every row has exactly `columns.len()` cells;
/// missing trailing cells are read as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl MergedTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn missing_columns(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|name| self.column_index(name).is_none())
            .map(|name| name.to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Encode records as a BOM-prefixed, comma-delimited table with the layout's header.
pub fn encode_merged_table(
    layout: TableLayout,
    records: &[EnrollmentRecord],
) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new().from_writer(UTF8_BOM.to_vec());
    writer
        .write_record(layout.columns())
        .context("writing merged table header")?;
    for record in records {
        writer
            .write_record(layout.row(record))
            .with_context(|| format!("writing merged row for student {}", record.student_id))?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow!("flushing merged table buffer: {}", err.error()))
}

pub fn decode_merged_table(bytes: &[u8]) -> anyhow::Result<MergedTable> {
    let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(body);

    let columns = reader
        .headers()
        .context("reading merged table header")?
        .iter()
        .map(str::to_string)
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("reading merged table row {}", index + 1))?;
        let mut row = record.iter().map(str::to_string).collect::<Vec<_>>();
        row.resize(columns.len(), String::new());
        rows.push(row);
    }

    Ok(MergedTable { columns, rows })
}

/// Write the merged table, replacing any previous file through a temp-file rename so
/// readers never observe a partially written table.
#[tracing::instrument(level = "info", skip(path, records), fields(path = %path.display(), rows = records.len()))]
pub async fn write_merged_table(
    path: &Path,
    layout: TableLayout,
    records: &[EnrollmentRecord],
) -> anyhow::Result<WrittenTable> {
    let bytes = encode_merged_table(layout, records)?;
    let content_hash = sha256_hex(&bytes);

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating output directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp table file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp table file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp table file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp table {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(WrittenTable {
        path: path.to_path_buf(),
        rows: records.len(),
        byte_size: bytes.len(),
        content_hash,
    })
}

pub async fn read_merged_table(path: &Path) -> anyhow::Result<MergedTable> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading merged table {}", path.display()))?;
    decode_merged_table(&bytes).with_context(|| format!("parsing merged table {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(student_id: &str, name: &str, section: &str) -> EnrollmentRecord {
        EnrollmentRecord {
            student_id: student_id.to_string(),
            student_name: name.to_string(),
            program_code: Some(3309),
            program_name: "INGENIERIA EN SISTEMAS".to_string(),
            section_code: section.to_string(),
            subject_name: "PROGRAMACIÓN".to_string(),
            source_file: "A.csv".to_string(),
        }
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn encoded_table_starts_with_bom_and_header() {
        let bytes = encode_merged_table(TableLayout::Canonical, &[]).expect("encode");
        assert!(bytes.starts_with(UTF8_BOM));
        let text = String::from_utf8(bytes[UTF8_BOM.len()..].to_vec()).expect("utf8");
        assert_eq!(
            text.trim_end(),
            "matricula,apellidos_nombres,carrera,seccion,archivo_origen"
        );
    }

    #[tokio::test]
    async fn write_then_read_preserves_text_exactly() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out").join("maestro.csv");
        let records = vec![
            record("12345", "Pérez Juan", "503203-4"),
            record("777", "Núñez, Ana \"Anita\"", ""),
        ];

        let written = write_merged_table(&path, TableLayout::Canonical, &records)
            .await
            .expect("write");
        assert_eq!(written.rows, 2);
        assert_eq!(written.content_hash.len(), 64);

        let table = read_merged_table(&path).await.expect("read");
        assert_eq!(table.columns, TableLayout::Canonical.columns());
        let expected = records
            .iter()
            .map(|r| TableLayout::Canonical.row(r))
            .collect::<Vec<_>>();
        assert_eq!(table.rows, expected);
    }

    #[tokio::test]
    async fn rewrite_replaces_previous_table() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("maestro.csv");
        write_merged_table(&path, TableLayout::Canonical, &[record("1", "A", "1-1")])
            .await
            .expect("first write");
        let second = write_merged_table(&path, TableLayout::Extended, &[])
            .await
            .expect("second write");

        let table = read_merged_table(&path).await.expect("read");
        assert!(table.is_empty());
        assert_eq!(table.columns.len(), 7);
        assert_eq!(std::fs::read(&path).expect("bytes").len(), second.byte_size);

        let leftovers = std::fs::read_dir(dir.path())
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn short_rows_are_padded_and_missing_columns_reported() {
        let table = decode_merged_table(b"matricula,carrera\n123\n").expect("decode");
        assert_eq!(table.rows, vec![vec!["123".to_string(), String::new()]]);
        assert_eq!(
            table.missing_columns(&["matricula", "seccion", "asignatura"]),
            vec!["seccion".to_string(), "asignatura".to_string()]
        );
    }
}
