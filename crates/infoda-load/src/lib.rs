//! Loads the merged table into the relational store: three lookup dimensions
//! upserted first, then enrollment facts resolved against them, all in one transaction.

pub mod store;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use infoda_core::{
    dedup_first_wins, EnrollmentFact, EnrollmentRecord, COL_PROGRAM_CODE, COL_PROGRAM_NAME,
    COL_SECTION, COL_SOURCE_FILE, COL_STUDENT_ID, COL_STUDENT_NAME, COL_SUBJECT,
};
use infoda_storage::{read_merged_table, MergedTable};
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use store::{
    validate_schema_name, DimensionSnapshot, EnrollmentStore, MemoryStore, PgEnrollmentStore,
    MAX_BATCH_SIZE,
};

pub const CRATE_NAME: &str = "infoda-load";

pub const REQUIRED_COLUMNS: [&str; 7] = [
    COL_SECTION,
    COL_SUBJECT,
    COL_STUDENT_ID,
    COL_STUDENT_NAME,
    COL_PROGRAM_CODE,
    COL_PROGRAM_NAME,
    COL_SOURCE_FILE,
];

pub const DEFAULT_BATCH_SIZE: usize = 5000;

const UNRESOLVED_SAMPLE: usize = 5;

#[derive(Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub schema: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "infoda_estudiantes".to_string(),
            schema: "infoda".to_string(),
        }
    }
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("schema", &self.schema)
            .finish()
    }
}

impl DbConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("PGHOST").unwrap_or(defaults.host),
            port: std::env::var("PGPORT")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.port),
            user: std::env::var("PGUSER").unwrap_or(defaults.user),
            password: std::env::var("PGPASSWORD").unwrap_or(defaults.password),
            database: std::env::var("PGDATABASE").unwrap_or(defaults.database),
            schema: std::env::var("INFODA_SCHEMA").unwrap_or(defaults.schema),
        }
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.database);
        if self.password.is_empty() {
            options
        } else {
            options.password(&self.password)
        }
    }

    /// One connection is enough: the load runs a single transaction.
    pub async fn connect(&self, max_connections: u32) -> Result<PgPool, LoadError> {
        PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(self.connect_options())
            .await
            .map_err(|source| LoadError::Database {
                stage: "connect",
                source,
            })
    }
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub merged_table: PathBuf,
    pub db: DbConfig,
    pub batch_size: usize,
}

impl LoaderConfig {
    pub fn from_env() -> Self {
        Self {
            merged_table: std::env::var("CSV_MAESTRO")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("estudiantes_maestro_infoda.csv")),
            db: DbConfig::from_env(),
            batch_size: batch_size_from(std::env::var("INFODA_LOAD_BATCH_SIZE").ok().as_deref()),
        }
    }
}

/// Unset, unparsable or zero falls back to the default; larger values are capped at
/// [`MAX_BATCH_SIZE`].
pub fn batch_size_from(value: Option<&str>) -> usize {
    value
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|size| *size > 0)
        .map(|size| size.min(MAX_BATCH_SIZE))
        .unwrap_or(DEFAULT_BATCH_SIZE)
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(
        "merged table {} is missing required columns {missing:?} (present: {present:?})",
        .path.display()
    )]
    MissingColumns {
        path: PathBuf,
        missing: Vec<String>,
        present: Vec<String>,
    },
    #[error("program code {value:?} for student {student_id} is not an integer")]
    InvalidProgramCode { value: String, student_id: String },
    #[error("invalid schema name {0:?}")]
    InvalidSchema(String),
    #[error("database error while trying to {stage}")]
    Database {
        stage: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Table(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default)]
pub struct CleanedRows {
    pub records: Vec<EnrollmentRecord>,
    pub rows_read: usize,
    pub dropped_incomplete: usize,
    pub dropped_duplicates: usize,
}

/// Validate the header, trim every cell, drop incomplete rows and repeated
/// `(student_id, section)` pairs, then parse program codes of the rows that remain.
pub fn clean_rows(table: &MergedTable, path: &Path) -> Result<CleanedRows, LoadError> {
    let missing = table.missing_columns(&REQUIRED_COLUMNS);
    if !missing.is_empty() {
        return Err(LoadError::MissingColumns {
            path: path.to_path_buf(),
            missing,
            present: table.columns.clone(),
        });
    }

    let index = |name: &str| table.column_index(name).unwrap_or_default();
    let (i_id, i_name, i_code, i_program, i_section, i_subject, i_file) = (
        index(COL_STUDENT_ID),
        index(COL_STUDENT_NAME),
        index(COL_PROGRAM_CODE),
        index(COL_PROGRAM_NAME),
        index(COL_SECTION),
        index(COL_SUBJECT),
        index(COL_SOURCE_FILE),
    );
    let cell = |row: &[String], i: usize| row.get(i).map(|v| v.trim().to_string()).unwrap_or_default();

    let mut complete = Vec::with_capacity(table.len());
    for row in &table.rows {
        let row = row.as_slice();
        let trimmed = (
            cell(row, i_id),
            cell(row, i_name),
            cell(row, i_code),
            cell(row, i_program),
            cell(row, i_section),
            cell(row, i_subject),
            cell(row, i_file),
        );
        if trimmed.0.is_empty() || trimmed.1.is_empty() || trimmed.3.is_empty() || trimmed.4.is_empty() {
            continue;
        }
        complete.push(trimmed);
    }
    let dropped_incomplete = table.len() - complete.len();

    let (kept, dropped_duplicates) =
        dedup_first_wins(complete, |row| (row.0.clone(), row.4.clone()));

    let mut records = Vec::with_capacity(kept.len());
    for (student_id, student_name, code, program_name, section_code, subject_name, source_file) in kept {
        let program_code = if code.is_empty() {
            None
        } else {
            Some(code.parse::<i32>().map_err(|_| LoadError::InvalidProgramCode {
                value: code.clone(),
                student_id: student_id.clone(),
            })?)
        };
        records.push(EnrollmentRecord {
            student_id,
            student_name,
            program_code,
            program_name,
            section_code,
            subject_name,
            source_file,
        });
    }

    Ok(CleanedRows {
        records,
        rows_read: table.len(),
        dropped_incomplete,
        dropped_duplicates,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgramKey {
    pub code: Option<i32>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionKey {
    pub code: String,
    pub subject: String,
}

/// Dimension rows to upsert, one entry per natural key in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DimensionPlan {
    pub programs: Vec<ProgramKey>,
    pub sections: Vec<SectionKey>,
    pub source_files: Vec<String>,
}

/// Programs keep the first non-empty code seen for a name; sections keep the last
/// subject seen for a code; source files are sorted and distinct.
pub fn plan_dimensions(records: &[EnrollmentRecord]) -> DimensionPlan {
    let mut programs: Vec<ProgramKey> = Vec::new();
    let mut program_at: HashMap<&str, usize> = HashMap::new();
    let mut sections: Vec<SectionKey> = Vec::new();
    let mut section_at: HashMap<&str, usize> = HashMap::new();
    let mut source_files = BTreeSet::new();

    for record in records {
        match program_at.get(record.program_name.as_str()) {
            Some(&i) => {
                let entry = &mut programs[i];
                entry.code = entry.code.or(record.program_code);
            }
            None => {
                program_at.insert(&record.program_name, programs.len());
                programs.push(ProgramKey {
                    code: record.program_code,
                    name: record.program_name.clone(),
                });
            }
        }

        match section_at.get(record.section_code.as_str()) {
            Some(&i) => sections[i].subject = record.subject_name.clone(),
            None => {
                section_at.insert(&record.section_code, sections.len());
                sections.push(SectionKey {
                    code: record.section_code.clone(),
                    subject: record.subject_name.clone(),
                });
            }
        }

        if !record.source_file.is_empty() {
            source_files.insert(record.source_file.clone());
        }
    }

    DimensionPlan {
        programs,
        sections,
        source_files: source_files.into_iter().collect(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct LookupMaps {
    pub program_by_name: HashMap<String, i32>,
    pub program_by_code: HashMap<i32, i32>,
    pub section_by_code: HashMap<String, i32>,
    pub source_file_by_name: HashMap<String, i32>,
}

impl LookupMaps {
    /// A code shared by several programs resolves to the oldest row.
    pub fn from_snapshot(snapshot: &DimensionSnapshot) -> Self {
        let mut maps = Self::default();
        for program in &snapshot.programs {
            maps.program_by_name.insert(program.name.clone(), program.id);
            if let Some(code) = program.code {
                maps.program_by_code.entry(code).or_insert(program.id);
            }
        }
        for section in &snapshot.sections {
            maps.section_by_code.insert(section.code.clone(), section.id);
        }
        for file in &snapshot.source_files {
            maps.source_file_by_name.insert(file.name.clone(), file.id);
        }
        maps
    }

    /// By code when the record has one, falling back to the name on a miss.
    pub fn resolve_program(&self, record: &EnrollmentRecord) -> Option<i32> {
        record
            .program_code
            .and_then(|code| self.program_by_code.get(&code).copied())
            .or_else(|| self.program_by_name.get(&record.program_name).copied())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedRow {
    pub student_id: String,
    pub section_code: String,
    pub missing: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct FactPlan {
    pub facts: Vec<EnrollmentFact>,
    pub unresolved: Vec<UnresolvedRow>,
}

pub fn resolve_facts(records: &[EnrollmentRecord], maps: &LookupMaps) -> FactPlan {
    let mut plan = FactPlan::default();
    for record in records {
        let program_id = maps.resolve_program(record);
        let section_id = maps.section_by_code.get(&record.section_code).copied();
        match (program_id, section_id) {
            (Some(program_id), Some(section_id)) => plan.facts.push(EnrollmentFact {
                student_id: record.student_id.clone(),
                student_name: record.student_name.clone(),
                program_id,
                section_id,
                source_file_id: maps.source_file_by_name.get(&record.source_file).copied(),
            }),
            (program_id, _) => plan.unresolved.push(UnresolvedRow {
                student_id: record.student_id.clone(),
                section_code: record.section_code.clone(),
                missing: if program_id.is_none() { "program" } else { "section" },
            }),
        }
    }
    plan
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadOutcome {
    pub programs: usize,
    pub sections: usize,
    pub source_files: usize,
    pub attempted: usize,
    pub unresolved: usize,
    pub inserted: u64,
}

/// The full load sequence against any store. Transaction handling belongs to the caller.
pub async fn load_records<S>(
    store: &mut S,
    records: &[EnrollmentRecord],
) -> Result<LoadOutcome, LoadError>
where
    S: EnrollmentStore + ?Sized,
{
    let plan = plan_dimensions(records);
    store.upsert_programs(&plan.programs).await?;
    store.upsert_sections(&plan.sections).await?;
    store.insert_source_files(&plan.source_files).await?;
    info!(
        programs = plan.programs.len(),
        sections = plan.sections.len(),
        source_files = plan.source_files.len(),
        "dimensions upserted"
    );

    let snapshot = store.fetch_dimensions().await?;
    let maps = LookupMaps::from_snapshot(&snapshot);
    let facts = resolve_facts(records, &maps);
    if !facts.unresolved.is_empty() {
        let sample = facts
            .unresolved
            .iter()
            .take(UNRESOLVED_SAMPLE)
            .collect::<Vec<_>>();
        warn!(count = facts.unresolved.len(), ?sample, "rows without program or section key skipped");
    }

    let inserted = store.insert_enrollments(&facts.facts).await?;
    info!(attempted = facts.facts.len(), inserted, "enrollments inserted");

    Ok(LoadOutcome {
        programs: plan.programs.len(),
        sections: plan.sections.len(),
        source_files: plan.source_files.len(),
        attempted: facts.facts.len(),
        unresolved: facts.unresolved.len(),
        inserted,
    })
}

/// Runs [`load_records`] inside one transaction: committed on success, rolled back
/// on any failure before the error is returned.
pub async fn load_in_transaction(
    pool: &PgPool,
    schema: &str,
    batch_size: usize,
    records: &[EnrollmentRecord],
) -> Result<LoadOutcome, LoadError> {
    let mut store = PgEnrollmentStore::begin(pool, schema, batch_size).await?;
    match load_records(&mut store, records).await {
        Ok(outcome) => {
            store.commit().await?;
            Ok(outcome)
        }
        Err(err) => {
            warn!(error = %err, "load failed; rolling back");
            if let Err(rollback_err) = store.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub merged_table: PathBuf,
    pub rows_read: usize,
    pub rows_kept: usize,
    pub dropped_incomplete: usize,
    pub dropped_duplicates: usize,
    pub programs: usize,
    pub sections: usize,
    pub source_files: usize,
    /// Headline count: facts sent to the store, before conflict skipping.
    pub attempted: usize,
    pub unresolved: usize,
    pub inserted: u64,
}

impl LoadSummary {
    fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        config: &LoaderConfig,
        dry_run: bool,
        cleaned: &CleanedRows,
        outcome: LoadOutcome,
    ) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run,
            merged_table: config.merged_table.clone(),
            rows_read: cleaned.rows_read,
            rows_kept: cleaned.records.len(),
            dropped_incomplete: cleaned.dropped_incomplete,
            dropped_duplicates: cleaned.dropped_duplicates,
            programs: outcome.programs,
            sections: outcome.sections,
            source_files: outcome.source_files,
            attempted: outcome.attempted,
            unresolved: outcome.unresolved,
            inserted: outcome.inserted,
        }
    }
}

pub async fn read_and_clean(path: &Path) -> Result<CleanedRows, LoadError> {
    let table = read_merged_table(path).await?;
    let cleaned = clean_rows(&table, path)?;
    info!(
        rows_read = cleaned.rows_read,
        rows_kept = cleaned.records.len(),
        dropped_incomplete = cleaned.dropped_incomplete,
        dropped_duplicates = cleaned.dropped_duplicates,
        "merged table cleaned"
    );
    Ok(cleaned)
}

pub async fn run_load(config: &LoaderConfig) -> Result<LoadSummary, LoadError> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();
    let span = info_span!("load", %run_id, dry_run = false);

    async {
        validate_schema_name(&config.db.schema)?;
        let cleaned = read_and_clean(&config.merged_table).await?;

        let pool = config.db.connect(1).await?;
        let result = load_in_transaction(
            &pool,
            &config.db.schema,
            config.batch_size,
            &cleaned.records,
        )
        .await;
        pool.close().await;
        let outcome = result?;

        Ok::<_, LoadError>(LoadSummary::new(
            run_id, started_at, config, false, &cleaned, outcome,
        ))
    }
    .instrument(span)
    .await
}

/// Same sequence against an empty [`MemoryStore`]; PostgreSQL is never contacted.
pub async fn run_dry_load(config: &LoaderConfig) -> Result<LoadSummary, LoadError> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();
    let span = info_span!("load", %run_id, dry_run = true);

    async {
        let cleaned = read_and_clean(&config.merged_table).await?;
        let mut store = MemoryStore::new();
        let outcome = load_records(&mut store, &cleaned.records).await?;
        Ok::<_, LoadError>(LoadSummary::new(
            run_id, started_at, config, true, &cleaned, outcome,
        ))
    }
    .instrument(span)
    .await
}

pub async fn run_load_from_env() -> Result<LoadSummary, LoadError> {
    run_load(&LoaderConfig::from_env()).await
}
