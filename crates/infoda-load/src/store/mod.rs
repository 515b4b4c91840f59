//! Storage seam for the load sequence. The Postgres store runs inside one transaction;
//! the memory store mirrors its conflict rules for dry runs and tests.

mod memory;
mod postgres;

use async_trait::async_trait;
use infoda_core::{EnrollmentFact, ProgramRow, SectionRow, SourceFileRow};

use crate::{LoadError, ProgramKey, SectionKey};

pub use memory::MemoryStore;
pub use postgres::{
    program_from_row, section_from_row, validate_schema_name, PgEnrollmentStore, MAX_BATCH_SIZE,
};

/// Full contents of the three lookup dimensions, read back after the upserts.
#[derive(Debug, Clone, Default)]
pub struct DimensionSnapshot {
    pub programs: Vec<ProgramRow>,
    pub sections: Vec<SectionRow>,
    pub source_files: Vec<SourceFileRow>,
}

#[async_trait]
pub trait EnrollmentStore: Send {
    /// On a name conflict the stored code is kept; a missing code is filled in.
    async fn upsert_programs(&mut self, programs: &[ProgramKey]) -> Result<(), LoadError>;

    /// On a code conflict the subject is overwritten.
    async fn upsert_sections(&mut self, sections: &[SectionKey]) -> Result<(), LoadError>;

    async fn insert_source_files(&mut self, names: &[String]) -> Result<(), LoadError>;

    /// Rows come back in id order.
    async fn fetch_dimensions(&mut self) -> Result<DimensionSnapshot, LoadError>;

    /// Returns the number of rows actually inserted; `(student_id, section)` conflicts are skipped.
    async fn insert_enrollments(&mut self, facts: &[EnrollmentFact]) -> Result<u64, LoadError>;
}
