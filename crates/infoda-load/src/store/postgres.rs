use async_trait::async_trait;
use infoda_core::{EnrollmentFact, ProgramRow, SectionRow, SourceFileRow};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};

use super::{DimensionSnapshot, EnrollmentStore};
use crate::{LoadError, ProgramKey, SectionKey};

fn db_error(stage: &'static str) -> impl FnOnce(sqlx::Error) -> LoadError {
    move |source| LoadError::Database { stage, source }
}

/// Schema names are interpolated into SQL text, so only plain identifiers are accepted.
pub fn validate_schema_name(schema: &str) -> Result<(), LoadError> {
    let mut chars = schema.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(LoadError::InvalidSchema(schema.to_string()))
    }
}

/// Largest chunk that keeps a fact insert (five binds per row) under the
/// 65535 bind-parameter limit of the Postgres protocol.
pub const MAX_BATCH_SIZE: usize = u16::MAX as usize / 5;

/// Writes through a single open transaction. Dropping the store without calling
/// [`PgEnrollmentStore::commit`] rolls everything back.
pub struct PgEnrollmentStore {
    tx: Transaction<'static, Postgres>,
    schema: String,
    batch_size: usize,
}

impl PgEnrollmentStore {
    pub async fn begin(pool: &PgPool, schema: &str, batch_size: usize) -> Result<Self, LoadError> {
        validate_schema_name(schema)?;
        let tx = pool.begin().await.map_err(db_error("begin transaction"))?;
        Ok(Self {
            tx,
            schema: schema.to_string(),
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
        })
    }

    pub async fn commit(self) -> Result<(), LoadError> {
        self.tx.commit().await.map_err(db_error("commit"))
    }

    pub async fn rollback(self) -> Result<(), LoadError> {
        self.tx.rollback().await.map_err(db_error("rollback"))
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }
}

pub fn program_from_row(row: &PgRow) -> Result<ProgramRow, sqlx::Error> {
    Ok(ProgramRow {
        id: row.try_get("id_carrera")?,
        code: row.try_get("codigo_carrera")?,
        name: row.try_get("nombre_carrera")?,
    })
}

pub fn section_from_row(row: &PgRow) -> Result<SectionRow, sqlx::Error> {
    let subject: Option<String> = row.try_get("nombre_asignatura")?;
    Ok(SectionRow {
        id: row.try_get("id_seccion")?,
        code: row.try_get("codigo_seccion")?,
        subject: subject.unwrap_or_default(),
    })
}

fn source_file_from_row(row: &PgRow) -> Result<SourceFileRow, sqlx::Error> {
    Ok(SourceFileRow {
        id: row.try_get("id_archivo")?,
        name: row.try_get("nombre_archivo")?,
    })
}

/// Stored codes win: a missing code is filled in, an existing one is never replaced.
pub fn program_upsert(schema: &str, chunk: &[ProgramKey]) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {schema}.carrera AS c (codigo_carrera, nombre_carrera) "
    ));
    qb.push_values(chunk, |mut row, program| {
        row.push_bind(program.code).push_bind(program.name.clone());
    });
    qb.push(
        " ON CONFLICT (nombre_carrera) DO UPDATE \
         SET codigo_carrera = COALESCE(c.codigo_carrera, EXCLUDED.codigo_carrera)",
    );
    qb
}

pub fn section_upsert(schema: &str, chunk: &[SectionKey]) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {schema}.seccion (codigo_seccion, nombre_asignatura) "
    ));
    qb.push_values(chunk, |mut row, section| {
        row.push_bind(section.code.clone())
            .push_bind(section.subject.clone());
    });
    qb.push(
        " ON CONFLICT (codigo_seccion) DO UPDATE \
         SET nombre_asignatura = EXCLUDED.nombre_asignatura",
    );
    qb
}

pub fn source_file_insert(schema: &str, chunk: &[String]) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {schema}.archivo_origen (nombre_archivo) "
    ));
    qb.push_values(chunk, |mut row, name| {
        row.push_bind(name.clone());
    });
    qb.push(" ON CONFLICT (nombre_archivo) DO NOTHING");
    qb
}

pub fn enrollment_insert(
    schema: &str,
    chunk: &[EnrollmentFact],
) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {schema}.estudiantes \
         (matricula, apellidos_nombres, id_carrera, id_seccion, id_archivo) "
    ));
    qb.push_values(chunk, |mut row, fact| {
        row.push_bind(fact.student_id.clone())
            .push_bind(fact.student_name.clone())
            .push_bind(fact.program_id)
            .push_bind(fact.section_id)
            .push_bind(fact.source_file_id);
    });
    qb.push(" ON CONFLICT (matricula, id_seccion) DO NOTHING");
    qb
}

#[async_trait]
impl EnrollmentStore for PgEnrollmentStore {
    async fn upsert_programs(&mut self, programs: &[ProgramKey]) -> Result<(), LoadError> {
        for chunk in programs.chunks(self.batch_size) {
            program_upsert(&self.schema, chunk)
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(db_error("upsert programs"))?;
        }
        Ok(())
    }

    async fn upsert_sections(&mut self, sections: &[SectionKey]) -> Result<(), LoadError> {
        for chunk in sections.chunks(self.batch_size) {
            section_upsert(&self.schema, chunk)
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(db_error("upsert sections"))?;
        }
        Ok(())
    }

    async fn insert_source_files(&mut self, names: &[String]) -> Result<(), LoadError> {
        for chunk in names.chunks(self.batch_size) {
            source_file_insert(&self.schema, chunk)
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(db_error("insert source files"))?;
        }
        Ok(())
    }

    async fn fetch_dimensions(&mut self) -> Result<DimensionSnapshot, LoadError> {
        let sql = format!(
            "SELECT id_carrera, codigo_carrera, nombre_carrera FROM {} ORDER BY id_carrera",
            self.table("carrera")
        );
        let programs = sqlx::query(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .and_then(|rows| rows.iter().map(program_from_row).collect())
            .map_err(db_error("read programs"))?;

        let sql = format!(
            "SELECT id_seccion, codigo_seccion, nombre_asignatura FROM {} ORDER BY id_seccion",
            self.table("seccion")
        );
        let sections = sqlx::query(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .and_then(|rows| rows.iter().map(section_from_row).collect())
            .map_err(db_error("read sections"))?;

        let sql = format!(
            "SELECT id_archivo, nombre_archivo FROM {} ORDER BY id_archivo",
            self.table("archivo_origen")
        );
        let source_files = sqlx::query(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .and_then(|rows| rows.iter().map(source_file_from_row).collect())
            .map_err(db_error("read source files"))?;

        Ok(DimensionSnapshot {
            programs,
            sections,
            source_files,
        })
    }

    async fn insert_enrollments(&mut self, facts: &[EnrollmentFact]) -> Result<u64, LoadError> {
        let mut inserted = 0u64;
        for chunk in facts.chunks(self.batch_size) {
            let result = enrollment_insert(&self.schema, chunk)
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(db_error("insert enrollments"))?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_names_must_be_plain_identifiers() {
        assert!(validate_schema_name("infoda").is_ok());
        assert!(validate_schema_name("_staging2").is_ok());
        assert!(validate_schema_name("").is_err());
        assert!(validate_schema_name("2024").is_err());
        assert!(validate_schema_name("infoda; DROP TABLE x").is_err());
        assert!(validate_schema_name("public.infoda").is_err());
    }

    fn fact(student_id: &str, section_id: i32) -> EnrollmentFact {
        EnrollmentFact {
            student_id: student_id.to_string(),
            student_name: "Vera Eva".to_string(),
            program_id: 1,
            section_id,
            source_file_id: Some(1),
        }
    }

    #[test]
    fn program_upsert_keeps_the_stored_code() {
        let chunk = vec![
            ProgramKey {
                code: Some(1101),
                name: "LEYES".to_string(),
            },
            ProgramKey {
                code: None,
                name: "MEDICINA".to_string(),
            },
        ];
        let qb = program_upsert("infoda", &chunk);
        assert_eq!(
            qb.sql(),
            "INSERT INTO infoda.carrera AS c (codigo_carrera, nombre_carrera) \
             VALUES ($1, $2), ($3, $4) \
             ON CONFLICT (nombre_carrera) DO UPDATE \
             SET codigo_carrera = COALESCE(c.codigo_carrera, EXCLUDED.codigo_carrera)"
        );
        assert!(!qb.sql().contains("COALESCE(EXCLUDED.codigo_carrera"));
    }

    #[test]
    fn section_upsert_refreshes_the_subject_by_code() {
        let chunk = vec![SectionKey {
            code: "503203-4".to_string(),
            subject: "PROGRAMACIÓN".to_string(),
        }];
        let qb = section_upsert("infoda", &chunk);
        assert_eq!(
            qb.sql(),
            "INSERT INTO infoda.seccion (codigo_seccion, nombre_asignatura) \
             VALUES ($1, $2) \
             ON CONFLICT (codigo_seccion) DO UPDATE \
             SET nombre_asignatura = EXCLUDED.nombre_asignatura"
        );
    }

    #[test]
    fn source_file_insert_ignores_known_names() {
        let chunk = vec!["A.csv".to_string(), "B.csv".to_string()];
        let qb = source_file_insert("staging", &chunk);
        assert_eq!(
            qb.sql(),
            "INSERT INTO staging.archivo_origen (nombre_archivo) \
             VALUES ($1), ($2) ON CONFLICT (nombre_archivo) DO NOTHING"
        );
    }

    #[test]
    fn enrollment_insert_never_overwrites_an_enrollment() {
        let chunk = vec![fact("55", 1), fact("56", 1)];
        let qb = enrollment_insert("infoda", &chunk);
        let sql = qb.sql();
        assert!(sql.starts_with(
            "INSERT INTO infoda.estudiantes \
             (matricula, apellidos_nombres, id_carrera, id_seccion, id_archivo) \
             VALUES ($1, $2, $3, $4, $5), ($6, $7, $8, $9, $10)"
        ));
        assert!(sql.ends_with(" ON CONFLICT (matricula, id_seccion) DO NOTHING"));
        assert!(!sql.contains("DO UPDATE"));
    }

    #[test]
    fn a_full_fact_batch_stays_under_the_bind_limit() {
        let chunk: Vec<EnrollmentFact> = (0..MAX_BATCH_SIZE)
            .map(|i| fact(&i.to_string(), 1))
            .collect();
        let qb = enrollment_insert("infoda", &chunk);
        assert!(qb.sql().contains(&format!("${}", MAX_BATCH_SIZE * 5)));
        assert!(MAX_BATCH_SIZE * 5 <= u16::MAX as usize);
    }
}
