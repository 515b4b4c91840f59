use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use infoda_core::{EnrollmentFact, ProgramRow, SectionRow, SourceFileRow};

use super::{DimensionSnapshot, EnrollmentStore};
use crate::{LoadError, ProgramKey, SectionKey};

/// In-process store with the same conflict rules as the Postgres tables. Ids are
/// assigned from per-table counters starting at 1, like `SERIAL` columns.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    programs: BTreeMap<i32, ProgramRow>,
    program_ids: HashMap<String, i32>,
    sections: BTreeMap<i32, SectionRow>,
    section_ids: HashMap<String, i32>,
    source_files: BTreeMap<i32, SourceFileRow>,
    source_file_ids: HashMap<String, i32>,
    enrollments: Vec<EnrollmentFact>,
    enrollment_keys: HashSet<(String, i32)>,
}

fn next_id<T>(rows: &BTreeMap<i32, T>) -> i32 {
    rows.keys().next_back().map(|id| id + 1).unwrap_or(1)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn programs(&self) -> Vec<ProgramRow> {
        self.programs.values().cloned().collect()
    }

    pub fn sections(&self) -> Vec<SectionRow> {
        self.sections.values().cloned().collect()
    }

    pub fn source_files(&self) -> Vec<SourceFileRow> {
        self.source_files.values().cloned().collect()
    }

    pub fn enrollments(&self) -> &[EnrollmentFact] {
        &self.enrollments
    }
}

#[async_trait]
impl EnrollmentStore for MemoryStore {
    async fn upsert_programs(&mut self, programs: &[ProgramKey]) -> Result<(), LoadError> {
        for program in programs {
            match self.program_ids.get(&program.name) {
                Some(id) => {
                    if let Some(row) = self.programs.get_mut(id) {
                        row.code = row.code.or(program.code);
                    }
                }
                None => {
                    let id = next_id(&self.programs);
                    self.program_ids.insert(program.name.clone(), id);
                    self.programs.insert(
                        id,
                        ProgramRow {
                            id,
                            code: program.code,
                            name: program.name.clone(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn upsert_sections(&mut self, sections: &[SectionKey]) -> Result<(), LoadError> {
        for section in sections {
            match self.section_ids.get(&section.code) {
                Some(id) => {
                    if let Some(row) = self.sections.get_mut(id) {
                        row.subject = section.subject.clone();
                    }
                }
                None => {
                    let id = next_id(&self.sections);
                    self.section_ids.insert(section.code.clone(), id);
                    self.sections.insert(
                        id,
                        SectionRow {
                            id,
                            code: section.code.clone(),
                            subject: section.subject.clone(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn insert_source_files(&mut self, names: &[String]) -> Result<(), LoadError> {
        for name in names {
            if self.source_file_ids.contains_key(name) {
                continue;
            }
            let id = next_id(&self.source_files);
            self.source_file_ids.insert(name.clone(), id);
            self.source_files.insert(
                id,
                SourceFileRow {
                    id,
                    name: name.clone(),
                },
            );
        }
        Ok(())
    }

    async fn fetch_dimensions(&mut self) -> Result<DimensionSnapshot, LoadError> {
        Ok(DimensionSnapshot {
            programs: self.programs(),
            sections: self.sections(),
            source_files: self.source_files(),
        })
    }

    async fn insert_enrollments(&mut self, facts: &[EnrollmentFact]) -> Result<u64, LoadError> {
        let mut inserted = 0u64;
        for fact in facts {
            if !self
                .enrollment_keys
                .insert((fact.student_id.clone(), fact.section_id))
            {
                continue;
            }
            self.enrollments.push(fact.clone());
            inserted += 1;
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(code: Option<i32>, name: &str) -> ProgramKey {
        ProgramKey {
            code,
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn program_code_is_filled_once_and_never_overwritten() {
        let mut store = MemoryStore::new();
        store
            .upsert_programs(&[program(None, "DERECHO")])
            .await
            .expect("first");
        store
            .upsert_programs(&[program(Some(3400), "DERECHO")])
            .await
            .expect("second");
        store
            .upsert_programs(&[program(Some(9999), "DERECHO")])
            .await
            .expect("third");

        let programs = store.programs();
        assert_eq!(programs.len(), 1);
        assert_eq!(programs[0].code, Some(3400));
        assert_eq!(programs[0].id, 1);
    }

    #[tokio::test]
    async fn section_subject_takes_latest_value() {
        let mut store = MemoryStore::new();
        let first = SectionKey {
            code: "503203-4".to_string(),
            subject: "PROGRAMACION".to_string(),
        };
        let second = SectionKey {
            code: "503203-4".to_string(),
            subject: "PROGRAMACIÓN I".to_string(),
        };
        store.upsert_sections(&[first]).await.expect("first");
        store.upsert_sections(&[second]).await.expect("second");

        let sections = store.sections();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].subject, "PROGRAMACIÓN I");
    }

    #[tokio::test]
    async fn duplicate_enrollments_are_skipped() {
        let mut store = MemoryStore::new();
        let fact = EnrollmentFact {
            student_id: "12345".to_string(),
            student_name: "Pérez Juan".to_string(),
            program_id: 1,
            section_id: 1,
            source_file_id: Some(1),
        };
        let mut other_file = fact.clone();
        other_file.source_file_id = Some(2);

        let inserted = store
            .insert_enrollments(&[fact.clone(), other_file])
            .await
            .expect("insert");
        assert_eq!(inserted, 1);
        assert_eq!(store.insert_enrollments(&[fact]).await.expect("again"), 0);
        assert_eq!(store.enrollments()[0].source_file_id, Some(1));
    }
}
