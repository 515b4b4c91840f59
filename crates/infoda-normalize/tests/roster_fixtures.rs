use std::path::{Path, PathBuf};

use infoda_core::TableLayout;
use infoda_normalize::{
    merge_rosters, normalize_directory, run_normalize, NormalizeConfig, NormalizeError,
    RosterFormat, RosterParser, SourceEncoding,
};
use infoda_storage::read_merged_table;
use tempfile::tempdir;

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/rosters")
        .canonicalize()
        .expect("fixtures dir")
}

fn config(input_dir: &Path, output_path: &Path, layout: TableLayout) -> NormalizeConfig {
    NormalizeConfig {
        input_dir: input_dir.to_path_buf(),
        file_pattern: "*.csv".to_string(),
        output_path: output_path.to_path_buf(),
        layout,
        format: RosterFormat::default(),
    }
}

#[test]
fn single_student_scenario_yields_expected_record() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("A.csv");
    std::fs::write(
        &path,
        "Listado;;;;;;;;\n;(503203-4) PROGRAMACIÓN;;;;;;;\nCorr.;;;;;;;;\n1;;12345;;;;Pérez Juan;;(3309) INGENIERIA EN SISTEMAS\n",
    )
    .expect("write roster");

    let parser = RosterParser::new(RosterFormat::default()).expect("patterns compile");
    let extract = parser.parse_file(&path).expect("parse");
    assert_eq!(extract.records.len(), 1);
    let record = &extract.records[0];
    assert_eq!(record.student_id, "12345");
    assert_eq!(record.student_name, "Pérez Juan");
    assert_eq!(record.program_name, "INGENIERIA EN SISTEMAS");
    assert_eq!(record.section_code, "503203-4");
    assert_eq!(record.source_file, "A.csv");
    assert_eq!(record.program_code, Some(3309));
    assert_eq!(record.subject_name, "PROGRAMACIÓN");
}

#[test]
fn fixture_directory_merges_in_file_name_order() {
    let dir = tempdir().expect("tempdir");
    let cfg = config(&fixtures_dir(), &dir.path().join("maestro.csv"), TableLayout::Canonical);
    let outcome = normalize_directory(&cfg).expect("normalize");

    let names = outcome
        .files
        .iter()
        .map(|f| f.file_name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["A.csv", "B.csv"]);
    assert_eq!(outcome.files[1].encoding, SourceEncoding::Latin1);

    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].file_name, "C.csv");
    assert!(outcome.failures[0].message.contains("Corr."));

    let keys = outcome
        .records
        .iter()
        .map(|r| (r.student_id.as_str(), r.source_file.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        keys,
        vec![("12345", "A.csv"), ("20001", "A.csv"), ("30003", "B.csv")]
    );
    assert_eq!(outcome.duplicates_dropped, 1);
    assert_eq!(outcome.records[2].student_name, "Muñoz Pía");
    assert_eq!(outcome.records[2].program_code, None);
}

#[test]
fn same_student_in_different_sections_is_kept_twice() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("x1.csv"),
        "(100-1) UNO\nCorr.\n1;;55;;;;Vera Eva;;LEYES\n",
    )
    .expect("x1");
    std::fs::write(
        dir.path().join("x2.csv"),
        "(100-2) DOS\nCorr.\n1;;55;;;;Vera Eva;;LEYES\n",
    )
    .expect("x2");

    let parser = RosterParser::new(RosterFormat::default()).expect("patterns compile");
    let outcome = merge_rosters(
        &parser,
        &[dir.path().join("x1.csv"), dir.path().join("x2.csv")],
    );
    assert_eq!(outcome.records.len(), 2);
    assert_eq!(outcome.duplicates_dropped, 0);
}

#[test]
fn directory_without_any_valid_roster_is_fatal() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("broken.csv"), "no header here\n1;;123\n").expect("write");
    std::fs::write(dir.path().join("ignored.txt"), "Corr.\n").expect("write");

    let cfg = config(dir.path(), &dir.path().join("out.csv"), TableLayout::Canonical);
    let err = normalize_directory(&cfg).expect_err("nothing parsed");
    match err {
        NormalizeError::NoValidFiles { failed, .. } => assert_eq!(failed, 1),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn extended_run_writes_loader_ready_table() {
    let dir = tempdir().expect("tempdir");
    let output = dir.path().join("maestro.csv");
    let summary = run_normalize(&config(&fixtures_dir(), &output, TableLayout::Extended))
        .await
        .expect("run");

    assert_eq!(summary.records, 3);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.output.path, output);

    let table = read_merged_table(&output).await.expect("read back");
    assert_eq!(table.columns, TableLayout::Extended.columns());
    assert_eq!(
        table.rows[0],
        vec![
            "12345",
            "Pérez Juan",
            "3309",
            "INGENIERIA EN SISTEMAS",
            "503203-4",
            "PROGRAMACIÓN",
            "A.csv"
        ]
    );
}
