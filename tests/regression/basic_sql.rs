use std::fs;
use std::path::Path;
use std::sync::Arc;

use loamdb::catalog::Catalog;
use loamdb::tcop::postgres::{BackendMessage, FrontendMessage, PostgresSession};

fn load_corpus() -> Vec<(String, String)> {
    let mut files = fs::read_dir(Path::new("tests/regression/corpus"))
        .expect("read regression corpus dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("sql"))
        .collect::<Vec<_>>();
    files.sort();
    files
        .into_iter()
        .map(|path| {
            let name = path
                .file_name()
                .expect("file name")
                .to_string_lossy()
                .to_string();
            let sql = fs::read_to_string(&path).expect("read regression corpus file");
            (name, sql)
        })
        .collect()
}

/// Expected rows are written as `-- expect: a | b | c` lines; `NULL` marks a
/// null cell and `(empty)` an empty result-set marker line.
fn parse_expected_rows(sql: &str) -> (Vec<Vec<Option<String>>>, bool) {
    let mut rows = Vec::new();
    let mut expect_empty = false;
    for line in sql.lines() {
        let trimmed = line.trim();
        let Some(expected) = trimmed.strip_prefix("-- expect:") else {
            continue;
        };
        let expected = expected.trim();
        if expected == "(empty)" {
            expect_empty = true;
            continue;
        }
        rows.push(
            expected
                .split('|')
                .map(|value| {
                    let value = value.trim();
                    if value == "NULL" {
                        None
                    } else {
                        Some(value.to_string())
                    }
                })
                .collect::<Vec<_>>(),
        );
    }
    (rows, expect_empty)
}

fn run_fixture(sql: &str) -> Vec<Vec<Option<String>>> {
    let mut session = PostgresSession::new(Arc::new(Catalog::new()));
    let statements: Vec<&str> = sql
        .split(';')
        .map(str::trim)
        .filter(|s| {
            // A segment that is only comment lines is not a statement.
            !s.lines()
                .map(str::trim)
                .all(|line| line.is_empty() || line.starts_with("--"))
        })
        .collect();

    let mut rows = Vec::new();
    for statement in statements {
        let out = session.run_sync([FrontendMessage::Query {
            sql: statement.to_string(),
        }]);
        for message in out {
            match message {
                BackendMessage::DataRow { values } => rows.push(values),
                BackendMessage::ErrorResponse { message, .. } => {
                    panic!("fixture produced an error response: {message}\nsql: {statement}");
                }
                _ => {}
            }
        }
    }
    rows
}

#[test]
fn regression_corpus_suite() {
    let corpus = load_corpus();
    assert!(!corpus.is_empty(), "regression corpus is empty");
    for (name, sql) in corpus {
        let (expected, expect_empty) = parse_expected_rows(&sql);
        assert!(
            !expected.is_empty() || expect_empty,
            "regression corpus file {} has no expectations",
            name
        );
        let rows = run_fixture(&sql);
        assert_eq!(rows, expected, "regression corpus mismatch in {name}");
    }
}
