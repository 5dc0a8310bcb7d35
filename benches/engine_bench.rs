use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use loamdb::catalog::Catalog;
use loamdb::tcop::postgres::{BackendMessage, FrontendMessage, PostgresSession};

fn assert_ok(out: &[BackendMessage]) {
    assert!(
        !out.iter()
            .any(|msg| matches!(msg, BackendMessage::ErrorResponse { .. })),
        "benchmark query produced error: {out:?}"
    );
}

fn query(sql: &str) -> FrontendMessage {
    FrontendMessage::Query {
        sql: sql.to_string(),
    }
}

fn seeded_session(rows: usize) -> PostgresSession {
    let mut session = PostgresSession::new(Arc::new(Catalog::new()));
    assert_ok(&session.run_sync([query("CREATE TABLE bench (id int, grp text, val int)")]));
    for chunk in (0..rows).collect::<Vec<_>>().chunks(100) {
        let values = chunk
            .iter()
            .map(|i| format!("({}, 'g{}', {})", i, i % 7, i % 100))
            .collect::<Vec<_>>()
            .join(", ");
        assert_ok(&session.run_sync([query(&format!("INSERT INTO bench VALUES {}", values))]));
    }
    session
}

fn bench_simple_select(c: &mut Criterion) {
    let mut session = seeded_session(1000);
    c.bench_function("select_filtered", |b| {
        b.iter(|| {
            let out = session.run_sync([query("SELECT id FROM bench WHERE val > 50")]);
            assert_ok(&out);
        })
    });
}

fn bench_group_by(c: &mut Criterion) {
    let mut session = seeded_session(1000);
    c.bench_function("group_by_sum", |b| {
        b.iter(|| {
            let out = session.run_sync([query(
                "SELECT grp, SUM(val) FROM bench GROUP BY grp ORDER BY 2 DESC",
            )]);
            assert_ok(&out);
        })
    });
}

fn bench_insert_throughput(c: &mut Criterion) {
    c.bench_function("insert_throughput", |b| {
        b.iter_batched(
            || {
                let mut session = PostgresSession::new(Arc::new(Catalog::new()));
                assert_ok(&session.run_sync([query("CREATE TABLE bench_insert (id int, val text)")]));
                session
            },
            |mut session| {
                for i in 0..100 {
                    let out = session.run_sync([query(&format!(
                        "INSERT INTO bench_insert VALUES ({}, 'value')",
                        i
                    ))]);
                    assert_ok(&out);
                }
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_simple_select,
    bench_group_by,
    bench_insert_throughput
);
criterion_main!(benches);
