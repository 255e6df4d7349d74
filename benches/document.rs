//! Configuration document benchmarks
//!
//! Measures the non-I/O work done on every tenant mutation and every reload:
//! parsing a document, hashing it and editing its tenant scope. Also covers the
//! exposition parser used by self-monitoring.
//!
//! Run with: `cargo bench --bench document`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use sre_exporter::document::{ConfigDocument, TenantId, TenantScope, digest};
use sre_exporter::scraping::parse_exposition;
use std::hint::black_box;

/// Document with `collectors` collectors of five metrics each
fn document_json(collectors: usize) -> String {
    let metric = |c: usize, m: usize| {
        format!(
            r#"{{"name": "Metric {c}-{m}", "query": "sum by (host) (rate(metric_{c}_{m}_total[5m]))", "id": "metric_{c}_{m}", "help": "Synthetic metric", "labels": ["host", "hostGuid", "projectId"], "destLabels": null, "Type": "Gauge"}}"#
        )
    };
    let collectors: Vec<String> = (0..collectors)
        .map(|c| {
            let metrics: Vec<String> = (0..5).map(|m| metric(c, m)).collect();
            format!(
                r#"{{"name": "collector{c}", "enabled": true, "metrics": [{}]}}"#,
                metrics.join(", ")
            )
        })
        .collect();

    format!(
        r#"{{"namespace": "orch_edgenode", "source": {{"queryURI": "http://mimir:8080/prometheus", "mimirOrg": "tenant1|tenant2|tenant3"}}, "collectors": [{}]}}"#,
        collectors.join(", ")
    )
}

/// Benchmark document parsing
///
/// Runs once per document on every reload and once per tenant request.
fn bench_document_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("document_parsing");

    for collectors in [1, 10, 50] {
        let json = document_json(collectors);
        group.bench_with_input(BenchmarkId::from_parameter(collectors), &json, |b, json| {
            b.iter(|| ConfigDocument::from_json("bench", black_box(json)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark the content hash
///
/// Computed by both processes for every convergence check.
fn bench_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest");

    for collectors in [1, 10, 50] {
        let document = ConfigDocument::from_json("bench", &document_json(collectors)).unwrap();
        group.bench_with_input(
            BenchmarkId::from_parameter(collectors),
            &document,
            |b, document| {
                b.iter(|| digest(black_box(document)).unwrap());
            },
        );
    }

    group.finish();
}

/// Benchmark tenant scope mutation on a large scope
fn bench_scope_mutation(c: &mut Criterion) {
    let raw: Vec<String> = (0..500).map(|i| format!("tenant{i}")).collect();
    let scope = TenantScope::new(raw.join("|"));
    let tenant = TenantId::parse("tenant-new").unwrap();

    c.bench_function("scope_insert_remove", |b| {
        b.iter(|| {
            let mut scope = scope.clone();
            scope.insert(black_box(&tenant));
            scope.remove(black_box(&tenant));
            scope
        });
    });
}

/// Benchmark the exposition parser on a typical collector agent payload
fn bench_exposition_parsing(c: &mut Criterion) {
    let mut text = String::new();
    for family in 0..50 {
        text.push_str(&format!("# HELP otelcol_metric_{family} Synthetic family\n"));
        text.push_str(&format!("# TYPE otelcol_metric_{family} counter\n"));
        for series in 0..10 {
            text.push_str(&format!(
                "otelcol_metric_{family}{{exporter=\"otlp\",series=\"{series}\"}} {}\n",
                family * series
            ));
        }
    }

    c.bench_function("exposition_parsing", |b| {
        b.iter(|| parse_exposition(black_box(&text)).unwrap());
    });
}

criterion_group!(
    benches,
    bench_document_parsing,
    bench_digest,
    bench_scope_mutation,
    bench_exposition_parsing
);
criterion_main!(benches);
