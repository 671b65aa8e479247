//! Redaction benchmarks
//!
//! Header and body redaction run on every captured exchange.

use apitoolkit_core::json_path::JsonPath;
use apitoolkit_core::redact::{redact_body, RedactionSpec};
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use http::{HeaderMap, HeaderValue};
use serde_json::json;

fn order_body(items: usize) -> Bytes {
    let items: Vec<_> = (0..items)
        .map(|i| {
            json!({
                "sku": format!("SKU-{i}"),
                "quantity": i % 5,
                "card": {"number": "4111111111111111", "cvv": "123"},
            })
        })
        .collect();
    let body = json!({
        "customer": {"email": "a@b.c", "password": "hunter2", "name": "Ada"},
        "items": items,
    });
    Bytes::from(serde_json::to_vec(&body).unwrap())
}

fn paths(raw: &[&str]) -> Vec<JsonPath> {
    raw.iter().map(|p| JsonPath::parse(p).unwrap()).collect()
}

fn bench_body_redaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("body_redaction");

    let simple = paths(&["$.customer.password", "$.customer.email"]);
    let wildcard = paths(&["$.items[*].card.number", "$.items[*].card.cvv"]);
    let descendant = paths(&["$..password", "$..cvv"]);

    for size in [1, 10, 100] {
        let body = order_body(size);
        group.bench_with_input(BenchmarkId::new("fixed_paths", size), &body, |b, body| {
            b.iter(|| redact_body(black_box(body), &simple))
        });
        group.bench_with_input(BenchmarkId::new("wildcard", size), &body, |b, body| {
            b.iter(|| redact_body(black_box(body), &wildcard))
        });
        group.bench_with_input(BenchmarkId::new("descendant", size), &body, |b, body| {
            b.iter(|| redact_body(black_box(body), &descendant))
        });
    }

    let not_json = Bytes::from_static(b"plain text that is not json at all");
    group.bench_function("not_json", |b| {
        b.iter(|| redact_body(black_box(&not_json), &simple))
    });

    group.finish();
}

fn bench_header_redaction(c: &mut Criterion) {
    let spec = RedactionSpec::new().header("x-api-key");
    let mut headers = HeaderMap::new();
    for i in 0..20 {
        headers.insert(
            http::HeaderName::try_from(format!("x-custom-{i}")).unwrap(),
            HeaderValue::from_static("value"),
        );
    }
    headers.insert("authorization", HeaderValue::from_static("Bearer token"));
    headers.insert("x-api-key", HeaderValue::from_static("secret"));

    c.bench_function("header_redaction", |b| {
        b.iter(|| spec.redact_headers(black_box(&headers)))
    });
}

fn bench_path_parsing(c: &mut Criterion) {
    c.bench_function("json_path_parse", |b| {
        b.iter(|| JsonPath::parse(black_box("$.data['users'][*].profile..secret")))
    });
}

criterion_group!(
    benches,
    bench_body_redaction,
    bench_header_redaction,
    bench_path_parsing
);
criterion_main!(benches);
