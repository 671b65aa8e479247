//! Record assembly benchmarks
//!
//! Benchmarks turning a captured exchange into a wire-ready record.

use apitoolkit_core::assemble::{CapturedExchange, EventAssembler, ServiceMeta};
use apitoolkit_core::redact::RedactionSpec;
use apitoolkit_core::SdkType;
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use http::{HeaderMap, HeaderValue, Method, Uri};
use std::time::Duration;

fn exchange() -> CapturedExchange {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", HeaderValue::from_static("Bearer t"));
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    let uri: Uri = "http://api.test/orders/42/items?page=2&sort=asc".parse().unwrap();

    let mut exchange = CapturedExchange::new(
        &Method::POST,
        &uri,
        &headers,
        "5f1c4e2a-8b7d-4c3e-9a1f-0d2e3b4c5a6f",
        SdkType::Inbound,
    );
    exchange.route = Some("/orders/{order_id}/items".to_string());
    exchange.status_code = 201;
    exchange.duration = Duration::from_micros(1250);
    exchange.request_body = Bytes::from_static(br#"{"sku":"A1","password":"p"}"#);
    exchange.response_body = Bytes::from_static(br#"{"id":7,"email":"a@b.c"}"#);
    exchange
}

fn bench_assemble(c: &mut Criterion) {
    let spec = RedactionSpec::new()
        .request_path("$.password")
        .response_path("$.email");
    let assembler = EventAssembler::new(spec, ServiceMeta::default());
    let exchange = exchange();

    c.bench_function("assemble", |b| {
        b.iter(|| assembler.assemble(black_box(exchange.clone()), Vec::new()))
    });

    c.bench_function("assemble_and_serialize", |b| {
        b.iter(|| {
            assembler
                .assemble(black_box(exchange.clone()), Vec::new())
                .to_json_bytes()
        })
    });
}

criterion_group!(benches, bench_assemble);
criterion_main!(benches);
