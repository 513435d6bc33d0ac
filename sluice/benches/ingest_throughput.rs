//! Benchmarks for the CPU-bound half of ingestion using criterion.
//!
//! These benchmarks measure:
//! - IIS log parsing into records
//! - Bulk request body encoding for the search backend
//! - Discovery descriptor encoding into queue events

#![allow(missing_docs)]

use std::hint::black_box;

use bytes::Bytes;
use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use sluice::elastic::bulk_body;
use sluice::parsing::{IisParser, JsonLinesParser};
use sluice::*;

fn iis_log(lines: usize) -> Bytes {
    let mut log = String::from(
        "#Software: Microsoft Internet Information Services 10.0\n\
         #Date: 2024-01-01 00:00:00\n\
         #Fields: date time s-ip cs-method cs-uri-stem cs-uri-query s-port c-ip sc-status time-taken\n",
    );
    for n in 0..lines {
        log.push_str(&format!(
            "2024-01-01 00:{:02}:{:02} 10.0.0.1 GET /api/orders/{n} page=2 443 192.168.1.{} {} {}\n",
            (n / 60) % 60,
            n % 60,
            n % 255,
            if n % 17 == 0 { 500 } else { 200 },
            n % 900,
        ));
    }
    Bytes::from(log)
}

fn jsonl_log(lines: usize) -> Bytes {
    let mut log = String::new();
    for n in 0..lines {
        log.push_str(&format!(
            "{{\"@timestamp\":\"2024-01-01T00:00:{:02}Z\",\"level\":\"info\",\"request\":{n},\"message\":\"handled\"}}\n",
            n % 60
        ));
    }
    Bytes::from(log)
}

fn bench_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");

    for lines in [100usize, 10_000] {
        let iis = iis_log(lines);
        group.throughput(Throughput::Bytes(iis.len() as u64));
        group.bench_with_input(BenchmarkId::new("iis", lines), &iis, |b, content| {
            b.iter(|| {
                let records = IisParser.parse(content.clone(), "memory://acct/iis/u_ex.log");
                black_box(records.filter_map(Result::ok).count())
            })
        });

        let jsonl = jsonl_log(lines);
        group.throughput(Throughput::Bytes(jsonl.len() as u64));
        group.bench_with_input(BenchmarkId::new("jsonl", lines), &jsonl, |b, content| {
            b.iter(|| {
                let records = JsonLinesParser.parse(content.clone(), "memory://acct/app/a.jsonl");
                black_box(records.filter_map(Result::ok).count())
            })
        });
    }

    group.finish();
}

fn bench_bulk_body(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk_body");

    for batch in [100usize, 1_000] {
        let docs: Vec<IndexDocument> = IisParser
            .parse(iis_log(batch), "memory://acct/iis/u_ex.log")
            .filter_map(Result::ok)
            .map(|record| IndexDocument::from(&record))
            .collect();

        group.throughput(Throughput::Elements(docs.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &docs, |b, docs| {
            b.iter(|| black_box(bulk_body("logs-a", docs).map(|body| body.len())))
        });
    }

    group.finish();
}

fn bench_descriptor_events(c: &mut Criterion) {
    let source = SourceConfig::new("logs-A", "memory://acct")
        .with_container("iis")
        .with_property(keys::SCHEDULER, "time-bucket")
        .with_property(keys::PARSER, "iis");
    let descriptor = DiscoveryDescriptor::new(
        &source,
        ShardKey::new("3600-7200"),
        UnitRef::TimeBucket {
            start: 3600,
            end: 7200,
        },
        Utc::now(),
    );

    c.bench_function("descriptor_to_event", |b| {
        b.iter(|| black_box(descriptor.to_event()))
    });

    let event = descriptor.to_event().unwrap();
    c.bench_function("descriptor_from_event", |b| {
        b.iter(|| black_box(event.body_as::<DiscoveryDescriptor>()))
    });
}

criterion_group!(benches, bench_parsing, bench_bulk_body, bench_descriptor_events);
criterion_main!(benches);
