//! Performance benchmarks for the strata scanner

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use strata::discovery::application::redis::{parse_info, parse_reply};
use strata::discovery::presentation::{parse_status_line, HttpResponse};
use strata::network::socket::PortScanner;
use strata::network::{Transport, TransportSelection};
use strata::scanner::{PortProber, ProbeOptions};
use strata::utils::scan_options::PortSet;
use tokio::runtime::Runtime;

const HTTP_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nServer: Kubernetes\r\nContent-Type: application/json\r\nContent-Length: 73\r\n\r\n{\"gitVersion\":\"v1.28.3\",\"platform\":\"linux/amd64\",\"goVersion\":\"go1.20.10\"}";

fn info_reply() -> Vec<u8> {
    let mut body = String::from(
        "# Server\r\nredis_version:7.0.5\r\nredis_mode:standalone\r\nos:Linux 6.1 x86_64\r\n",
    );
    for i in 0..100 {
        body.push_str(&format!("field_{}:value_{}\r\n", i, i));
    }
    format!("${}\r\n{}\r\n", body.len(), body).into_bytes()
}

/// Benchmark the protocol parsers used during discovery
fn bench_protocol_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("protocol_parsing");

    group.bench_function("http_status_line", |b| {
        b.iter(|| black_box(parse_status_line(black_box(HTTP_RESPONSE))))
    });

    group.bench_function("http_response", |b| {
        b.iter(|| black_box(HttpResponse::parse(black_box(HTTP_RESPONSE)).ok()))
    });

    let reply = info_reply();
    group.bench_function("redis_reply", |b| {
        b.iter(|| black_box(parse_reply(black_box(&reply)).ok()))
    });

    let text = String::from_utf8_lossy(&reply).into_owned();
    group.bench_function("redis_info_fields", |b| {
        b.iter(|| black_box(parse_info(black_box(&text))))
    });

    group.finish();
}

/// Benchmark port list parsing
fn bench_port_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("port_parsing");

    group.bench_function("mixed_tokens", |b| {
        b.iter(|| black_box(PortSet::parse(black_box(&["22", "80,443", "8000-9000"])).ok()))
    });

    group.bench_function("full_range", |b| {
        b.iter(|| black_box(PortSet::parse(black_box(&["1-65535"])).ok()))
    });

    group.finish();
}

/// Answers instantly so the bench measures admission and fan-in only
struct InstantScanner;

#[async_trait]
impl PortScanner for InstantScanner {
    async fn probe(&self, addr: SocketAddrV4, _: Transport) -> bool {
        addr.port() % 1000 == 0
    }

    fn name(&self) -> &str {
        "instant"
    }
}

/// Benchmark prober throughput for different admission gate sizes
fn bench_prober(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("prober");
    group.measurement_time(Duration::from_secs(10));
    let ports = PortSet::list(1..=10_000);

    for concurrency in [64usize, 512, 4096] {
        let options = ProbeOptions {
            concurrency,
            transport: TransportSelection::Tcp,
            ..Default::default()
        };
        let prober = PortProber::with_scanner(options, Arc::new(InstantScanner));
        let id = BenchmarkId::new("10k_ports", concurrency);
        group.bench_with_input(id, &prober, |b, prober| {
            b.iter(|| {
                rt.block_on(async { black_box(prober.probe(Ipv4Addr::LOCALHOST, &ports).await) })
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_protocol_parsing, bench_port_parsing, bench_prober);

criterion_main!(benches);
