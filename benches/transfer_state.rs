use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use muxnet::http::drain::DrainKind;
use muxnet::http::headers::ParsedResponseHeader;
use muxnet::http::transferstate::TransferState;
use url::Url;

const RESPONSE_HEAD: &[&[u8]] = &[
    b"HTTP/1.1 200 OK\r\n",
    b"Date: Mon, 19 Oct 2026 10:00:00 GMT\r\n",
    b"Content-Type: text/html; charset=utf-8\r\n",
    b"Content-Length: 16384\r\n",
    b"Cache-Control: public, max-age=3600\r\n",
    b"ETag: \"5d8c72a5edda8d6a\"\r\n",
    b"Last-Modified: Sun, 18 Oct 2026 08:00:00 GMT\r\n",
    b"Server: nginx\r\n",
    b"Vary: Accept-Encoding\r\n",
    b"X-Request-Id: 1b9d6bcd-bbfd-4b2d-9b5d-ab8dfbbd4bed\r\n",
    b"\r\n",
];

fn head_len() -> u64 {
    RESPONSE_HEAD.iter().map(|l| l.len() as u64).sum()
}

fn benchmark_parsed_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("parsed_header");
    group.throughput(Throughput::Bytes(head_len()));
    group.bench_function("fold_response_head", |b| {
        b.iter(|| {
            let mut header = ParsedResponseHeader::new();
            for line in RESPONSE_HEAD {
                header = header.by_appending_header_line(black_box(line)).unwrap();
            }
            black_box(header.is_complete())
        })
    });
    group.finish();
}

fn benchmark_transfer_state(c: &mut Criterion) {
    let url = Url::parse("http://example.com/index.html").unwrap();
    let chunk = vec![b'x'; 16 * 1024];

    let mut group = c.benchmark_group("transfer_state");
    group.throughput(Throughput::Bytes(head_len()));
    group.bench_function("header_lines_to_response", |b| {
        b.iter(|| {
            let mut state = TransferState::new(url.clone(), None, DrainKind::Ignore.create());
            for line in RESPONSE_HEAD {
                state = state.by_appending_header_line(black_box(line)).unwrap();
            }
            black_box(state.response().map(|r| r.status()))
        })
    });

    group.throughput(Throughput::Bytes(head_len() + chunk.len() as u64));
    group.bench_function("full_exchange_into_memory", |b| {
        b.iter(|| {
            let mut state = TransferState::new(url.clone(), None, DrainKind::Memory.create());
            for line in RESPONSE_HEAD {
                state = state.by_appending_header_line(line).unwrap();
            }
            for part in chunk.chunks(4096) {
                state = state.by_appending_body_data(black_box(part)).unwrap();
            }
            black_box(state.finish().unwrap())
        })
    });
    group.finish();
}

criterion_group!(benches, benchmark_parsed_header, benchmark_transfer_state);
criterion_main!(benches);
