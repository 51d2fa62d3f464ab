//! Protocol encoding/decoding benchmarks.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use graphwire_protocol::{
    Chunker, Dechunker, MessageRegistry, Packer, ProtocolVersion, Request, Response, Unpacker,
    Value, ValueMap,
};

fn create_test_record(width: usize) -> Vec<Value> {
    (0..width)
        .map(|i| match i % 4 {
            0 => Value::Integer(i as i64),
            1 => Value::Float(i as f64 * 0.5),
            2 => Value::from(format!("value-{}", i)),
            _ => Value::List(vec![Value::Integer(1), Value::Boolean(true), Value::Null]),
        })
        .collect()
}

fn create_test_run(param_size: usize) -> Request {
    let parameters = ValueMap::new()
        .with("name", "x".repeat(param_size))
        .with("limit", 100i64)
        .with("ids", Value::List((0..16).map(Value::Integer).collect()));
    Request::run("UNWIND $ids AS id RETURN id, $name", parameters)
}

fn bench_chunk_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_encode");
    let chunker = Chunker::default();

    for size in [100, 10_000, 200_000] {
        let message = vec![0xA5u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
            let mut out = BytesMut::with_capacity(size + 64);
            b.iter(|| {
                out.clear();
                chunker.encode(message, &mut out);
                black_box(out.len())
            });
        });
    }

    group.finish();
}

fn bench_chunk_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_decode");

    for size in [100, 10_000, 200_000] {
        let framed = Chunker::default().to_bytes(&vec![0xA5u8; size]);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &framed, |b, framed| {
            b.iter(|| {
                let mut dechunker = Dechunker::new(usize::MAX);
                dechunker.extend(framed);
                black_box(dechunker.next_message().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_value_pack(c: &mut Criterion) {
    let mut group = c.benchmark_group("value_pack");

    for width in [4, 32, 256] {
        let record = Value::List(create_test_record(width));

        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::from_parameter(width), &record, |b, record| {
            let mut buf = BytesMut::with_capacity(4096);
            b.iter(|| {
                buf.clear();
                let mut packer = Packer::new(&mut buf, ProtocolVersion::V3);
                packer.pack(record).unwrap();
                black_box(buf.len())
            });
        });
    }

    group.finish();
}

fn bench_value_unpack(c: &mut Criterion) {
    let mut group = c.benchmark_group("value_unpack");

    for width in [4, 32, 256] {
        let mut buf = BytesMut::new();
        Packer::new(&mut buf, ProtocolVersion::V3)
            .pack(&Value::List(create_test_record(width)))
            .unwrap();

        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::from_parameter(width), &buf, |b, buf| {
            b.iter(|| {
                let mut unpacker = Unpacker::new(buf, ProtocolVersion::V3);
                black_box(unpacker.unpack().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_request_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_decode");
    let registry = MessageRegistry::for_version(ProtocolVersion::V3);

    for size in [100, 1000, 10000] {
        let mut encoded = BytesMut::new();
        registry
            .encode_request(&create_test_run(size), &mut encoded)
            .unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| black_box(registry.decode_request(encoded).unwrap()));
        });
    }

    group.finish();
}

fn bench_record_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_encode");
    let chunker = Chunker::default();

    for version in ProtocolVersion::ALL {
        let registry = MessageRegistry::for_version(version);
        let response = Response::Record(create_test_record(16));

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::from_parameter(version.number()),
            &response,
            |b, response| {
                let mut scratch = BytesMut::with_capacity(1024);
                let mut out = BytesMut::with_capacity(1024);
                b.iter(|| {
                    scratch.clear();
                    out.clear();
                    registry.encode_response(response, &mut scratch).unwrap();
                    chunker.encode(&scratch, &mut out);
                    black_box(out.len())
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_chunk_encode,
    bench_chunk_decode,
    bench_value_pack,
    bench_value_unpack,
    bench_request_decode,
    bench_record_encode,
);
criterion_main!(benches);
