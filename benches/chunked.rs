use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput::Bytes,
};
use hearth::parser::h1::chunked::{ChunkedDecoder, Decoded};
use hearth::parser::{Status, StrictLevel};

/// `total` bytes of payload in chunks of `chunk` bytes.
fn chunked_body(total: usize, chunk: usize) -> Vec<u8> {
    let mut body = Vec::with_capacity(total + total / chunk * 8 + 8);
    let mut left = total;
    while left > 0 {
        let n = left.min(chunk);
        body.extend_from_slice(format!("{:x}\r\n", n).as_bytes());
        body.resize(body.len() + n, b'x');
        body.extend_from_slice(b"\r\n");
        left -= n;
    }
    body.extend_from_slice(b"0\r\n");
    body
}

fn decode_all(input: &[u8]) -> usize {
    let mut decoder = ChunkedDecoder::new();
    let mut pos = 0;
    let mut payload = 0;
    while let Ok(Status::Complete((decoded, consumed))) =
        decoder.decode(&input[pos..], StrictLevel::DEFAULT)
    {
        pos += consumed;
        match decoded {
            Decoded::Data { len, .. } => payload += len,
            Decoded::Framing => {}
            Decoded::End => break,
        }
    }
    payload
}

fn benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunked decode");
    for chunk in [16, 1024, 16 * 1024] {
        let input = chunked_body(256 * 1024, chunk);
        group.throughput(Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::new("chunk size", chunk), &input, |b, i| {
            b.iter(|| decode_all(black_box(i)))
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
