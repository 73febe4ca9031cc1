use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput::Bytes,
};
use hearth::parser::h1::request::H1Request;
use hearth::parser::{StrictHow, StrictLevel};

const REQ_SHORT: &[u8] = b"GET /api/v1.0/weather/forecast HTTP/1.1\r\nHost: www.example.org\r\n\r\n";

const REQ_BROWSER: &[u8] = b"\
GET /wp-content/uploads/2010/03/hello-kitty-darth-vader-pink.jpg HTTP/1.1\r\n\
Accept:*/*\r\n\
Accept-Encoding:gzip,deflate,br\r\n\
Accept-Language:en-US,en;q=0.5\r\n\
Cache-Control:no-cache\r\n\
Connection:keep-alive\r\n\
DNT:1\r\n\
Host: www.example.org\r\n\
Pragma:no-cache\r\n\
Referrer:https://www.example.org\r\n\
Sec-Fetch-Dest:empty\r\n\
Sec-Fetch-Mode:cors\r\n\
Sec-Fetch-Site:same-origin\r\n\
User-Agent:Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/109.0\r\n\r\n";

fn benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("request head");
    for (name, input) in [("short", REQ_SHORT), ("browser", REQ_BROWSER)] {
        group.throughput(Bytes(input.len() as u64));
        for level in [-3, 0, 3] {
            let strict = StrictLevel::new(level, StrictHow::Exact).unwrap();
            group.bench_with_input(
                BenchmarkId::new(name, format!("strict {}", level)),
                black_box(&input),
                |b, &i| {
                    b.iter(|| {
                        let mut req = H1Request::with_strict_level(strict);
                        let _ = req.parse(i);
                    })
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
