//! Benchmarks for query parsing and cache lookups.
//!
//! Run with: cargo bench --bench cache_bench

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::Rng;
use std::time::Duration;

use dnsfwd::{CacheKey, DnsCache, DnsQuery};

fn create_dns_query(query_id: u16, domain: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(512);

    // Header (12 bytes)
    packet.extend_from_slice(&query_id.to_be_bytes());
    packet.extend_from_slice(&[0x01, 0x00]); // Flags: standard query
    packet.extend_from_slice(&[0x00, 0x01]); // Questions: 1
    packet.extend_from_slice(&[0x00; 6]); // Answer, authority, additional: 0

    // Question section
    for label in domain.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0x00); // Root label

    packet.extend_from_slice(&[0x00, 0x01]); // Type: A
    packet.extend_from_slice(&[0x00, 0x01]); // Class: IN

    packet
}

fn random_domains(count: usize) -> Vec<String> {
    let mut rng = rand::rng();
    (0..count)
        .map(|_| {
            let len = rng.random_range(3..=16);
            let label: String = (0..len)
                .map(|_| rng.random_range(b'a'..=b'z') as char)
                .collect();
            format!("{label}.example.com")
        })
        .collect()
}

fn bench_parse(c: &mut Criterion) {
    let short = create_dns_query(0x1234, "example.com");
    let long = create_dns_query(0x1234, "a.deeply.nested.subdomain.example.domain.com");

    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Elements(1));
    group.bench_function(BenchmarkId::new("cache_key", "short"), |b| {
        b.iter(|| DnsQuery::parse(black_box(&short)))
    });
    group.bench_function(BenchmarkId::new("cache_key", "long"), |b| {
        b.iter(|| DnsQuery::parse(black_box(&long)))
    });
    group.finish();
}

fn bench_cache(c: &mut Criterion) {
    let response = vec![0xAB; 128];
    let domains = random_domains(1000);
    let keys: Vec<CacheKey> = domains.iter().map(|d| CacheKey::new(d, 1, 1)).collect();

    let cache = DnsCache::new(Duration::from_secs(3600));
    for key in &keys {
        cache.put(key, &response);
    }
    let missing = CacheKey::new("not-cached.example.org", 1, 1);

    let mut group = c.benchmark_group("cache");
    group.throughput(Throughput::Elements(1));

    group.bench_function(BenchmarkId::new("get", "hit"), |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            cache.get(black_box(&keys[i]))
        })
    });

    group.bench_function(BenchmarkId::new("get", "miss"), |b| {
        b.iter(|| cache.get(black_box(&missing)))
    });

    group.bench_function(BenchmarkId::new("put", "overwrite"), |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            cache.put(black_box(&keys[i]), black_box(&response))
        })
    });

    group.bench_function(BenchmarkId::new("put", "evicting"), |b| {
        let bounded = DnsCache::new(Duration::from_secs(3600)).with_max_entries(256);
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            bounded.put(black_box(&keys[i]), black_box(&response))
        })
    });

    group.finish();
}

fn bench_contended_get(c: &mut Criterion) {
    let cache = DnsCache::new(Duration::from_secs(3600));
    let key = CacheKey::new("example.com", 1, 1);
    cache.put(&key, &[0xCD; 128]);

    let (cache, key) = (&cache, &key);
    let mut group = c.benchmark_group("cache_contended");
    for threads in [1usize, 4, 8] {
        group.throughput(Throughput::Elements((threads * 1000) as u64));
        group.bench_with_input(BenchmarkId::new("get", threads), &threads, |b, &threads| {
            b.iter(|| {
                std::thread::scope(|s| {
                    for _ in 0..threads {
                        s.spawn(move || {
                            for _ in 0..1000 {
                                black_box(cache.get(key));
                            }
                        });
                    }
                })
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_parse, bench_cache, bench_contended_get);
criterion_main!(benches);
