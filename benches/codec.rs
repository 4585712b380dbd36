use cinderkv::*;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    group.bench_function("decode_1k", |b| {
        let lines: Vec<String> = (0..1000)
            .map(|i| format!("SET key{} value number {} EX {}", i, i, i + 1))
            .collect();
        b.iter(|| {
            for line in &lines {
                black_box(Command::decode(line).unwrap());
            }
        });
    });

    group.bench_function("encode_1k", |b| {
        let commands: Vec<Command> = (0..1000)
            .map(|i| Command::Set {
                key: format!("key{}", i),
                value: format!("value number {}", i),
                ttl: Some(i + 1),
            })
            .collect();
        b.iter(|| {
            for cmd in &commands {
                black_box(cmd.to_string());
            }
        });
    });

    group.finish();
}

fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");

    group.bench_function("set_get_1k", |b| {
        let store = Store::new();
        b.iter(|| {
            for i in 0..1000 {
                let key = format!("key{}", i & 0xff);
                store.set(&key, "value", None);
                black_box(store.get(&key));
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_codec, bench_store);
criterion_main!(benches);
