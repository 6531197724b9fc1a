use criterion::{black_box, criterion_group, criterion_main, Criterion};
use durablemap::{AppendableValuesMap, DurableMap, DurableMapConfig, Native, Str};
use rustc_hash::FxHashSet;
use std::collections::HashMap;
use std::time::Duration;
use tempfile::tempdir;

/// Deterministic key-value pairs: values are 1..=250 alphanumeric bytes
fn generate_data(size: usize) -> Vec<(u64, String)> {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut state = 0x2545_f491_4f6c_dd1du64;
    let mut next = move || {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    (0..size)
        .map(|_| {
            let key = next();
            let value_len = (next() % 250 + 1) as usize;
            let value = (0..value_len)
                .map(|_| CHARSET[(next() % CHARSET.len() as u64) as usize] as char)
                .collect();
            (key, value)
        })
        .collect()
}

fn benchmark_durable_map(c: &mut Criterion) {
    for &size in &[10_000, 100_000] {
        let mut group = c.benchmark_group(format!("durable_map_size={}", size));
        if size >= 100_000 {
            group.sample_size(10);
            group.measurement_time(Duration::from_secs(30));
        }

        let data = generate_data(size);

        group.bench_function("std::HashMap - insert", |b| {
            b.iter(|| {
                let mut map = HashMap::new();
                for (k, v) in data.iter() {
                    map.insert(black_box(*k), black_box(v.clone()));
                }
            })
        });

        group.bench_function("DurableMap<Mmap> - put", |b| {
            b.iter_with_setup(
                || {
                    let dir = tempdir().unwrap();
                    let map: DurableMap<Native<u64>, Str> =
                        DurableMap::open(dir.path(), DurableMapConfig::default()).unwrap();
                    (dir, map)
                },
                |(_dir, map)| {
                    for (k, v) in data.iter() {
                        map.put(black_box(k), Some(black_box(v))).unwrap();
                    }
                },
            );
        });

        let get_dir = tempdir().unwrap();
        let map: DurableMap<Native<u64>, Str> =
            DurableMap::open(get_dir.path(), DurableMapConfig::default()).unwrap();
        for (k, v) in data.iter() {
            map.put(k, Some(v)).unwrap();
        }
        group.bench_function("DurableMap<Mmap> - get", |b| {
            b.iter(|| {
                for (k, _) in data.iter() {
                    black_box(map.get(black_box(k)).unwrap());
                }
            })
        });

        group.bench_function("AppendableValuesMap<Mmap> - append", |b| {
            b.iter_with_setup(
                || {
                    let dir = tempdir().unwrap();
                    let map: AppendableValuesMap<Native<u64>, Native<u64>> =
                        AppendableValuesMap::open(dir.path(), DurableMapConfig::default())
                            .unwrap();
                    for key in 0..100u64 {
                        map.put(&key, Some(&FxHashSet::default())).unwrap();
                    }
                    (dir, map)
                },
                |(_dir, map)| {
                    for (i, (item, _)) in data.iter().enumerate() {
                        let key = i as u64 % 100;
                        let mut items = map.items(&key).unwrap().unwrap();
                        items.append(black_box(item)).unwrap();
                    }
                },
            );
        });
        group.finish();
    }
}

criterion_group!(benches, benchmark_durable_map);
criterion_main!(benches);
