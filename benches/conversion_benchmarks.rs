use criterion::{black_box, criterion_group, criterion_main, Criterion};
use kube_fleet_manager::conversions::{to_bytes, to_cpus};

fn cpu_parsing_benchmark(c: &mut Criterion) {
    let test_values = vec!["100m", "1", "0.5", "2.5", "500m", "1500m", "4"];

    c.bench_function("to_cpus", |b| {
        b.iter(|| {
            for value in &test_values {
                black_box(to_cpus(black_box(value)));
            }
        })
    });
}

fn memory_parsing_benchmark(c: &mut Criterion) {
    let test_values = vec![
        "1Ki", "1Mi", "1Gi", "1k", "1M", "1G", "512Mi", "2.5Gi", "1024",
    ];

    c.bench_function("to_bytes", |b| {
        b.iter(|| {
            for value in &test_values {
                black_box(to_bytes(black_box(value)));
            }
        })
    });
}

criterion_group!(benches, cpu_parsing_benchmark, memory_parsing_benchmark);
criterion_main!(benches);
