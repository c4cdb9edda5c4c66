use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::{Duration, Utc};
use tenantflow_core::{JobId, TenantId};
use tenantflow_infra::operator::Signal;
use tenantflow_infra::operator::policy::evaluate;
use tenantflow_infra::rate_limit::{
    CounterKey, CounterStore, InMemoryCounterStore, ResourceClass, SlidingWindow,
};

fn bench_sliding_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("sliding_window");
    let window = Duration::seconds(60);

    for cap in [10u32, 100, 1_000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("try_consume_saturated", cap), &cap, |b, &cap| {
            let mut w = SlidingWindow::new();
            let start = Utc::now();
            for i in 0..cap {
                w.try_consume(start + Duration::milliseconds(i as i64), window, cap);
            }
            let mut tick = 0i64;
            b.iter(|| {
                tick += 1;
                black_box(w.try_consume(start + Duration::milliseconds(tick), window, cap))
            });
        });
    }

    group.finish();
}

fn bench_counter_store(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("in_memory_counter_store");
    let window = Duration::seconds(3600);

    for tenants in [10usize, 1_000] {
        let store = InMemoryCounterStore::new(tenants);
        let keys: Vec<CounterKey> = (0..tenants)
            .map(|_| CounterKey::new(TenantId::new(), ResourceClass::AiResponse))
            .collect();

        group.throughput(Throughput::Elements(keys.len() as u64));
        group.bench_with_input(BenchmarkId::new("try_consume_all_tenants", tenants), &keys, |b, keys| {
            b.iter(|| {
                rt.block_on(async {
                    let now = Utc::now();
                    for key in keys {
                        black_box(store.try_consume(key, window, 1_000, now).await.expect("consume"));
                    }
                })
            });
        });
    }

    group.finish();
}

fn bench_operator_policy(c: &mut Criterion) {
    let mut group = c.benchmark_group("operator_policy");
    let tenants: Vec<TenantId> = (0..50).map(|_| TenantId::new()).collect();
    let signals: Vec<Signal> = tenants
        .iter()
        .cycle()
        .take(200)
        .enumerate()
        .map(|(i, t)| {
            if i % 2 == 0 {
                Signal::StuckJob {
                    tenant_id: *t,
                    job_id: JobId::new(),
                    idle_secs: 1_200,
                }
            } else {
                Signal::WebhookFailures {
                    tenant_id: *t,
                    failures: 10,
                }
            }
        })
        .collect();

    group.throughput(Throughput::Elements(signals.len() as u64));
    group.bench_function("evaluate_200_signals", |b| {
        b.iter(|| black_box(evaluate(black_box(&signals), 20)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_sliding_window,
    bench_counter_store,
    bench_operator_policy
);
criterion_main!(benches);
