use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use piped::config::{Config, Topology};
use piped::core::{Listener, ListenerKind};
use piped::remote::memory::MemoryFactory;
use piped::remote::EndpointSettings;
use piped::{Context, Dispatcher, Payload, RemotePool};
use std::sync::Arc;
use tokio::runtime::Runtime;

/// 构建 `groups` 个冗余组, 每组三个后端, 第一个后端处于下线状态
fn build_pool(rt: &Runtime, groups: usize, scheme: &str) -> (Arc<Context>, Arc<RemotePool>) {
    let mut config = Config::default();
    config.servers = Topology::new(
        (0..groups)
            .map(|g| {
                (0..3)
                    .map(|b| format!("{}://backend-{}-{}:{}", scheme, g, b, 9000 + b))
                    .collect()
            })
            .collect(),
    );
    config.pool.monitor_delay_ms = 3_600_000;

    let ctx = Context::new(config);
    let factory = MemoryFactory::new(EndpointSettings::default());
    let pool = RemotePool::new(Arc::clone(&ctx), factory);

    rt.block_on(async {
        pool.connect_to_servers(|_| {}).await.unwrap();
        for g in 0..groups {
            let name = format!("{}://backend-{}-0:9000", scheme, g);
            pool.endpoint(&name).await.unwrap().mark_down();
        }
        pool.refresh_live_set().await;
    });

    (ctx, pool)
}

/// 健康检查: 重新计算存活集合
fn bench_health_check(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("health_check");

    for groups in [1usize, 10, 100].iter() {
        let (_, pool) = build_pool(&rt, *groups, "tcp");
        group.bench_with_input(BenchmarkId::new("groups", groups), groups, |b, _| {
            b.to_async(&rt).iter(|| {
                let pool = Arc::clone(&pool);
                async move {
                    black_box(pool.health_check().await);
                }
            });
        });
        pool.shutdown();
    }

    group.finish();
}

/// 分发: 一个 UDP 数据包扇出到所有存活后端
fn bench_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("dispatch");
    let listener = Listener::new(ListenerKind::Udp, "udp");
    let payload = Payload::Data(Bytes::from_static(b"piped.bench.counter:1|c\n"));

    for groups in [1usize, 10, 100].iter() {
        let (ctx, pool) = build_pool(&rt, *groups, "udp");
        let dispatcher = Dispatcher::new(ctx, Arc::clone(&pool));
        group.bench_with_input(BenchmarkId::new("groups", groups), groups, |b, _| {
            b.iter(|| black_box(dispatcher.dispatch(&listener, &payload)));
        });
        pool.shutdown();
    }

    group.finish();
}

criterion_group!(benches, bench_health_check, bench_dispatch);
criterion_main!(benches);
