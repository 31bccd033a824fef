//! Benchmarks for partition routing and the in-memory task queue.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fanout_core::config::DispatchConfig;
use fanout_core::decomposer::SyntheticJobConfig;
use fanout_core::dispatch::{partition_for, InMemoryQueue, PartitionService, PartitioningStrategy, QueueConsumer, QueueKey, QueueMsg, QueueProducer};
use fanout_core::events::LifecycleBus;
use fanout_core::jobs::{EntityId, Job, JobParams, JobType, NodeId, Task, TenantId};
use std::time::Duration;
use uuid::Uuid;

fn service(strategy: PartitioningStrategy) -> PartitionService {
    let config = DispatchConfig { partitioning_strategy: strategy, ..DispatchConfig::default() };
    PartitionService::new(config, NodeId::new("bench-node"), LifecycleBus::new(16))
}

fn tasks(n: usize) -> Vec<Task> {
    let job = Job::new(TenantId::new(), JobParams::Synthetic(SyntheticJobConfig::default()), "bench");
    (0..n).map(|_| Task::for_job(&job, Some(EntityId::new()), serde_json::Value::Null)).collect()
}

fn bench_partition_for(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition_for");
    let ids: Vec<Uuid> = (0..1_000).map(|_| Uuid::new_v4()).collect();
    for partitions in [1u32, 12, 128] {
        group.throughput(Throughput::Elements(ids.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(partitions), &partitions, |b, &p| {
            b.iter(|| { for id in &ids { black_box(partition_for(id, p)); } });
        });
    }
    group.finish();
}

fn bench_resolve_task(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_task");
    let batch = tasks(1_000);
    for (label, strategy) in [("tenant", PartitioningStrategy::Tenant), ("entity", PartitioningStrategy::Entity)] {
        let service = service(strategy);
        group.throughput(Throughput::Elements(batch.len() as u64));
        group.bench_function(label, |b| { b.iter(|| { for task in &batch { black_box(service.resolve_task(task)); } }); });
    }
    group.finish();
}

fn bench_cluster_assignment(c: &mut Criterion) {
    let mut group = c.benchmark_group("cluster_assignment");
    let key = QueueKey::tasks(JobType::Synthetic);
    for nodes in [1usize, 3, 16] {
        let service = service(PartitioningStrategy::Tenant);
        service.register_queue(key.clone());
        let members: Vec<NodeId> = (0..nodes).map(|i| NodeId::new(format!("node-{}", i))).chain(std::iter::once(NodeId::new("bench-node"))).collect();
        service.update_cluster(members);
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &key, |b, k| { b.iter(|| black_box(service.my_partitions(k))); });
    }
    group.finish();
}

fn bench_queue_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_round_trip");
    let runtime = tokio::runtime::Runtime::new().unwrap();
    for size in [100usize, 1_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &n| {
            b.to_async(&runtime).iter(|| async move {
                let service = service(PartitioningStrategy::Entity);
                let queue = InMemoryQueue::<Task>::new();
                let mut consumer = queue.consumer("bench", n);
                consumer.subscribe(service.all_partitions(&QueueKey::tasks(JobType::Synthetic))).await.unwrap();
                for task in tasks(n) {
                    let tpi = service.resolve_task(&task);
                    queue.send(&tpi, QueueMsg::new(task.id, task)).await.unwrap();
                }
                let mut received = 0;
                while received < n {
                    received += consumer.poll(Duration::ZERO).await.unwrap().len();
                }
                consumer.commit().await.unwrap();
                black_box(received)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_partition_for, bench_resolve_task, bench_cluster_assignment, bench_queue_round_trip);
criterion_main!(benches);
