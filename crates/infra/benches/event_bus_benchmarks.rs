use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use chrono::NaiveDate;
use hrms_core::AggregateId;
use hrms_events::{
    DomainEvent, EmployeeCreated, EventMetadata, EventPayload, FnHandler, PublishContext,
    SubscriptionOptions,
};
use hrms_infra::config::{EventBusConfig, PublisherConfig};
use hrms_infra::event_bus::EventBus;
use hrms_infra::event_store::{EventStore, InMemoryEventStore, NewEventRecord};
use hrms_infra::publisher::{BatchEntry, BatchOptions, EventPublisher};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn hire(employee_id: AggregateId) -> DomainEvent {
    DomainEvent::new(EventPayload::EmployeeCreated(EmployeeCreated {
        employee_id,
        employee_code: "E-BENCH".to_string(),
        full_name: "Bench Mark".to_string(),
        department: None,
        hired_on: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
    }))
}

fn bus_with_handlers(config: EventBusConfig, handlers: usize) -> Arc<EventBus> {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let bus = Arc::new(EventBus::new(config, Some(store)));
    for i in 0..handlers {
        bus.subscribe(
            ["*"],
            Arc::new(FnHandler::new(format!("handler-{i}"), |_, _| Ok(()))),
            SubscriptionOptions::new().with_priority(i as i32),
        );
    }
    bus
}

/// Publish latency against the number of matching handlers, parallel vs sequential.
fn bench_dispatch_fan_out(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("dispatch_fan_out");

    for handlers in [1usize, 10, 50].iter() {
        for (mode, config) in [
            ("parallel", EventBusConfig::default()),
            ("sequential", EventBusConfig::default().sequential()),
        ] {
            let bus = bus_with_handlers(config, *handlers);
            group.bench_with_input(BenchmarkId::new(mode, handlers), handlers, |b, _| {
                b.iter(|| {
                    let event = hire(AggregateId::new());
                    rt.block_on(bus.publish(black_box(&event), None, None))
                });
            });
        }
    }

    group.finish();
}

/// Append throughput of a single aggregate stream.
fn bench_store_append(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("store_append");

    for batch in [1usize, 50, 500].iter() {
        group.throughput(Throughput::Elements(*batch as u64));
        group.bench_with_input(BenchmarkId::new("save_events", batch), batch, |b, &n| {
            let store = InMemoryEventStore::new();
            let employee = AggregateId::new();
            b.iter(|| {
                let records = (0..n)
                    .map(|_| NewEventRecord::new(hire(employee), EventMetadata::default()))
                    .collect();
                rt.block_on(store.save_events(black_box(records))).unwrap()
            });
        });
    }

    group.finish();
}

/// Batch publishing, concurrent vs transactional chunks.
fn bench_publish_batch(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("publish_batch");
    group.sample_size(50);

    for (name, options) in [
        ("concurrent", BatchOptions::default()),
        ("transactional", BatchOptions::default().transactional()),
    ] {
        let publisher = EventPublisher::new(
            bus_with_handlers(EventBusConfig::default(), 5),
            PublisherConfig::default(),
        );
        group.throughput(Throughput::Elements(200));
        group.bench_function(name, |b| {
            b.iter(|| {
                let entries: Vec<BatchEntry> = (0..200)
                    .map(|_| {
                        BatchEntry::new(hire(AggregateId::new()))
                            .with_context(PublishContext::for_user("bench"))
                    })
                    .collect();
                rt.block_on(publisher.publish_batch(black_box(entries), options))
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_dispatch_fan_out,
    bench_store_append,
    bench_publish_batch
);
criterion_main!(benches);
