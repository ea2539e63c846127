//! Route resolution and presence benchmarks for beacon-core.

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde::{Deserialize, Serialize};
use tenvis_beacon_core::{
    BoxError, CommandHandler, ConnectionContext, LocalPresenceCache, TopicRouteTable,
};

#[derive(Serialize)]
struct Alert {
    text: String,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct Coordinates {
    lat: f64,
    lon: f64,
}

struct GpsHandler;

#[async_trait]
impl CommandHandler<Coordinates> for GpsHandler {
    async fn handle(&self, _: &Coordinates, _: &ConnectionContext) -> Result<(), BoxError> {
        Ok(())
    }
}

fn route_table() -> TopicRouteTable {
    let mut table = TopicRouteTable::new();
    table.bind_outbound_json::<Alert>("alert").unwrap();
    table
        .bind_inbound_json::<Coordinates, GpsHandler>("gps")
        .unwrap();
    table
}

fn bench_route_resolution(c: &mut Criterion) {
    let table = route_table();
    let alert = Alert {
        text: "x".repeat(64),
    };

    let mut group = c.benchmark_group("routes");
    group.bench_function("resolve_outbound", |b| {
        b.iter(|| table.resolve_outbound::<Alert>().map(|route| route.topic().len()))
    });
    group.bench_function("resolve_and_serialize", |b| {
        b.iter(|| {
            table
                .resolve_outbound::<Alert>()
                .unwrap()
                .serialize(black_box(&alert))
        })
    });
    group.bench_function("resolve_and_decode", |b| {
        b.iter(|| {
            table
                .resolve_inbound(black_box("gps"))
                .unwrap()
                .decode(black_box(r#"{"lat":51.5,"lon":-0.12}"#))
        })
    });
    group.finish();
}

fn bench_presence(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("presence");
    for users in [1usize, 100, 10_000] {
        let presence = LocalPresenceCache::new("bench");
        rt.block_on(async {
            for i in 0..users {
                presence.add(&format!("user-{i}"), &format!("conn-{i}")).await;
            }
        });

        group.bench_with_input(BenchmarkId::new("add_remove", users), &users, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    presence.add("user-0", "extra").await;
                    presence.remove("user-0", "extra").await
                })
            })
        });
        group.bench_with_input(BenchmarkId::new("owns", users), &users, |b, _| {
            b.iter(|| presence.owns(black_box("conn-0")))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_route_resolution, bench_presence);
criterion_main!(benches);
