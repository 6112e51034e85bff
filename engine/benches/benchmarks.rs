//! Performance benchmarks for rowsync-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rowsync_engine::{
    decide, map_event, ChangeEvent, ConflictResolutionConfig, Direction, MappingDocument,
    MappingRegistry, Operation, ResolveContext, ResolverRegistry, Row, SemanticType,
    StrategyKind, System, SystemNames, TableMapping,
};
use serde_json::json;

fn create_registry() -> MappingRegistry {
    let mut registry =
        MappingRegistry::from_document(MappingDocument::builtin(), SystemNames::default())
            .expect("builtin mappings are valid");
    registry
        .register_mapping(
            TableMapping::new(System::A, "wide", "wide")
                .column("id", "id", SemanticType::Integer)
                .column("c_bool", "c_bool", SemanticType::Boolean)
                .column("c_ts", "c_ts", SemanticType::Timestamp)
                .column("c_json", "c_json", SemanticType::Json)
                .column("c_dec", "c_dec", SemanticType::Decimal)
                .column("c_uuid", "c_uuid", SemanticType::Uuid)
                .with_conflict_resolution(ConflictResolutionConfig::timestamp("c_ts")),
        )
        .expect("wide mapping is valid");
    registry
        .derive_reverse_mappings()
        .expect("reverse mappings derive");
    registry
}

fn product_row(id: u64) -> Row {
    json!({
        "product_id": id,
        "product_name": format!("Product {id}"),
        "product_desc": "A thing",
        "price": "19.99",
        "stock_qty": 12,
        "category_id": 3,
        "created_time": "2024-01-01 00:00:00",
        "updated_time": "2024-06-01 12:00:00.250",
        "product_status": "active",
        "product_data": "{\"color\":\"red\",\"tags\":[\"a\",\"b\"]}",
        "internal_notes": "skip me"
    })
    .as_object()
    .cloned()
    .unwrap_or_default()
}

fn bench_mapping(c: &mut Criterion) {
    let mut group = c.benchmark_group("mapping");
    let registry = create_registry();

    group.bench_function("map_product_a_to_b", |b| {
        let mapping = registry.get_mapping("mysql", "products").expect("mapping");
        let event = ChangeEvent::new(Operation::Update, "mysql", "products", 1000)
            .with_after(product_row(1));
        b.iter(|| map_event(black_box(&event), mapping, Direction::AToB, registry.lookups()))
    });

    group.bench_function("map_wide_b_to_a", |b| {
        let mapping = registry.get_mapping("postgres", "wide").expect("mapping");
        let row = json!({
            "id": 1,
            "c_bool": true,
            "c_ts": "2024-06-01T12:00:00.250Z",
            "c_json": {"nested": {"k": [1, 2, 3]}},
            "c_dec": 12.5,
            "c_uuid": "67e55044-10b1-426f-9247-bb680e5fe0c8"
        })
        .as_object()
        .cloned()
        .unwrap_or_default();
        let event = ChangeEvent::new(Operation::Update, "postgres", "wide", 1000).with_after(row);
        b.iter(|| map_event(black_box(&event), mapping, Direction::BToA, registry.lookups()))
    });

    group.finish();
}

fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    for size in [10usize, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("derive_reverse", size), size, |b, &size| {
            b.iter_with_setup(
                || {
                    let mut registry = MappingRegistry::new(SystemNames::default());
                    for i in 0..size {
                        registry
                            .register_mapping(
                                TableMapping::new(System::A, format!("t{i}"), format!("t{i}"))
                                    .column("id", "id", SemanticType::Integer)
                                    .column("name", "name", SemanticType::Text),
                            )
                            .expect("valid mapping");
                    }
                    registry
                },
                |mut registry| registry.derive_reverse_mappings(),
            )
        });
    }

    group.bench_function("get_mapping_alias", |b| {
        let registry = create_registry();
        b.iter(|| registry.get_mapping(black_box("MySQL"), black_box("orders")))
    });

    group.finish();
}

fn bench_conflict(c: &mut Criterion) {
    let mut group = c.benchmark_group("conflict");
    let registry = create_registry();
    let resolvers = ResolverRegistry::new();
    let mapping = registry.get_mapping("mysql", "products").expect("mapping");
    let strategy = mapping.strategy(StrategyKind::Timestamp).expect("strategy");

    group.bench_function("decide_timestamp_update", |b| {
        let event = ChangeEvent::new(Operation::Update, "mysql", "products", 1_717_243_200_000)
            .with_after(product_row(1));
        let mapped = map_event(&event, mapping, Direction::AToB, registry.lookups()).expect("maps");
        let target = json!({"id": 1, "updated_at": "2024-06-01T00:00:00Z"})
            .as_object()
            .cloned()
            .unwrap_or_default();

        b.iter(|| {
            let ctx = ResolveContext {
                event: &event,
                direction: Direction::AToB,
                mapped: &mapped.values,
                target: Some(&target),
            };
            decide(black_box(&ctx), &strategy, &resolvers)
        })
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    let envelope = json!({
        "schema": {},
        "payload": {
            "before": null,
            "after": product_row(1),
            "source": {"name": "mysql", "db": "legacy_db", "table": "products", "ts_ms": 1000},
            "op": "c",
            "ts_ms": 1001
        }
    })
    .to_string();

    group.bench_function("envelope_from_bytes", |b| {
        b.iter(|| ChangeEvent::decode(black_box(envelope.as_bytes()), Some("mysql")))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_mapping,
    bench_registry,
    bench_conflict,
    bench_decode
);
criterion_main!(benches);
