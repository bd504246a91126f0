use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;

use coterie_handlers::canonical;

fn bench_canonical(c: &mut Criterion) {
    let plaintext = json!({
        "type": "message",
        "content": "a realistic chat line for the hot path",
        "channel_id": "00112233445566778899aabbccddeeff",
        "group_id": "ffeeddccbbaa99887766554433221100",
        "group_member_id": "0f1e2d3c4b5a69788796a5b4c3d2e1f0",
        "created_at_ms": 1_700_000_000_000i64,
        "deps": [
            "peer:00112233445566778899aabbccddeeff",
            "channel:00112233445566778899aabbccddeeff"
        ],
        "signature": "ab".repeat(64),
    });

    c.bench_function("padded_canonical", |b| {
        b.iter(|| canonical::padded_canonical(&plaintext).unwrap())
    });
    c.bench_function("compute_event_id", |b| {
        b.iter(|| canonical::compute_event_id(&plaintext).unwrap())
    });
}

criterion_group!(benches, bench_canonical);
criterion_main!(benches);
