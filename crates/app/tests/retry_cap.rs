//! Retry-cap behavior: a parked envelope whose dependency never truly
//! arrives is permanently removed after the cap.

use std::sync::Arc;

use serde_json::json;

use coterie_core::{DepRef, EventId};
use coterie_handlers::resolve_deps::ResolveDeps;
use coterie_pipeline::{Dispatcher, Envelope, HandlerRegistry, Outcome};
use coterie_store::blocked;

#[tokio::test]
async fn rewakes_against_an_unsatisfiable_dep_hit_the_cap() {
    let pool = coterie_store::open_in_memory().await.unwrap();
    coterie_store::run_migrations(&pool, []).await.unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(ResolveDeps)).unwrap();
    let cap = 3;
    let dispatcher = Dispatcher::new(Arc::new(registry), pool.clone(), cap);

    // Park an envelope on a dep id that will be "announced" but never
    // actually stored, so every rewake re-parks it.
    let phantom = EventId::from_bytes([7; 16]);
    let missing = [DepRef::parse(&format!("peer:{}", phantom.to_hex())).unwrap()];
    let parked = Envelope {
        event_plaintext: Some(json!({"type": "message"})),
        ..Envelope::default()
    };
    {
        let mut conn = pool.acquire().await.unwrap();
        blocked::park(&mut conn, "stuck", &parked, &missing, 100).await.unwrap();
    }

    // Announce the arrival repeatedly; the event store never holds it.
    let trigger = Envelope {
        event_id: Some(phantom),
        validated: true,
        stored: true,
        deps_included_and_valid: true,
        ..Envelope::default()
    };

    let mut dropped = false;
    for _ in 0..cap + 2 {
        let report = dispatcher.run(vec![trigger.clone()]).await.unwrap();
        dropped |= report
            .outcomes
            .iter()
            .any(|o| matches!(o, Outcome::Dropped { reason, .. } if reason.contains("retry cap")));
    }
    assert!(dropped, "the rewoken envelope should eventually exceed the cap");

    // Removed from the blocked table for good: no rows, nothing to rewake.
    let mut conn = pool.acquire().await.unwrap();
    assert_eq!(blocked::count(&mut conn).await.unwrap(), 0);
    assert!(blocked::take_for_dep(&mut conn, &phantom.to_hex())
        .await
        .unwrap()
        .is_empty());
}
